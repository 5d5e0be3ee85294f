use anyhow::Result;
use async_trait::async_trait;
use rfsynth::adapters::layout::parse_layout;
use rfsynth::adapters::report::HistorySummary;
use rfsynth::adapters::solver::AnalyticSolver;
use rfsynth::core::context::{CancelSignal, ExecutionContext};
use rfsynth::core::driver::{SimulationDriver, SolverSettings};
use rfsynth::core::mesh::MeshConverter;
use rfsynth::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
use rfsynth::domain::ports::{SolverBackend, Storage};
use rfsynth::domain::simulation::{SimulationResult, SolverConfiguration};
use rfsynth::{DesignConfig, DesignEngine, ElectricalTarget, LocalStorage, RfError, StructureKind, SubstrateStack};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Answers like the analytic model on the first call and crashes afterwards.
struct CrashesAfterFirstRun {
    model: AnalyticSolver,
    calls: AtomicUsize,
}

#[async_trait]
impl SolverBackend for CrashesAfterFirstRun {
    fn name(&self) -> &str {
        "crashes_after_first_run"
    }

    async fn invoke(
        &self,
        config: &SolverConfiguration,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> rfsynth::Result<SimulationResult> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return self.model.invoke(config, ctx, cancel).await;
        }
        Err(RfError::SolverInvocationError {
            message: "solver exited with exit status: 1".to_string(),
            diagnostics: "segmentation fault".to_string(),
        })
    }
}

fn design(name: &str, structure: StructureKind, target: ElectricalTarget, out: &TempDir) -> DesignConfig {
    let mut config = DesignConfig::two_layer(
        name,
        structure,
        target,
        SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02),
    );
    config.output.path = out.path().to_string_lossy().into_owned();
    config
}

fn analytic(impedance_scale: f64, frequency_scale: f64) -> SolverSettings {
    SolverSettings {
        impedance_scale,
        frequency_scale,
        ..SolverSettings::default()
    }
}

#[tokio::test]
async fn test_layout_only_run_writes_artifacts() -> Result<()> {
    let out = TempDir::new()?;
    let config = design("ms_dry", StructureKind::Microstrip, ElectricalTarget::new(50.0, 2.4e9), &out);
    let storage = LocalStorage::new(config.output.path.clone());
    let engine = config.build_engine(storage.clone())?;
    let ctx = ExecutionContext::init("run_dry", Some(out.path()))?;

    let outcome = engine.run(&config.to_request(), &ctx, &CancelSignal::never()).await?;
    assert_eq!(outcome.converged, None);
    assert!(outcome.metrics.is_none());
    assert!(outcome.history.is_empty());
    assert_eq!(outcome.layout_path, "ms_dry/ms_dry.kicad_pcb");
    assert!(outcome.artifacts.iter().any(|a| a == "ms_dry/iteration_01/domain.json"));

    let layout = String::from_utf8(storage.read_file(&outcome.layout_path).await?)?;
    let parsed = parse_layout(&layout)?;
    assert_eq!(parsed, outcome.board);

    let bundle = storage.read_file("ms_dry/design_bundle.zip").await?;
    let archive = zip::ZipArchive::new(Cursor::new(bundle))?;
    let names: Vec<&str> = archive.file_names().collect();
    assert!(names.contains(&"fabrication/ms_dry-F_Cu.gbr"));
    assert!(names.contains(&"fabrication/stackup.json"));
    assert!(names.contains(&"ms_dry.kicad_pcb"));
    assert!(names.contains(&"history.json"));

    assert!(ctx.ledger().is_clean());
    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_microstrip_feedback_corrects_impedance_offset() -> Result<()> {
    let out = TempDir::new()?;
    let mut config = design("ms_fb", StructureKind::Microstrip, ElectricalTarget::new(50.0, 2.4e9), &out);
    config.solver = Some(analytic(1.04, 1.0));
    let storage = LocalStorage::new(config.output.path.clone());
    let engine = config.build_engine(storage.clone())?;
    let ctx = ExecutionContext::init("run_fb", Some(out.path()))?;

    let outcome = engine.run(&config.to_request(), &ctx, &CancelSignal::never()).await?;

    assert_eq!(outcome.converged, Some(true));
    assert!(outcome.history.len() >= 2, "the offset needs at least one correction");
    let first = &outcome.history[0];
    assert!(first.error > 1.5, "first error {}", first.error);
    let z = outcome.metrics.as_ref().and_then(|m| m.line_impedance_ohms).unwrap_or_default();
    assert!((z - 50.0).abs() <= config.feedback.impedance_tolerance_ohms, "final {}", z);
    let last = outcome.history.last().map(|r| r.synthesis_target.impedance_ohms).unwrap_or_default();
    assert!(last < 50.0, "synthesis target should move below the desired value, got {}", last);

    let iteration_two = storage.read_file("ms_fb/iteration_02/sparams.csv").await?;
    assert!(String::from_utf8(iteration_two)?.starts_with("frequency_hz,z_in_magnitude_ohms,s11_db"));

    let summary: HistorySummary = serde_json::from_slice(&storage.read_file("ms_fb/history.json").await?)?;
    assert!(summary.converged);
    assert_eq!(summary.iterations, outcome.history.len());

    let bundle = storage.read_file("ms_fb/design_bundle.zip").await?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bundle))?;
    let results = archive.file_names().filter(|n| n.ends_with("/sparams.csv")).count();
    assert_eq!(results, outcome.history.len());
    let mut bundled = Vec::new();
    archive.by_name("iteration_02/sparams.csv")?.read_to_end(&mut bundled)?;
    assert_eq!(bundled, storage.read_file("ms_fb/iteration_02/sparams.csv").await?);

    assert!(ctx.ledger().is_clean());
    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_patch_feedback_corrects_resonance_shift() -> Result<()> {
    let out = TempDir::new()?;
    let mut config = design("patch_fb", StructureKind::Patch, ElectricalTarget::new(50.0, 2.4e9), &out);
    config.solver = Some(analytic(1.0, 0.97));
    let engine = config.build_engine(LocalStorage::new(config.output.path.clone()))?;
    let ctx = ExecutionContext::init("run_patch", Some(out.path()))?;

    let outcome = engine.run(&config.to_request(), &ctx, &CancelSignal::never()).await?;

    assert_eq!(outcome.converged, Some(true));
    assert!(outcome.history.len() <= 4);
    let metrics = outcome.metrics.as_ref().expect("metrics after simulation");
    let tolerance = config.feedback.frequency_tolerance_rel * 2.4e9;
    assert!((metrics.resonant_frequency_hz - 2.4e9).abs() <= tolerance);
    assert!(metrics.min_s11_db < -10.0);
    let far_field = metrics.far_field.expect("patch pattern");
    assert!(far_field.peak_gain_dbi > 2.0);
    assert!(far_field.peak_theta_deg.abs() < 1e-9);

    let first_target = outcome.history[0].synthesis_target.frequency_hz;
    let last_target = outcome.history.last().map(|r| r.synthesis_target.frequency_hz).unwrap_or_default();
    assert!(last_target > first_target);

    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_unfixable_offset_reports_best_iteration() -> Result<()> {
    let out = TempDir::new()?;
    let mut config = design("ms_stuck", StructureKind::Microstrip, ElectricalTarget::new(50.0, 2.4e9), &out);
    config.solver = Some(analytic(1.3, 1.0));
    config.feedback.max_iterations = 2;
    config.feedback.max_step_fraction = 0.05;
    let storage = LocalStorage::new(config.output.path.clone());
    let engine = config.build_engine(storage.clone())?;
    let ctx = ExecutionContext::init("run_stuck", Some(out.path()))?;

    let err = engine
        .run(&config.to_request(), &ctx, &CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 4);
    let best = err.best_iteration().expect("best iteration attached");
    assert!(best.error > 0.0);

    let summary: HistorySummary = serde_json::from_slice(&storage.read_file("ms_stuck/history.json").await?)?;
    assert!(!summary.converged);
    assert_eq!(summary.iterations, 2);

    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_gcpw_layout_carries_via_fence() -> Result<()> {
    let out = TempDir::new()?;
    let config = design("cpw", StructureKind::Gcpw, ElectricalTarget::new(50.0, 5.0e9), &out);
    let engine = config.build_engine(LocalStorage::new(config.output.path.clone()))?;
    let ctx = ExecutionContext::init("run_cpw", Some(out.path()))?;

    let outcome = engine.run(&config.to_request(), &ctx, &CancelSignal::never()).await?;
    assert!(!outcome.board.vias.is_empty());
    assert!(outcome.board.vias.iter().all(|v| v.net.as_deref() == Some("GND")));
    assert!(outcome.board.ports.iter().any(|p| p.excite));

    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_solver_crash_on_second_iteration_keeps_history() -> Result<()> {
    let out = TempDir::new()?;
    let storage = LocalStorage::new(out.path().to_string_lossy().into_owned());
    let backend = Arc::new(CrashesAfterFirstRun {
        model: AnalyticSolver::new(1.06, 1.0),
        calls: AtomicUsize::new(0),
    });
    let engine = DesignEngine::new(
        storage.clone(),
        GeometrySynthesizer::new(StructureKind::Microstrip, SynthesisConfig::default()),
        MeshConverter::default(),
    )
    .with_driver(SimulationDriver::new(backend.clone(), &SolverSettings::default()));
    let request = DesignConfig::two_layer(
        "ms_crash",
        StructureKind::Microstrip,
        ElectricalTarget::new(50.0, 2.4e9),
        SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02),
    )
    .to_request();
    let ctx = ExecutionContext::init("run_crash", Some(out.path()))?;

    let err = engine
        .run(&request, &ctx, &CancelSignal::never())
        .await
        .unwrap_err();

    // One good run, then the failing attempt and its retry.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    assert!(matches!(err, RfError::FeedbackInterrupted { iterations: 1, .. }));
    assert!(matches!(err.root_cause(), RfError::SolverInvocationError { .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(err.diagnostics(), Some("segmentation fault"));
    let best = err.best_iteration().expect("first iteration attached");
    assert_eq!(best.iteration, 1);
    assert!(best.error > 1.5);

    assert!(storage.read_file("ms_crash/iteration_01/sparams.csv").await.is_ok());
    let summary: HistorySummary = serde_json::from_slice(&storage.read_file("ms_crash/history.json").await?)?;
    assert!(!summary.converged);
    assert_eq!(summary.iterations, 1);

    assert!(ctx.ledger().is_clean());
    ctx.teardown()?;
    Ok(())
}
