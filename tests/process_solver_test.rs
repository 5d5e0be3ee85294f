#![cfg(all(unix, feature = "cli"))]

use anyhow::Result;
use rfsynth::core::context::{cancellation, CancelSignal, ExecutionContext};
use rfsynth::core::driver::{SolverKind, SolverSettings};
use rfsynth::utils::monitor::is_process_alive;
use rfsynth::{DesignConfig, ElectricalTarget, LocalStorage, RfError, StructureKind, SubstrateStack};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config_with_command(out: &TempDir, script: String, timeout_secs: u64) -> DesignConfig {
    let mut config = DesignConfig::two_layer(
        "ms_process",
        StructureKind::Microstrip,
        ElectricalTarget::new(50.0, 2.4e9),
        SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02),
    );
    config.output.path = out.path().join("artifacts").to_string_lossy().into_owned();
    config.solver = Some(SolverSettings {
        backend: SolverKind::Process,
        command: vec!["sh".to_string(), "-c".to_string(), script],
        timeout_secs,
        frequency_points: 11,
        ..SolverSettings::default()
    });
    config
}

fn read_pid(out: &TempDir) -> Result<u32> {
    Ok(std::fs::read_to_string(out.path().join("pid"))?.trim().parse()?)
}

#[tokio::test]
async fn test_timeout_kills_solver_and_releases_resources() -> Result<()> {
    let out = TempDir::new()?;
    let script = format!("echo $$ > {}/pid; exec sleep 30", out.path().display());
    let config = config_with_command(&out, script, 1);
    let engine = config.build_engine(LocalStorage::new(config.output.path.clone()))?;
    let ctx = ExecutionContext::init("run_timeout", Some(out.path()))?;

    let started = Instant::now();
    let err = engine
        .run(&config.to_request(), &ctx, &CancelSignal::never())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(20));
    match &err {
        RfError::SolverInvocationError { message, .. } => assert!(message.contains("timed out"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.exit_code(), 3);

    assert!(ctx.ledger().is_clean());
    assert_eq!(ctx.ledger().live_work_dirs(), 0);
    assert!(!is_process_alive(read_pid(&out)?));

    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_cancellation_stops_running_solver() -> Result<()> {
    let out = TempDir::new()?;
    let script = format!("echo $$ > {}/pid; exec sleep 30", out.path().display());
    let config = config_with_command(&out, script, 600);
    let engine = config.build_engine(LocalStorage::new(config.output.path.clone()))?;
    let ctx = ExecutionContext::init("run_cancel", Some(out.path()))?;
    let (handle, signal) = cancellation();

    let pid_file = out.path().join("pid");
    let canceller = tokio::spawn(async move {
        for _ in 0..100 {
            if pid_file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.cancel();
    });

    let started = Instant::now();
    let err = engine.run(&config.to_request(), &ctx, &signal).await.unwrap_err();
    canceller.await?;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(matches!(err, RfError::SolverInvocationError { .. }));
    assert!(ctx.ledger().is_clean());
    assert!(!is_process_alive(read_pid(&out)?));

    ctx.teardown()?;
    Ok(())
}

#[tokio::test]
async fn test_failing_solver_reports_diagnostics() -> Result<()> {
    let out = TempDir::new()?;
    let config = config_with_command(
        &out,
        "echo 'port 1 outside mesh' >&2; exit 7".to_string(),
        30,
    );
    let engine = config.build_engine(LocalStorage::new(config.output.path.clone()))?;
    let ctx = ExecutionContext::init("run_fail", Some(out.path()))?;

    let err = engine
        .run(&config.to_request(), &ctx, &CancelSignal::never())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(err.diagnostics().unwrap_or_default().contains("port 1 outside mesh"));
    assert!(ctx.ledger().is_clean());

    ctx.teardown()?;
    Ok(())
}
