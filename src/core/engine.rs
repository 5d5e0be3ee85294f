use serde::{Deserialize, Serialize};

use crate::adapters::fabrication::{bundle_zip, fabrication_files};
use crate::adapters::layout::write_layout;
use crate::adapters::report::{history_summary, sparams_csv};
use crate::core::analysis::ResultAnalyzer;
use crate::core::board::BoardModelBuilder;
use crate::core::context::{CancelSignal, ExecutionContext};
use crate::core::driver::SimulationDriver;
use crate::core::feedback::{FeedbackConfig, FeedbackLoop};
use crate::core::mesh::MeshConverter;
use crate::core::synthesis::GeometrySynthesizer;
use crate::domain::board::BoardModel;
use crate::domain::model::{ElectricalTarget, Geometry, IterationRecord, SubstrateStack};
use crate::domain::ports::Storage;
use crate::domain::simulation::{DesignMetrics, FrequencyRange, SimulationDomain, SimulationResult};
use crate::utils::error::{Result, RfError};
use crate::utils::monitor::{Phase, SystemMonitor};

/// One design to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRequest {
    pub name: String,
    pub target: ElectricalTarget,
    pub stack: SubstrateStack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignOutcome {
    pub name: String,
    pub geometry: Geometry,
    pub board: BoardModel,
    /// `None` when no solver was configured.
    pub converged: Option<bool>,
    pub metrics: Option<DesignMetrics>,
    pub history: Vec<IterationRecord>,
    /// Storage path of the final layout file.
    pub layout_path: String,
    pub artifacts: Vec<String>,
}

/// Runs synthesis, layout, meshing, simulation and feedback for one request.
///
/// Every iteration writes its own artifact directory through the storage port, so a run can
/// be inspected after the fact whatever its outcome.
pub struct DesignEngine<S: Storage> {
    storage: S,
    synthesizer: GeometrySynthesizer,
    mesher: MeshConverter,
    driver: Option<SimulationDriver>,
    feedback: FeedbackConfig,
    frequency_span_rel: f64,
    frequency_points: usize,
    monitor: SystemMonitor,
}

struct Iteration {
    geometry: Geometry,
    board: BoardModel,
    domain: SimulationDomain,
}

impl<S: Storage> DesignEngine<S> {
    pub fn new(storage: S, synthesizer: GeometrySynthesizer, mesher: MeshConverter) -> Self {
        Self {
            storage,
            synthesizer,
            mesher,
            driver: None,
            feedback: FeedbackConfig::default(),
            frequency_span_rel: 0.2,
            frequency_points: 101,
            monitor: SystemMonitor::default(),
        }
    }

    pub fn with_driver(mut self, driver: SimulationDriver) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_sweep(mut self, span_rel: f64, points: usize) -> Self {
        self.frequency_span_rel = span_rel;
        self.frequency_points = points;
        self
    }

    pub fn with_monitor(mut self, monitor: SystemMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn frequency_range(&self, target: &ElectricalTarget) -> FrequencyRange {
        FrequencyRange::around(target.frequency_hz, self.frequency_span_rel, self.frequency_points)
    }

    /// Synthesis, board model and mesh for one synthesis target, written under `dir`.
    async fn prepare(
        &self,
        request: &DesignRequest,
        synthesis_target: &ElectricalTarget,
        dir: &str,
        artifacts: &mut Vec<String>,
    ) -> Result<Iteration> {
        let geometry = {
            let _timer = self.monitor.phase(Phase::Synthesis);
            self.synthesizer.synthesize(synthesis_target, &request.stack)?
        };
        let board = {
            let _timer = self.monitor.phase(Phase::Layout);
            BoardModelBuilder::new(request.target.impedance_ohms)
                .with_name(&request.name)
                .build(&geometry, &request.stack)?
        };
        let domain = {
            let _timer = self.monitor.phase(Phase::Meshing);
            self.mesher
                .convert(&board, &self.frequency_range(&request.target))?
        };

        let _timer = self.monitor.phase(Phase::Artifacts);
        let files = [
            ("geometry.json", serde_json::to_vec_pretty(&geometry)?),
            ("board.kicad_pcb", write_layout(&board).into_bytes()),
            ("domain.json", serde_json::to_vec_pretty(&domain)?),
        ];
        for (file, data) in files {
            let path = format!("{}/{}", dir, file);
            self.storage.write_file(&path, &data).await?;
            artifacts.push(path);
        }

        Ok(Iteration {
            geometry,
            board,
            domain,
        })
    }

    pub async fn run(
        &self,
        request: &DesignRequest,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<DesignOutcome> {
        tracing::info!(
            "📐 Design '{}': {} for {:.2} Ω @ {:.4} GHz (run {})",
            request.name,
            self.synthesizer.kind(),
            request.target.impedance_ohms,
            request.target.frequency_hz / 1e9,
            ctx.run_id()
        );

        let mut artifacts = Vec::new();
        let mut synthesis_target = request.target;

        let Some(driver) = self.driver.as_ref() else {
            let dir = format!("{}/iteration_01", request.name);
            let it = self.prepare(request, &synthesis_target, &dir, &mut artifacts).await?;
            return self
                .finish(request, it, None, None, Vec::new(), artifacts)
                .await;
        };

        let mut feedback =
            FeedbackLoop::new(request.target, self.synthesizer.kind(), self.feedback.clone());
        let mut iteration = 1;
        loop {
            let dir = format!("{}/iteration_{:02}", request.name, iteration);
            let step: Result<(Iteration, SimulationResult)> = async {
                if cancel.is_cancelled() {
                    return Err(RfError::SolverInvocationError {
                        message: "design run cancelled".to_string(),
                        diagnostics: String::new(),
                    });
                }
                let it = self.prepare(request, &synthesis_target, &dir, &mut artifacts).await?;
                let result = {
                    let _timer = self.monitor.phase(Phase::Simulation);
                    driver.run(&it.domain, ctx, cancel).await?
                };
                let path = format!("{}/sparams.csv", dir);
                self.storage.write_file(&path, &sparams_csv(&result)?).await?;
                artifacts.push(path);
                Ok((it, result))
            }
            .await;
            let (it, result) = match step {
                Ok(done) => done,
                Err(e) => return Err(self.abandon(request, &feedback, e).await),
            };

            if !self.feedback.enabled {
                let metrics = ResultAnalyzer::new(self.feedback.return_loss_threshold_db)
                    .analyze(&result, request.target.frequency_hz)?;
                return self
                    .finish(request, it, None, Some(metrics), Vec::new(), artifacts)
                    .await;
            }

            match feedback.evaluate(&result, synthesis_target, it.geometry.clone()) {
                Ok(decision) if decision.converged => {
                    let metrics = feedback.history().last().map(|r| r.metrics.clone());
                    let history = feedback.into_history();
                    return self
                        .finish(request, it, Some(true), metrics, history, artifacts)
                        .await;
                }
                Ok(decision) => {
                    synthesis_target = decision.updated_target.unwrap_or(synthesis_target);
                    iteration += 1;
                }
                Err(e) => return Err(self.abandon(request, &feedback, e).await),
            }
        }
    }

    /// Writes the feedback history so far and makes sure the error carries the best
    /// iteration once there is one.
    async fn abandon(&self, request: &DesignRequest, feedback: &FeedbackLoop, error: RfError) -> RfError {
        let path = format!("{}/history.json", request.name);
        let written = match history_summary(request, feedback.history(), false) {
            Ok(summary) => self.storage.write_file(&path, &summary).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!("⚠️ Could not write {}: {}", path, e);
        }
        tracing::error!(
            "❌ Feedback stopped after {} iterations: {}",
            feedback.history().len(),
            error
        );

        if feedback.history().is_empty() || error.best_iteration().is_some() {
            return error;
        }
        RfError::FeedbackInterrupted {
            iterations: feedback.history().len(),
            best: feedback.best().cloned().map(Box::new),
            cause: Box::new(error),
        }
    }

    /// Final layout, history summary and the fabrication bundle. Returns the layout path.
    async fn write_outputs(
        &self,
        request: &DesignRequest,
        board: &BoardModel,
        history: &[IterationRecord],
        converged: Option<bool>,
        artifacts: &mut Vec<String>,
    ) -> Result<String> {
        let layout = write_layout(board);
        let layout_path = format!("{}/{}.kicad_pcb", request.name, request.name);
        self.storage.write_file(&layout_path, layout.as_bytes()).await?;
        artifacts.push(layout_path.clone());

        let summary = history_summary(request, history, converged.unwrap_or(false))?;
        let history_path = format!("{}/history.json", request.name);
        self.storage.write_file(&history_path, &summary).await?;
        artifacts.push(history_path);

        let mut files = fabrication_files(board)?;
        files.push((format!("{}.kicad_pcb", request.name), layout.into_bytes()));
        files.push(("history.json".to_string(), summary));
        // Solver results go in under their iteration directory, read back from storage.
        let prefix = format!("{}/", request.name);
        for path in artifacts.iter().filter(|a| a.ends_with("/sparams.csv")) {
            let data = self.storage.read_file(path).await?;
            let inner = path.strip_prefix(&prefix).unwrap_or(path);
            files.push((inner.to_string(), data));
        }
        let bundle_path = format!("{}/design_bundle.zip", request.name);
        self.storage.write_file(&bundle_path, &bundle_zip(&files)?).await?;
        artifacts.push(bundle_path);
        Ok(layout_path)
    }

    async fn finish(
        &self,
        request: &DesignRequest,
        it: Iteration,
        converged: Option<bool>,
        metrics: Option<DesignMetrics>,
        history: Vec<IterationRecord>,
        mut artifacts: Vec<String>,
    ) -> Result<DesignOutcome> {
        let layout_path = {
            let _timer = self.monitor.phase(Phase::Artifacts);
            self.write_outputs(request, &it.board, &history, converged, &mut artifacts)
                .await?
        };

        self.monitor.log_final_stats();
        tracing::info!(
            "✅ Design '{}' finished: {} artifacts, layout at {}",
            request.name,
            artifacts.len(),
            layout_path
        );

        Ok(DesignOutcome {
            name: request.name.clone(),
            geometry: it.geometry,
            board: it.board,
            converged,
            metrics,
            history,
            layout_path,
            artifacts,
        })
    }
}
