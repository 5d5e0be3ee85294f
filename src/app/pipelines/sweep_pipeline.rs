use crate::adapters::storage::LocalStorage;
use crate::config::sweep_config::SweepConfig;
use crate::core::context::{cancellation, CancelHandle, CancelSignal, ExecutionContext};
use crate::core::engine::DesignOutcome;
use crate::domain::ports::Storage;
use crate::utils::error::{Result, RfError};
use crate::utils::monitor::{Phase, SystemMonitor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const SUMMARY_FILE: &str = "execution_summary.json";

/// Result of one design in a sweep.
#[derive(Debug)]
pub struct DesignRun {
    pub name: String,
    pub outcome: Result<DesignOutcome>,
    pub duration: Duration,
}

impl DesignRun {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSummary {
    pub name: String,
    pub status: String,
    pub converged: Option<bool>,
    pub layout_path: Option<String>,
    pub artifacts: usize,
    pub error: Option<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub sweep: String,
    pub run_id: String,
    pub generated_at: String,
    pub total_designs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub converged: usize,
    pub max_parallel: usize,
    pub total_duration_ms: u64,
    pub designs: Vec<DesignSummary>,
}

impl ExecutionSummary {
    pub fn from_runs(config: &SweepConfig, run_id: &str, runs: &[DesignRun], elapsed: Duration) -> Self {
        let designs: Vec<DesignSummary> = runs
            .iter()
            .map(|run| match &run.outcome {
                Ok(outcome) => DesignSummary {
                    name: run.name.clone(),
                    status: "success".to_string(),
                    converged: outcome.converged,
                    layout_path: Some(outcome.layout_path.clone()),
                    artifacts: outcome.artifacts.len(),
                    error: None,
                    exit_code: 0,
                    duration_ms: run.duration.as_millis() as u64,
                },
                Err(e) => DesignSummary {
                    name: run.name.clone(),
                    status: "failed".to_string(),
                    converged: None,
                    layout_path: None,
                    artifacts: 0,
                    error: Some(e.to_string()),
                    exit_code: e.exit_code(),
                    duration_ms: run.duration.as_millis() as u64,
                },
            })
            .collect();

        let succeeded = designs.iter().filter(|d| d.error.is_none()).count();
        Self {
            sweep: config.sweep.name.clone(),
            run_id: run_id.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            total_designs: designs.len(),
            succeeded,
            failed: designs.len() - succeeded,
            converged: designs.iter().filter(|d| d.converged == Some(true)).count(),
            max_parallel: config.max_parallel(),
            total_duration_ms: elapsed.as_millis() as u64,
            designs,
        }
    }
}

#[derive(Debug)]
pub struct SweepReport {
    pub runs: Vec<DesignRun>,
    pub summary: ExecutionSummary,
    pub summary_path: String,
}

impl SweepReport {
    pub fn all_succeeded(&self) -> bool {
        self.runs.iter().all(DesignRun::succeeded)
    }

    /// First failure in design order, for the process exit code.
    pub fn first_error(&self) -> Option<&RfError> {
        self.runs.iter().find_map(|run| run.outcome.as_ref().err())
    }
}

/// Runs the designs of a sweep file side by side, each in its own execution context.
///
/// At most `max_parallel` designs run at once. Artifacts go under `<output>/<design>/` and the
/// execution summary next to them.
pub struct BatchSweep {
    config: SweepConfig,
    storage: LocalStorage,
    run_id: String,
    context_base: Option<PathBuf>,
    monitor: SystemMonitor,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl BatchSweep {
    pub fn new(config: SweepConfig, storage: LocalStorage, run_id: impl Into<String>) -> Self {
        let (cancel, signal) = cancellation();
        let monitor = SystemMonitor::new(config.monitoring.enabled);
        Self {
            config,
            storage,
            run_id: run_id.into(),
            context_base: None,
            monitor,
            cancel,
            signal,
        }
    }

    /// Directory under which per-design scratch contexts are created.
    pub fn with_context_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.context_base = Some(base.into());
        self
    }

    /// Handle that stops every design still running.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn execute(&self) -> Result<SweepReport> {
        let start = Instant::now();
        let max_parallel = self.config.max_parallel();
        tracing::info!(
            "🚀 Sweep '{}': {} designs, up to {} in parallel (run {})",
            self.config.sweep.name,
            self.config.designs.len(),
            max_parallel,
            self.run_id
        );
        let timer = self.monitor.phase(Phase::Sweep);

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut tasks = JoinSet::new();
        let names: Vec<String> = self.config.designs.iter().map(|d| d.design.name.clone()).collect();

        for (index, design) in self.config.designs.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let storage = self.storage.clone();
            let signal = self.signal.clone();
            let context_id = format!("{}_{}", self.run_id, design.design.name);
            let context_base = self.context_base.clone();

            tasks.spawn(async move {
                let started = Instant::now();
                let outcome: Result<DesignOutcome> = async {
                    let _permit = semaphore.acquire_owned().await.map_err(|e| {
                        RfError::SolverInvocationError {
                            message: format!("sweep scheduler closed: {}", e),
                            diagnostics: String::new(),
                        }
                    })?;
                    if signal.is_cancelled() {
                        return Err(RfError::SolverInvocationError {
                            message: "design skipped after sweep cancellation".to_string(),
                            diagnostics: String::new(),
                        });
                    }

                    let engine = design.build_engine(storage)?;
                    let ctx = ExecutionContext::init(context_id, context_base.as_deref())?;
                    let outcome = engine.run(&design.to_request(), &ctx, &signal).await;
                    if let Err(e) = ctx.teardown() {
                        tracing::warn!("⚠️ Could not remove execution context: {}", e);
                    }
                    outcome
                }
                .await;
                (index, outcome, started.elapsed())
            });
        }

        let mut slots: Vec<Option<DesignRun>> = names.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome, duration) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("❌ Sweep task aborted: {}", e);
                    continue;
                }
            };
            let name = names[index].clone();
            match &outcome {
                Ok(o) => tracing::info!(
                    "✅ Design '{}' done in {:?} (converged: {:?})",
                    name,
                    duration,
                    o.converged
                ),
                Err(e) => {
                    tracing::error!("❌ Design '{}' failed: {}", name, e);
                    if !self.config.sweep.continue_on_error {
                        tracing::warn!("🛑 Cancelling remaining designs");
                        self.cancel.cancel();
                    }
                }
            }
            slots[index] = Some(DesignRun {
                name,
                outcome,
                duration,
            });
        }

        let runs: Vec<DesignRun> = slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| DesignRun {
                    name,
                    outcome: Err(RfError::SolverInvocationError {
                        message: "design task did not complete".to_string(),
                        diagnostics: String::new(),
                    }),
                    duration: Duration::ZERO,
                })
            })
            .collect();

        let summary = ExecutionSummary::from_runs(&self.config, &self.run_id, &runs, start.elapsed());
        let summary_path = SUMMARY_FILE.to_string();
        self.storage
            .write_file(&summary_path, &serde_json::to_vec_pretty(&summary)?)
            .await?;

        drop(timer);
        self.monitor.log_final_stats();
        tracing::info!(
            "📊 Sweep '{}' finished: {}/{} succeeded, {} converged, summary at {}",
            summary.sweep,
            summary.succeeded,
            summary.total_designs,
            summary.converged,
            self.storage.resolve(&summary_path).display()
        );

        Ok(SweepReport {
            runs,
            summary,
            summary_path,
        })
    }
}
