pub mod analytic;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use crate::core::driver::{SolverKind, SolverSettings};
use crate::domain::ports::SolverBackend;
use crate::utils::error::Result;

pub use analytic::AnalyticSolver;
pub use process::ProcessSolver;

/// The backend selected by the `[solver]` section.
pub fn build_backend(settings: &SolverSettings) -> Result<Arc<dyn SolverBackend>> {
    let backend: Arc<dyn SolverBackend> = match settings.backend {
        SolverKind::Analytic => Arc::new(AnalyticSolver::new(
            settings.impedance_scale,
            settings.frequency_scale,
        )),
        SolverKind::Process => Arc::new(ProcessSolver::new(
            settings.command.clone(),
            Duration::from_secs(settings.timeout_secs),
        )?),
    };
    tracing::debug!("Solver backend: {}", backend.name());
    Ok(backend)
}
