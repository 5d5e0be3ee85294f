use crate::core::context::{CancelSignal, ExecutionContext};
use crate::domain::simulation::{SimulationResult, SolverConfiguration};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Where run artifacts end up. Paths are relative to the storage root.
pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// A full-wave engine behind the solver boundary.
#[async_trait]
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one simulation. Implementations must release everything they acquired from `ctx`
    /// before returning, whatever the outcome.
    async fn invoke(
        &self,
        config: &SolverConfiguration,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<SimulationResult>;
}
