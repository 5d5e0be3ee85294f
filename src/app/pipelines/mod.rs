pub mod sweep_pipeline;

pub use sweep_pipeline::{BatchSweep, ExecutionSummary, SweepReport};
