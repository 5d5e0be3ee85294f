pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use crate::config::CliConfig;
pub use crate::config::{DesignConfig, SweepConfig};

pub use crate::adapters::LocalStorage;
pub use crate::app::pipelines::{BatchSweep, SweepReport};
pub use crate::core::engine::{DesignEngine, DesignOutcome, DesignRequest};
pub use crate::domain::model::{ElectricalTarget, StructureKind, SubstrateStack};
pub use crate::utils::error::{Result, RfError};
