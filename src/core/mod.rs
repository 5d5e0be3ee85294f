pub mod analysis;
pub mod board;
pub mod context;
pub mod driver;
pub mod engine;
pub mod equations;
pub mod feedback;
pub mod mesh;
pub mod synthesis;

pub use crate::domain::model::{ElectricalTarget, Geometry, StructureKind, SubstrateStack};
pub use crate::domain::ports::{SolverBackend, Storage};
pub use crate::utils::error::Result;
