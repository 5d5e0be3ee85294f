// Adapters layer: file formats, storage and solver backends behind the core's ports.

pub mod fabrication;
pub mod layout;
pub mod report;
pub mod solver;
pub mod storage;

pub use storage::LocalStorage;
