// Domain layer: data model and ports. Pure data plus the capability traits the core drives.

pub mod board;
pub mod model;
pub mod ports;
pub mod simulation;
