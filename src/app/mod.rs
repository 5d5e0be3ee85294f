// Application layer: orchestration of many designs on top of the core engine.

pub mod pipelines;
