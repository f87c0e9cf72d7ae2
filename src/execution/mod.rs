//! Pipeline orchestration engine

pub mod engine;
pub mod routing;

pub use engine::{EngineError, PipelineEngine, RunHooks, StartRun};
