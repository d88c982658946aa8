//! Execution engine adapters for suiteq.
//!
//! Provides engine implementations for running test jobs:
//! - External command speaking JSON lines (production)

pub mod command;

pub use command::{CommandEngine, EngineEvent, SEED_ENV};
pub use suiteq_core::engine::{ExampleFailure, ExecutionEngine, JobObserver, JobRun};
