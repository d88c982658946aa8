//! Execution engine trait and observer callbacks.
//!
//! The engine runs one job at a time and reports what happened through a
//! [`JobObserver`]. The coordination code never controls the engine's
//! internal execution order; it only reacts to these four events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// A job handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    /// Opaque job id (file path or file plus example index).
    pub job: String,
    /// Ordering seed the engine must use, so failures can be replayed.
    pub seed: u32,
}

/// An example failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleFailure {
    /// Example id, addressable as a job on its own.
    pub id: String,
    /// Fully formatted failure output.
    pub message: String,
    /// Location to rerun the example (e.g. `./spec/a_spec.rb:12`).
    pub location: String,
    /// Human readable example description.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

/// Callbacks the engine must invoke while running a job.
#[async_trait]
pub trait JobObserver: Send {
    /// The whole job finished.
    async fn suite_finished(&mut self, duration: Duration, example_count: u64) -> Result<()>;

    /// One example finished, successfully or not.
    async fn example_finished(&mut self) -> Result<()>;

    /// One example failed.
    async fn example_failed(&mut self, failure: ExampleFailure) -> Result<()>;

    /// The job failed outside of any example, before any example ran.
    async fn load_error(&mut self, message: String) -> Result<()>;
}

/// Trait for test execution engines.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Name of this engine.
    fn name(&self) -> &'static str;

    /// Run a job, reporting progress through `observer`.
    async fn run(&self, run: &JobRun, observer: &mut dyn JobObserver) -> Result<()>;

    /// List the example ids contained in the given files.
    async fn list_examples(&self, files: &[String]) -> Result<Vec<String>>;
}
