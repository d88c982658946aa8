//! Telemetry sink.
//!
//! Events carry enough context to act on without querying the store again.

use serde::Serialize;
use tracing::warn;

use crate::{BuildId, WorkerId};

/// Something worth reporting outside the build log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Slow files could not be split and were scheduled whole.
    SplitFailed {
        build: BuildId,
        worker: WorkerId,
        files: Vec<String>,
        error: String,
    },
    /// No timing history existed; the queue was published in random order.
    NoTimings {
        build: BuildId,
        worker: WorkerId,
        queue_size: usize,
    },
    /// The fail-fast threshold was reached.
    FailFast {
        build: BuildId,
        worker: WorkerId,
        threshold: u32,
    },
    /// A job failed at least once and then passed.
    FlakyJob {
        build: BuildId,
        job: String,
        worker: Option<String>,
        location: Option<String>,
        rerun_command: Option<String>,
        output: Option<String>,
        build_duration: Option<f64>,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::SplitFailed { .. } => "split_failed",
            TelemetryEvent::NoTimings { .. } => "no_timings",
            TelemetryEvent::FailFast { .. } => "fail_fast",
            TelemetryEvent::FlakyJob { .. } => "flaky_job",
        }
    }
}

/// Receives telemetry events. Implementations must not block.
pub trait Telemetry: Send + Sync {
    fn notify(&self, event: TelemetryEvent);
}

/// Emits telemetry as structured `warn` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn notify(&self, event: TelemetryEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        warn!(target: "suiteq::telemetry", kind = event.kind(), %payload, "Telemetry event");
    }
}
