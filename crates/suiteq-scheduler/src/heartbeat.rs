//! Rate-limited worker heartbeats.

use std::time::Duration;
use suiteq_core::WorkerId;
use suiteq_store::{JobStore, StoreResult};
use tokio::time::Instant;
use tracing::trace;

/// Beats at most once per interval.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    last: Option<Instant>,
}

impl Heartbeat {
    /// Heartbeat for a liveness window. Beating six times per window keeps a
    /// slow store round-trip from making a live worker look dead.
    pub fn for_liveness(liveness: Duration) -> Self {
        Self::new(liveness / 6)
    }

    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn is_due(&self) -> bool {
        self.last
            .is_none_or(|last| last.elapsed() >= self.interval)
    }

    /// Record a heartbeat if one is due. Returns whether it beat.
    pub async fn beat_if_due(&mut self, store: &dyn JobStore, worker: &WorkerId) -> StoreResult<bool> {
        if !self.is_due() {
            return Ok(false);
        }
        let now = store.now().await?;
        store.record_heartbeat(worker, now).await?;
        self.last = Some(Instant::now());
        trace!(worker_id = %worker, now, "Heartbeat");
        Ok(true)
    }
}
