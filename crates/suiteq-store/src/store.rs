//! The job store trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use suiteq_core::{BuildId, WorkerId};
use tokio::time::{Instant, sleep};

use crate::{StoreError, StoreResult};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Status of a build's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// A leader was elected and is computing the schedule.
    Initializing,
    /// The full schedule has been published.
    Ready,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Initializing => "initializing",
            BuildStatus::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(BuildStatus::Initializing),
            "ready" => Some(BuildStatus::Ready),
            _ => None,
        }
    }
}

/// A job taken back from a worker that stopped heartbeating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostJob {
    pub job: String,
    pub worker: WorkerId,
}

/// Build milestones, in store server time (seconds).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BuildTimestamps {
    pub elected_master_at: Option<f64>,
    pub ready_at: Option<f64>,
    pub finished_at: Option<f64>,
}

impl BuildTimestamps {
    /// Seconds from leader election to finish.
    pub fn since_elected(&self) -> Option<f64> {
        Some(self.finished_at? - self.elected_master_at?)
    }

    /// Seconds from the queue becoming ready to finish.
    pub fn since_ready(&self) -> Option<f64> {
        Some(self.finished_at? - self.ready_at?)
    }
}

/// Typed, atomic operations over the shared build state.
///
/// Every mutating operation is one indivisible round-trip: a partially
/// applied reservation, requeue, election, reclaim or removal is never
/// observable.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// The build this handle is scoped to.
    fn build_id(&self) -> &BuildId;

    /// Current store server time in seconds.
    async fn now(&self) -> StoreResult<f64>;

    /// Elect the caller as leader if no one has been elected yet.
    ///
    /// Exactly one caller per build gets `true`.
    async fn become_leader(&self, worker: &WorkerId) -> StoreResult<bool>;

    /// Append jobs to the queue and write the build config.
    ///
    /// With `mark_ready`, the build additionally becomes ready. Returns the
    /// queue length after the append.
    async fn publish(&self, jobs: &[String], fail_fast: u32, mark_ready: bool)
    -> StoreResult<usize>;

    /// Pop the head of the queue into the worker's running slot.
    async fn reserve_next(&self, worker: &WorkerId) -> StoreResult<Option<String>>;

    /// Put back the job of the first worker whose heartbeat is older than
    /// `now - liveness`. Reclaims at most one job per call.
    async fn reclaim_one_lost_job(&self, now: f64, liveness: Duration)
    -> StoreResult<Option<LostJob>>;

    /// Put a failed job back at the head of the queue.
    ///
    /// Returns `false` once the job has been requeued `max_requeues` times,
    /// in which case the failure is final.
    async fn requeue(
        &self,
        job: &str,
        max_requeues: u32,
        origin: &WorkerId,
        location: &str,
    ) -> StoreResult<bool>;

    /// Mark the worker done with `job`. The same job may be acknowledged
    /// more than once after requeues.
    async fn acknowledge(&self, job: &str, worker: &WorkerId) -> StoreResult<()>;

    /// Drop a worker from the build, requeueing its reserved job if any.
    ///
    /// Returns `true` if the worker was holding a job.
    async fn remove_worker(&self, worker: &WorkerId) -> StoreResult<bool>;

    async fn record_heartbeat(&self, worker: &WorkerId, now: f64) -> StoreResult<()>;

    /// Record a final example failure. The first record for an id wins.
    async fn record_example_failure(&self, example: &str, message: &str) -> StoreResult<()>;

    /// Record a provisional failure that was requeued.
    async fn record_flaky_failure(&self, example: &str, message: &str) -> StoreResult<()>;

    /// Record an error that happened outside of any example.
    async fn record_error(&self, job: &str, message: &str) -> StoreResult<()>;

    async fn increment_example_count(&self, n: u64) -> StoreResult<()>;

    /// Record how long a job took in this build.
    async fn record_job_timing(&self, job: &str, duration: f64) -> StoreResult<()>;

    async fn save_worker_seed(&self, worker: &WorkerId, seed: u32) -> StoreResult<()>;

    /// Push a build duration into the shared rolling history.
    async fn record_build_time(&self, duration: f64) -> StoreResult<()>;

    /// Stamp `finished_at`. Returns `true` for the first caller only.
    async fn mark_finished(&self) -> StoreResult<bool>;

    /// Fingerprint the global timings and remember it for this build.
    ///
    /// Returns the timings that were fingerprinted, longest first, so the
    /// schedule is built from the same snapshot the fold is guarded by.
    async fn capture_timings_fingerprint(&self) -> StoreResult<Vec<(String, f64)>>;

    /// Merge this build's timings into the global history, but only if the
    /// global set still matches the fingerprint captured at schedule time.
    async fn fold_build_timings(&self) -> StoreResult<bool>;

    async fn status(&self) -> StoreResult<Option<BuildStatus>>;

    async fn leader(&self) -> StoreResult<Option<WorkerId>>;

    /// Fail-fast threshold, `None` until published. 0 disables it.
    async fn fail_fast(&self) -> StoreResult<Option<u32>>;

    /// True once the build is ready and no job is queued or running.
    async fn exhausted(&self) -> StoreResult<bool>;

    /// True once failures plus errors reached the fail-fast threshold.
    async fn build_failed_fast(&self) -> StoreResult<bool>;

    async fn unprocessed_len(&self) -> StoreResult<usize>;

    /// Remaining jobs; the head is served first.
    async fn unprocessed_jobs(&self) -> StoreResult<Vec<String>>;

    /// worker id => reserved job
    async fn running_jobs(&self) -> StoreResult<HashMap<String, String>>;

    async fn processed_jobs(&self) -> StoreResult<Vec<String>>;

    async fn processed_count(&self) -> StoreResult<usize>;

    async fn example_count(&self) -> StoreResult<u64>;

    /// job => times requeued
    async fn requeues(&self) -> StoreResult<HashMap<String, u64>>;

    async fn example_failures(&self) -> StoreResult<HashMap<String, String>>;

    async fn flaky_failures(&self) -> StoreResult<HashMap<String, String>>;

    async fn errors(&self) -> StoreResult<HashMap<String, String>>;

    /// (worker, last heartbeat), oldest first.
    async fn heartbeats(&self) -> StoreResult<Vec<(String, f64)>>;

    /// worker => times withdrawn
    async fn withdrawals(&self) -> StoreResult<HashMap<String, u64>>;

    /// job => times reclaimed from a dead worker
    async fn lost_jobs(&self) -> StoreResult<HashMap<String, u64>>;

    async fn job_location(&self, job: &str) -> StoreResult<Option<String>>;

    /// The worker that last requeued `job`.
    async fn failed_job_worker(&self, job: &str) -> StoreResult<Option<String>>;

    /// Jobs acknowledged by `worker`, in order.
    async fn worker_jobs(&self, worker: &str) -> StoreResult<Vec<String>>;

    async fn worker_seed(&self, worker: &str) -> StoreResult<Option<u32>>;

    async fn timestamps(&self) -> StoreResult<BuildTimestamps>;

    /// Shared build durations, newest first.
    async fn build_times(&self) -> StoreResult<Vec<f64>>;

    /// Global timings, slowest first.
    async fn global_timings(&self) -> StoreResult<Vec<(String, f64)>>;

    /// This build's timings, slowest first.
    async fn build_timings(&self) -> StoreResult<Vec<(String, f64)>>;

    async fn job_build_timing(&self, job: &str) -> StoreResult<Option<f64>>;

    async fn is_ready(&self) -> StoreResult<bool> {
        Ok(self.status().await? == Some(BuildStatus::Ready))
    }

    /// Exhausted with neither failures nor errors.
    async fn build_successful(&self) -> StoreResult<bool> {
        Ok(self.exhausted().await?
            && self.example_failures().await?.is_empty()
            && self.errors().await?.is_empty())
    }

    /// Jobs that were requeued but never recorded as a final failure.
    async fn flaky_jobs(&self) -> StoreResult<Vec<String>> {
        let failures = self.example_failures().await?;
        let mut flaky: Vec<String> = self
            .requeues()
            .await?
            .into_keys()
            .filter(|job| !failures.contains_key(job))
            .collect();
        flaky.sort();
        Ok(flaky)
    }

    /// Sum of this build's job timings, in seconds.
    async fn total_execution_time(&self) -> StoreResult<f64> {
        Ok(self.build_timings().await?.iter().map(|(_, d)| d).sum())
    }

    /// Block until the whole schedule is published.
    async fn wait_until_ready(&self, timeout: Duration) -> StoreResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Timeout(format!(
                    "queue not ready after {} seconds",
                    timeout.as_secs_f64()
                )));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Block until there is work to pull: either the build is ready or the
    /// leader already released a first batch of jobs.
    async fn wait_until_published(&self, timeout: Duration) -> StoreResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready().await? || self.unprocessed_len().await? > 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Timeout(format!(
                    "queue not published after {} seconds",
                    timeout.as_secs_f64()
                )));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}
