//! In-process implementation of [`JobStore`].
//!
//! Every store handle created from one [`MemoryBackend`] shares the same
//! state, so several workers in one process (or one test) see a single
//! build. Each operation takes the lock once, which gives the same
//! atomicity as the Redis scripts.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use suiteq_core::{BuildId, WorkerId};

use crate::StoreResult;
use crate::fingerprint::fingerprint;
use crate::keys::BUILD_TIMES_LIMIT;
use crate::store::{BuildStatus, BuildTimestamps, JobStore, LostJob};

#[derive(Default)]
struct BuildState {
    status: Option<BuildStatus>,
    leader: Option<WorkerId>,
    fail_fast: Option<u32>,
    unprocessed: VecDeque<String>,
    running: HashMap<String, String>,
    processed: BTreeSet<String>,
    lost: HashMap<String, u64>,
    worker_jobs: HashMap<String, Vec<String>>,
    timestamps: BuildTimestamps,
    failures: HashMap<String, String>,
    flaky_failures: HashMap<String, String>,
    errors: HashMap<String, String>,
    requeues: HashMap<String, u64>,
    requeue_origin: HashMap<String, String>,
    job_location: HashMap<String, String>,
    example_count: u64,
    heartbeats: HashMap<String, f64>,
    withdrawals: HashMap<String, u64>,
    worker_seeds: HashMap<String, u32>,
    timings: HashMap<String, f64>,
    timings_signature: Option<String>,
}

#[derive(Default)]
struct Shared {
    builds: HashMap<String, BuildState>,
    global_timings: HashMap<String, f64>,
    build_times: VecDeque<f64>,
    clock: Option<f64>,
}

impl Shared {
    fn now(&self) -> f64 {
        self.clock.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default()
        })
    }
}

/// Shared state behind any number of [`MemoryJobStore`] handles.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store handle scoped to `build`.
    pub fn store(&self, build: BuildId) -> MemoryJobStore {
        MemoryJobStore {
            shared: Arc::clone(&self.shared),
            build,
        }
    }

    /// Freeze the store clock at `now` (seconds since the epoch).
    pub fn set_time(&self, now: f64) {
        self.shared.lock().clock = Some(now);
    }

    /// Move the store clock forward, freezing it first if needed.
    pub fn advance(&self, by: Duration) {
        let mut shared = self.shared.lock();
        let now = shared.now();
        shared.clock = Some(now + by.as_secs_f64());
    }

    /// Seed the global timing history.
    pub fn insert_global_timing(&self, job: &str, duration: f64) {
        self.shared
            .lock()
            .global_timings
            .insert(job.to_string(), duration);
    }
}

/// Handle to one build in a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryJobStore {
    shared: Arc<Mutex<Shared>>,
    build: BuildId,
}

impl MemoryJobStore {
    fn with<T>(&self, f: impl FnOnce(&mut BuildState) -> T) -> T {
        let mut shared = self.shared.lock();
        let state = shared
            .builds
            .entry(self.build.as_str().to_string())
            .or_default();
        f(state)
    }

    fn with_now<T>(&self, f: impl FnOnce(&mut BuildState, f64) -> T) -> T {
        let mut shared = self.shared.lock();
        let now = shared.now();
        let state = shared
            .builds
            .entry(self.build.as_str().to_string())
            .or_default();
        f(state, now)
    }
}

fn by_duration_desc(timings: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut sorted: Vec<(String, f64)> = timings
        .iter()
        .map(|(job, duration)| (job.clone(), *duration))
        .collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    sorted
}

fn global_fingerprint(timings: &HashMap<String, f64>) -> String {
    fingerprint(timings.iter().map(|(job, d)| (job.as_str(), *d)))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn build_id(&self) -> &BuildId {
        &self.build
    }

    async fn now(&self) -> StoreResult<f64> {
        Ok(self.shared.lock().now())
    }

    async fn become_leader(&self, worker: &WorkerId) -> StoreResult<bool> {
        Ok(self.with_now(|state, now| {
            if state.status.is_some() {
                return false;
            }
            state.status = Some(BuildStatus::Initializing);
            state.leader = Some(worker.clone());
            state.timestamps.elected_master_at.get_or_insert(now);
            true
        }))
    }

    async fn publish(
        &self,
        jobs: &[String],
        fail_fast: u32,
        mark_ready: bool,
    ) -> StoreResult<usize> {
        Ok(self.with_now(|state, now| {
            state.unprocessed.extend(jobs.iter().cloned());
            state.fail_fast = Some(fail_fast);
            if mark_ready {
                state.timestamps.ready_at.get_or_insert(now);
                state.status = Some(BuildStatus::Ready);
            }
            state.unprocessed.len()
        }))
    }

    async fn reserve_next(&self, worker: &WorkerId) -> StoreResult<Option<String>> {
        Ok(self.with(|state| {
            let job = state.unprocessed.pop_front()?;
            state
                .running
                .insert(worker.as_str().to_string(), job.clone());
            Some(job)
        }))
    }

    async fn reclaim_one_lost_job(
        &self,
        now: f64,
        liveness: Duration,
    ) -> StoreResult<Option<LostJob>> {
        let deadline = now - liveness.as_secs_f64();
        Ok(self.with(|state| {
            let mut dead: Vec<(&String, &f64)> = state
                .heartbeats
                .iter()
                .filter(|(_, ts)| **ts <= deadline)
                .collect();
            dead.sort_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)));

            let worker = dead
                .into_iter()
                .map(|(worker, _)| worker)
                .find(|worker| state.running.contains_key(*worker))?
                .clone();
            let job = state.running.remove(&worker)?;
            state.unprocessed.push_front(job.clone());
            *state.lost.entry(job.clone()).or_default() += 1;
            state.heartbeats.remove(&worker);
            Some(LostJob {
                job,
                worker: WorkerId::new(worker),
            })
        }))
    }

    async fn requeue(
        &self,
        job: &str,
        max_requeues: u32,
        origin: &WorkerId,
        location: &str,
    ) -> StoreResult<bool> {
        Ok(self.with(|state| {
            let times = state.requeues.get(job).copied().unwrap_or(0);
            if times >= u64::from(max_requeues) {
                return false;
            }
            if state.running.get(origin.as_str()).map(String::as_str) == Some(job) {
                state.running.remove(origin.as_str());
            }
            state.unprocessed.push_front(job.to_string());
            state
                .requeue_origin
                .insert(job.to_string(), origin.as_str().to_string());
            *state.requeues.entry(job.to_string()).or_default() += 1;
            state
                .job_location
                .insert(job.to_string(), location.to_string());
            true
        }))
    }

    async fn acknowledge(&self, job: &str, worker: &WorkerId) -> StoreResult<()> {
        self.with(|state| {
            state.running.remove(worker.as_str());
            state.processed.insert(job.to_string());
            state
                .worker_jobs
                .entry(worker.as_str().to_string())
                .or_default()
                .push(job.to_string());
        });
        Ok(())
    }

    async fn remove_worker(&self, worker: &WorkerId) -> StoreResult<bool> {
        Ok(self.with(|state| {
            state.heartbeats.remove(worker.as_str());
            let Some(job) = state.running.remove(worker.as_str()) else {
                return false;
            };
            state.unprocessed.push_front(job);
            *state
                .withdrawals
                .entry(worker.as_str().to_string())
                .or_default() += 1;
            true
        }))
    }

    async fn record_heartbeat(&self, worker: &WorkerId, now: f64) -> StoreResult<()> {
        self.with(|state| {
            state.heartbeats.insert(worker.as_str().to_string(), now);
        });
        Ok(())
    }

    async fn record_example_failure(&self, example: &str, message: &str) -> StoreResult<()> {
        self.with(|state| {
            state
                .failures
                .entry(example.to_string())
                .or_insert_with(|| message.to_string());
        });
        Ok(())
    }

    async fn record_flaky_failure(&self, example: &str, message: &str) -> StoreResult<()> {
        self.with(|state| {
            state
                .flaky_failures
                .insert(example.to_string(), message.to_string());
        });
        Ok(())
    }

    async fn record_error(&self, job: &str, message: &str) -> StoreResult<()> {
        self.with(|state| {
            state.errors.insert(job.to_string(), message.to_string());
        });
        Ok(())
    }

    async fn increment_example_count(&self, n: u64) -> StoreResult<()> {
        self.with(|state| state.example_count += n);
        Ok(())
    }

    async fn record_job_timing(&self, job: &str, duration: f64) -> StoreResult<()> {
        self.with(|state| {
            state.timings.insert(job.to_string(), duration);
        });
        Ok(())
    }

    async fn save_worker_seed(&self, worker: &WorkerId, seed: u32) -> StoreResult<()> {
        self.with(|state| {
            state
                .worker_seeds
                .insert(worker.as_str().to_string(), seed);
        });
        Ok(())
    }

    async fn record_build_time(&self, duration: f64) -> StoreResult<()> {
        let mut shared = self.shared.lock();
        shared.build_times.push_front(duration);
        shared.build_times.truncate(BUILD_TIMES_LIMIT as usize);
        Ok(())
    }

    async fn mark_finished(&self) -> StoreResult<bool> {
        Ok(self.with_now(|state, now| {
            if state.timestamps.finished_at.is_some() {
                return false;
            }
            state.timestamps.finished_at = Some(now);
            true
        }))
    }

    async fn capture_timings_fingerprint(&self) -> StoreResult<Vec<(String, f64)>> {
        let mut shared = self.shared.lock();
        let fingerprint = global_fingerprint(&shared.global_timings);
        let snapshot = by_duration_desc(&shared.global_timings);
        shared
            .builds
            .entry(self.build.as_str().to_string())
            .or_default()
            .timings_signature = Some(fingerprint);
        Ok(snapshot)
    }

    async fn fold_build_timings(&self) -> StoreResult<bool> {
        let mut shared = self.shared.lock();
        let current = global_fingerprint(&shared.global_timings);
        let Some(state) = shared.builds.get(self.build.as_str()) else {
            return Ok(false);
        };
        if state.timings_signature.as_deref() != Some(current.as_str()) {
            return Ok(false);
        }
        let timings: Vec<(String, f64)> = state
            .timings
            .iter()
            .map(|(job, d)| (job.clone(), *d))
            .collect();
        shared.global_timings.extend(timings);
        Ok(true)
    }

    async fn status(&self) -> StoreResult<Option<BuildStatus>> {
        Ok(self.with(|state| state.status))
    }

    async fn leader(&self) -> StoreResult<Option<WorkerId>> {
        Ok(self.with(|state| state.leader.clone()))
    }

    async fn fail_fast(&self) -> StoreResult<Option<u32>> {
        Ok(self.with(|state| state.fail_fast))
    }

    async fn exhausted(&self) -> StoreResult<bool> {
        Ok(self.with(|state| {
            state.status == Some(BuildStatus::Ready)
                && state.unprocessed.is_empty()
                && state.running.is_empty()
        }))
    }

    async fn build_failed_fast(&self) -> StoreResult<bool> {
        Ok(self.with(|state| match state.fail_fast {
            None | Some(0) => false,
            Some(threshold) => state.failures.len() + state.errors.len() >= threshold as usize,
        }))
    }

    async fn unprocessed_len(&self) -> StoreResult<usize> {
        Ok(self.with(|state| state.unprocessed.len()))
    }

    async fn unprocessed_jobs(&self) -> StoreResult<Vec<String>> {
        Ok(self.with(|state| state.unprocessed.iter().cloned().collect()))
    }

    async fn running_jobs(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self.with(|state| state.running.clone()))
    }

    async fn processed_jobs(&self) -> StoreResult<Vec<String>> {
        Ok(self.with(|state| state.processed.iter().cloned().collect()))
    }

    async fn processed_count(&self) -> StoreResult<usize> {
        Ok(self.with(|state| state.processed.len()))
    }

    async fn example_count(&self) -> StoreResult<u64> {
        Ok(self.with(|state| state.example_count))
    }

    async fn requeues(&self) -> StoreResult<HashMap<String, u64>> {
        Ok(self.with(|state| state.requeues.clone()))
    }

    async fn example_failures(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self.with(|state| state.failures.clone()))
    }

    async fn flaky_failures(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self.with(|state| state.flaky_failures.clone()))
    }

    async fn errors(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self.with(|state| state.errors.clone()))
    }

    async fn heartbeats(&self) -> StoreResult<Vec<(String, f64)>> {
        Ok(self.with(|state| {
            let mut beats: Vec<(String, f64)> = state
                .heartbeats
                .iter()
                .map(|(w, ts)| (w.clone(), *ts))
                .collect();
            beats.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            beats
        }))
    }

    async fn withdrawals(&self) -> StoreResult<HashMap<String, u64>> {
        Ok(self.with(|state| state.withdrawals.clone()))
    }

    async fn lost_jobs(&self) -> StoreResult<HashMap<String, u64>> {
        Ok(self.with(|state| state.lost.clone()))
    }

    async fn job_location(&self, job: &str) -> StoreResult<Option<String>> {
        Ok(self.with(|state| state.job_location.get(job).cloned()))
    }

    async fn failed_job_worker(&self, job: &str) -> StoreResult<Option<String>> {
        Ok(self.with(|state| state.requeue_origin.get(job).cloned()))
    }

    async fn worker_jobs(&self, worker: &str) -> StoreResult<Vec<String>> {
        Ok(self.with(|state| state.worker_jobs.get(worker).cloned().unwrap_or_default()))
    }

    async fn worker_seed(&self, worker: &str) -> StoreResult<Option<u32>> {
        Ok(self.with(|state| state.worker_seeds.get(worker).copied()))
    }

    async fn timestamps(&self) -> StoreResult<BuildTimestamps> {
        Ok(self.with(|state| state.timestamps))
    }

    async fn build_times(&self) -> StoreResult<Vec<f64>> {
        Ok(self.shared.lock().build_times.iter().copied().collect())
    }

    async fn global_timings(&self) -> StoreResult<Vec<(String, f64)>> {
        Ok(by_duration_desc(&self.shared.lock().global_timings))
    }

    async fn build_timings(&self) -> StoreResult<Vec<(String, f64)>> {
        Ok(self.with(|state| by_duration_desc(&state.timings)))
    }

    async fn job_build_timing(&self, job: &str) -> StoreResult<Option<f64>> {
        Ok(self.with(|state| state.timings.get(job).copied()))
    }
}
