//! Store key layout.
//!
//! Everything is scoped to a build id, except the global timing history and
//! the rolling build-time list which are shared by all builds. Only publish
//! timings from a single branch (e.g. main), otherwise the schedule built
//! from them will be skewed.

use suiteq_core::BuildId;

/// redis: ZSET<job => duration>
pub const GLOBAL_TIMINGS: &str = "timings";

/// redis: LIST<duration>, newest build at the head.
pub const BUILD_TIMES: &str = "build_times";

/// Number of entries kept in [`BUILD_TIMES`].
pub const BUILD_TIMES_LIMIT: isize = 100;

/// Keys of one build.
#[derive(Debug, Clone)]
pub struct BuildKeys {
    prefix: String,
}

impl BuildKeys {
    pub fn new(build: &BuildId) -> Self {
        Self {
            prefix: build.as_str().to_string(),
        }
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// redis: STRING [initializing, ready]
    pub fn status(&self) -> String {
        self.key(&["queue", "status"])
    }

    /// redis: STRING<worker_id>
    pub fn leader(&self) -> String {
        self.key(&["queue", "leader"])
    }

    /// redis: HASH<config_key => config_value>
    pub fn config(&self) -> String {
        self.key(&["queue", "config"])
    }

    /// redis: LIST<job>
    pub fn unprocessed(&self) -> String {
        self.key(&["queue", "unprocessed"])
    }

    /// redis: HASH<worker_id => job>
    pub fn running(&self) -> String {
        self.key(&["queue", "running"])
    }

    /// redis: SET<job>
    pub fn processed(&self) -> String {
        self.key(&["queue", "processed"])
    }

    /// redis: ZSET<job => times reclaimed>
    pub fn lost(&self) -> String {
        self.key(&["queue", "lost"])
    }

    /// redis: LIST<job>, in the order the worker acknowledged them
    pub fn worker_jobs(&self, worker: &str) -> String {
        self.key(&["queue", "jobs_per_worker", worker])
    }

    pub fn elected_master_at(&self) -> String {
        self.key(&["queue", "elected_master_at"])
    }

    pub fn ready_at(&self) -> String {
        self.key(&["queue", "ready_at"])
    }

    pub fn finished_at(&self) -> String {
        self.key(&["queue", "finished_at"])
    }

    /// redis: HASH<example_id => message>
    pub fn failures(&self) -> String {
        self.key(&["example_failures"])
    }

    /// redis: HASH<example_id => message>
    pub fn flaky_failures(&self) -> String {
        self.key(&["flaky_failures"])
    }

    /// Errors raised outside of examples (e.g. a file that fails to load).
    ///
    /// redis: HASH<job => message>
    pub fn errors(&self) -> String {
        self.key(&["errors"])
    }

    /// redis: HASH<job => times requeued>
    pub fn requeues(&self) -> String {
        self.key(&["requeues"])
    }

    /// redis: HASH<job => worker_id>
    pub fn requeue_origin(&self) -> String {
        self.key(&["requeued_job_original_worker"])
    }

    /// redis: HASH<job => location>
    pub fn job_location(&self) -> String {
        self.key(&["job_location"])
    }

    /// Total examples executed, including retried ones.
    ///
    /// redis: STRING<integer>
    pub fn example_count(&self) -> String {
        self.key(&["example_count"])
    }

    /// redis: ZSET<worker_id => timestamp>
    pub fn heartbeats(&self) -> String {
        self.key(&["worker_heartbeats"])
    }

    /// redis: HASH<worker_id => times withdrawn>
    pub fn withdrawals(&self) -> String {
        self.key(&["workers_withdrawn"])
    }

    /// redis: HASH<worker_id => seed>
    pub fn worker_seeds(&self) -> String {
        self.key(&["worker_seed"])
    }

    /// redis: ZSET<job => duration>
    pub fn build_timings(&self) -> String {
        self.key(&["timings"])
    }

    /// Fingerprint of [`GLOBAL_TIMINGS`] captured when the build was scheduled.
    ///
    /// redis: STRING
    pub fn timings_signature(&self) -> String {
        self.key(&["timings_signature"])
    }
}
