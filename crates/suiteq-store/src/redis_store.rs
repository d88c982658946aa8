//! Redis implementation of [`JobStore`].

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use suiteq_core::{BuildId, WorkerId};
use tracing::debug;

use crate::keys::{BUILD_TIMES, BUILD_TIMES_LIMIT, BuildKeys, GLOBAL_TIMINGS};
use crate::scripts::Scripts;
use crate::store::{BuildStatus, BuildTimestamps, JobStore, LostJob};
use crate::{StoreError, StoreResult};

/// Job store backed by a Redis server.
pub struct RedisJobStore {
    conn: ConnectionManager,
    build: BuildId,
    keys: BuildKeys,
    scripts: Scripts,
}

impl RedisJobStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str, build: BuildId) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(build = %build, "Connected to redis");
        Ok(Self::with_connection(conn, build))
    }

    /// Create a store over an existing connection.
    pub fn with_connection(conn: ConnectionManager, build: BuildId) -> Self {
        let keys = BuildKeys::new(&build);
        Self {
            conn,
            build,
            keys,
            scripts: Scripts::new(),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn build_id(&self) -> &BuildId {
        &self.build
    }

    // Worker clocks may be skewed or faked by the code under test, so all
    // timestamps come from the server.
    async fn now(&self) -> StoreResult<f64> {
        let mut conn = self.conn();
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs as f64 + micros as f64 / 1_000_000.0)
    }

    async fn become_leader(&self, worker: &WorkerId) -> StoreResult<bool> {
        let now = self.now().await?;
        let mut conn = self.conn();
        let won: i64 = self
            .scripts
            .become_leader
            .key(self.keys.status())
            .key(self.keys.leader())
            .key(self.keys.elected_master_at())
            .arg(worker.as_str())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    async fn publish(
        &self,
        jobs: &[String],
        fail_fast: u32,
        mark_ready: bool,
    ) -> StoreResult<usize> {
        let now = self.now().await?;
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !jobs.is_empty() {
            pipe.rpush(self.keys.unprocessed(), jobs).ignore();
        }
        pipe.hset(self.keys.config(), "fail_fast", fail_fast)
            .ignore();
        if mark_ready {
            pipe.cmd("SET")
                .arg(self.keys.ready_at())
                .arg(now)
                .arg("NX")
                .ignore();
            pipe.set(self.keys.status(), BuildStatus::Ready.as_str())
                .ignore();
        }
        pipe.llen(self.keys.unprocessed());
        let (len,): (usize,) = pipe.query_async(&mut conn).await?;
        Ok(len)
    }

    async fn reserve_next(&self, worker: &WorkerId) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let job: Option<String> = self
            .scripts
            .reserve_job
            .key(self.keys.unprocessed())
            .key(self.keys.running())
            .arg(worker.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(job)
    }

    async fn reclaim_one_lost_job(
        &self,
        now: f64,
        liveness: Duration,
    ) -> StoreResult<Option<LostJob>> {
        let mut conn = self.conn();
        let lost: Option<(String, String)> = self
            .scripts
            .reclaim_lost_job
            .key(self.keys.heartbeats())
            .key(self.keys.running())
            .key(self.keys.unprocessed())
            .key(self.keys.lost())
            .arg(now)
            .arg(liveness.as_secs_f64())
            .invoke_async(&mut conn)
            .await?;
        Ok(lost.map(|(job, worker)| LostJob {
            job,
            worker: WorkerId::new(worker),
        }))
    }

    async fn requeue(
        &self,
        job: &str,
        max_requeues: u32,
        origin: &WorkerId,
        location: &str,
    ) -> StoreResult<bool> {
        if max_requeues == 0 {
            return Ok(false);
        }
        let mut conn = self.conn();
        let accepted: i64 = self
            .scripts
            .requeue_job
            .key(self.keys.unprocessed())
            .key(self.keys.requeues())
            .key(self.keys.requeue_origin())
            .key(self.keys.job_location())
            .key(self.keys.running())
            .arg(job)
            .arg(max_requeues)
            .arg(origin.as_str())
            .arg(location)
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted == 1)
    }

    async fn acknowledge(&self, job: &str, worker: &WorkerId) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .hdel(self.keys.running(), worker.as_str())
            .ignore()
            .sadd(self.keys.processed(), job)
            .ignore()
            .rpush(self.keys.worker_jobs(worker.as_str()), job)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_worker(&self, worker: &WorkerId) -> StoreResult<bool> {
        let mut conn = self.conn();
        let held: i64 = self
            .scripts
            .remove_worker
            .key(self.keys.unprocessed())
            .key(self.keys.heartbeats())
            .key(self.keys.running())
            .key(self.keys.withdrawals())
            .arg(worker.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn record_heartbeat(&self, worker: &WorkerId, now: f64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .zadd(self.keys.heartbeats(), worker.as_str(), now)
            .await?;
        Ok(())
    }

    async fn record_example_failure(&self, example: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn.hset_nx(self.keys.failures(), example, message).await?;
        Ok(())
    }

    async fn record_flaky_failure(&self, example: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .hset(self.keys.flaky_failures(), example, message)
            .await?;
        Ok(())
    }

    async fn record_error(&self, job: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn.hset(self.keys.errors(), job, message).await?;
        Ok(())
    }

    async fn increment_example_count(&self, n: u64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn.incr(self.keys.example_count(), n).await?;
        Ok(())
    }

    async fn record_job_timing(&self, job: &str, duration: f64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(self.keys.build_timings(), job, duration).await?;
        Ok(())
    }

    async fn save_worker_seed(&self, worker: &WorkerId, seed: u32) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .hset(self.keys.worker_seeds(), worker.as_str(), seed)
            .await?;
        Ok(())
    }

    async fn record_build_time(&self, duration: f64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .lpush(BUILD_TIMES, duration)
            .ignore()
            .ltrim(BUILD_TIMES, 0, BUILD_TIMES_LIMIT - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_finished(&self) -> StoreResult<bool> {
        let now = self.now().await?;
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.keys.finished_at())
            .arg(now)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn capture_timings_fingerprint(&self) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let timings: Vec<(String, f64)> = self
            .scripts
            .capture_fingerprint
            .key(GLOBAL_TIMINGS)
            .key(self.keys.timings_signature())
            .invoke_async(&mut conn)
            .await?;
        Ok(timings)
    }

    async fn fold_build_timings(&self) -> StoreResult<bool> {
        let mut conn = self.conn();
        let folded: i64 = self
            .scripts
            .fold_timings
            .key(GLOBAL_TIMINGS)
            .key(self.keys.build_timings())
            .key(self.keys.timings_signature())
            .invoke_async(&mut conn)
            .await?;
        Ok(folded == 1)
    }

    async fn status(&self) -> StoreResult<Option<BuildStatus>> {
        let mut conn = self.conn();
        let key = self.keys.status();
        let raw: Option<String> = conn.get(&key).await?;
        raw.map(|s| {
            BuildStatus::parse(&s).ok_or_else(|| StoreError::Corrupt {
                key: key.clone(),
                message: format!("unknown status '{s}'"),
            })
        })
        .transpose()
    }

    async fn leader(&self) -> StoreResult<Option<WorkerId>> {
        let mut conn = self.conn();
        let leader: Option<String> = conn.get(self.keys.leader()).await?;
        Ok(leader.map(WorkerId::new))
    }

    async fn fail_fast(&self) -> StoreResult<Option<u32>> {
        let mut conn = self.conn();
        let threshold: Option<u32> = conn.hget(self.keys.config(), "fail_fast").await?;
        Ok(threshold)
    }

    async fn exhausted(&self) -> StoreResult<bool> {
        let mut conn = self.conn();
        let (status, queued, running): (Option<String>, usize, usize) = redis::pipe()
            .atomic()
            .get(self.keys.status())
            .llen(self.keys.unprocessed())
            .hlen(self.keys.running())
            .query_async(&mut conn)
            .await?;
        let ready = status.as_deref() == Some(BuildStatus::Ready.as_str());
        Ok(ready && queued + running == 0)
    }

    async fn build_failed_fast(&self) -> StoreResult<bool> {
        let mut conn = self.conn();
        let (threshold, failures, errors): (Option<u32>, usize, usize) = redis::pipe()
            .atomic()
            .hget(self.keys.config(), "fail_fast")
            .hlen(self.keys.failures())
            .hlen(self.keys.errors())
            .query_async(&mut conn)
            .await?;
        Ok(match threshold {
            None | Some(0) => false,
            Some(threshold) => failures + errors >= threshold as usize,
        })
    }

    async fn unprocessed_len(&self) -> StoreResult<usize> {
        let mut conn = self.conn();
        let len: usize = conn.llen(self.keys.unprocessed()).await?;
        Ok(len)
    }

    async fn unprocessed_jobs(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let jobs: Vec<String> = conn.lrange(self.keys.unprocessed(), 0, -1).await?;
        Ok(jobs)
    }

    async fn running_jobs(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let running: HashMap<String, String> = conn.hgetall(self.keys.running()).await?;
        Ok(running)
    }

    async fn processed_jobs(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut jobs: Vec<String> = conn.smembers(self.keys.processed()).await?;
        jobs.sort();
        Ok(jobs)
    }

    async fn processed_count(&self) -> StoreResult<usize> {
        let mut conn = self.conn();
        let count: usize = conn.scard(self.keys.processed()).await?;
        Ok(count)
    }

    async fn example_count(&self) -> StoreResult<u64> {
        let mut conn = self.conn();
        let count: Option<u64> = conn.get(self.keys.example_count()).await?;
        Ok(count.unwrap_or(0))
    }

    async fn requeues(&self) -> StoreResult<HashMap<String, u64>> {
        let mut conn = self.conn();
        let requeues: HashMap<String, u64> = conn.hgetall(self.keys.requeues()).await?;
        Ok(requeues)
    }

    async fn example_failures(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let failures: HashMap<String, String> = conn.hgetall(self.keys.failures()).await?;
        Ok(failures)
    }

    async fn flaky_failures(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let failures: HashMap<String, String> =
            conn.hgetall(self.keys.flaky_failures()).await?;
        Ok(failures)
    }

    async fn errors(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let errors: HashMap<String, String> = conn.hgetall(self.keys.errors()).await?;
        Ok(errors)
    }

    async fn heartbeats(&self) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let beats: Vec<(String, f64)> = conn
            .zrange_withscores(self.keys.heartbeats(), 0, -1)
            .await?;
        Ok(beats)
    }

    async fn withdrawals(&self) -> StoreResult<HashMap<String, u64>> {
        let mut conn = self.conn();
        let withdrawals: HashMap<String, u64> = conn.hgetall(self.keys.withdrawals()).await?;
        Ok(withdrawals)
    }

    async fn lost_jobs(&self) -> StoreResult<HashMap<String, u64>> {
        let mut conn = self.conn();
        let lost: Vec<(String, f64)> = conn.zrange_withscores(self.keys.lost(), 0, -1).await?;
        Ok(lost
            .into_iter()
            .map(|(job, times)| (job, times as u64))
            .collect())
    }

    async fn job_location(&self, job: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let location: Option<String> = conn.hget(self.keys.job_location(), job).await?;
        Ok(location)
    }

    async fn failed_job_worker(&self, job: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let worker: Option<String> = conn.hget(self.keys.requeue_origin(), job).await?;
        Ok(worker)
    }

    async fn worker_jobs(&self, worker: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let jobs: Vec<String> = conn.lrange(self.keys.worker_jobs(worker), 0, -1).await?;
        Ok(jobs)
    }

    async fn worker_seed(&self, worker: &str) -> StoreResult<Option<u32>> {
        let mut conn = self.conn();
        let seed: Option<u32> = conn.hget(self.keys.worker_seeds(), worker).await?;
        Ok(seed)
    }

    async fn timestamps(&self) -> StoreResult<BuildTimestamps> {
        let mut conn = self.conn();
        let (elected_master_at, ready_at, finished_at): (Option<f64>, Option<f64>, Option<f64>) =
            redis::pipe()
                .get(self.keys.elected_master_at())
                .get(self.keys.ready_at())
                .get(self.keys.finished_at())
                .query_async(&mut conn)
                .await?;
        Ok(BuildTimestamps {
            elected_master_at,
            ready_at,
            finished_at,
        })
    }

    async fn build_times(&self) -> StoreResult<Vec<f64>> {
        let mut conn = self.conn();
        let times: Vec<f64> = conn.lrange(BUILD_TIMES, 0, -1).await?;
        Ok(times)
    }

    async fn global_timings(&self) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let timings: Vec<(String, f64)> = conn.zrevrange_withscores(GLOBAL_TIMINGS, 0, -1).await?;
        Ok(timings)
    }

    async fn build_timings(&self) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let timings: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.keys.build_timings(), 0, -1)
            .await?;
        Ok(timings)
    }

    async fn job_build_timing(&self, job: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.conn();
        let timing: Option<f64> = conn.zscore(self.keys.build_timings(), job).await?;
        Ok(timing)
    }
}
