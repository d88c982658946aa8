//! Lua scripts run atomically on the Redis server.
//!
//! Scripts are invoked through `redis::Script`, which uses EVALSHA and, when
//! the server answers NOSCRIPT (script cache flushed or failover), loads the
//! script and retries once.

use redis::Script;

/// KEYS: unprocessed, running. ARGV: worker.
const RESERVE_JOB: &str = r#"
local job = redis.call('lpop', KEYS[1])
if job then
  redis.call('hset', KEYS[2], ARGV[1], job)
  return job
end
return nil
"#;

/// Puts the job of the first dead worker back at the head of the queue.
///
/// KEYS: heartbeats, running, unprocessed, lost. ARGV: now, liveness (secs).
const RECLAIM_LOST_JOB: &str = r#"
local deadline = tonumber(ARGV[1]) - tonumber(ARGV[2])
local dead_workers = redis.call('zrangebyscore', KEYS[1], '-inf', deadline)
for _, worker in ipairs(dead_workers) do
  local job = redis.call('hget', KEYS[2], worker)
  if job then
    redis.call('lpush', KEYS[3], job)
    redis.call('hdel', KEYS[2], worker)
    redis.call('zincrby', KEYS[4], 1, job)
    redis.call('zrem', KEYS[1], worker)
    return {job, worker}
  end
end
return nil
"#;

/// KEYS: unprocessed, requeues, requeue origin, job location, running.
/// ARGV: job, max requeues, origin worker, location.
const REQUEUE_JOB: &str = r#"
local job = ARGV[1]
local requeued_times = tonumber(redis.call('hget', KEYS[2], job) or 0)
if requeued_times >= tonumber(ARGV[2]) then
  return 0
end

if redis.call('hget', KEYS[5], ARGV[3]) == job then
  redis.call('hdel', KEYS[5], ARGV[3])
end

redis.call('lpush', KEYS[1], job)
redis.call('hset', KEYS[3], job, ARGV[3])
redis.call('hincrby', KEYS[2], job, 1)
redis.call('hset', KEYS[4], job, ARGV[4])
return 1
"#;

/// KEYS: unprocessed, heartbeats, running, withdrawals. ARGV: worker.
const REMOVE_WORKER: &str = r#"
local job = redis.call('hget', KEYS[3], ARGV[1])
redis.call('zrem', KEYS[2], ARGV[1])
if job then
  redis.call('lpush', KEYS[1], job)
  redis.call('hdel', KEYS[3], ARGV[1])
  redis.call('hincrby', KEYS[4], ARGV[1], 1)
  return 1
end
return 0
"#;

/// KEYS: status, leader, elected_master_at. ARGV: worker, now.
const BECOME_LEADER: &str = r#"
if redis.call('setnx', KEYS[1], 'initializing') == 1 then
  redis.call('set', KEYS[2], ARGV[1])
  redis.call('set', KEYS[3], ARGV[2], 'NX')
  return 1
end
return 0
"#;

/// KEYS: global timings, signature.
const CAPTURE_FINGERPRINT: &str = r#"
local entries = redis.call('zrevrange', KEYS[1], 0, -1, 'WITHSCORES')
local ascending = redis.call('zrange', KEYS[1], 0, -1, 'WITHSCORES')
redis.call('set', KEYS[2], redis.sha1hex(table.concat(ascending, '\n')))
return entries
"#;

/// KEYS: global timings, build timings, signature.
const FOLD_TIMINGS: &str = r#"
local expected = redis.call('get', KEYS[3])
if not expected then
  return 0
end

local current = redis.sha1hex(table.concat(redis.call('zrange', KEYS[1], 0, -1, 'WITHSCORES'), '\n'))
if current ~= expected then
  return 0
end

local entries = redis.call('zrange', KEYS[2], 0, -1, 'WITHSCORES')
for i = 1, #entries, 2 do
  redis.call('zadd', KEYS[1], entries[i + 1], entries[i])
end
return 1
"#;

/// Compiled scripts, hashed once per store handle.
pub(crate) struct Scripts {
    pub reserve_job: Script,
    pub reclaim_lost_job: Script,
    pub requeue_job: Script,
    pub remove_worker: Script,
    pub become_leader: Script,
    pub capture_fingerprint: Script,
    pub fold_timings: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            reserve_job: Script::new(RESERVE_JOB),
            reclaim_lost_job: Script::new(RECLAIM_LOST_JOB),
            requeue_job: Script::new(REQUEUE_JOB),
            remove_worker: Script::new(REMOVE_WORKER),
            become_leader: Script::new(BECOME_LEADER),
            capture_fingerprint: Script::new(CAPTURE_FINGERPRINT),
            fold_timings: Script::new(FOLD_TIMINGS),
        }
    }
}
