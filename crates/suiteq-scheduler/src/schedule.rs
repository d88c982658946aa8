//! Turning a file list into the published job queue.
//!
//! Jobs are published longest first (LPT), using the global timing history
//! as the duration estimate. Files known to be slow are split into their
//! examples so one long file cannot dominate the build's tail.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use suiteq_core::WorkerId;
use suiteq_core::engine::ExecutionEngine;
use suiteq_core::telemetry::{Telemetry, TelemetryEvent};
use suiteq_store::JobStore;
use tracing::{debug, info, warn};

use crate::WorkerResult;

#[derive(Debug, Clone, Default)]
pub struct ScheduleConfig {
    /// Files whose known duration reaches this are split into examples.
    pub split_threshold: Option<f64>,
    /// Publish the files as given, without reordering or splitting.
    pub reproduction: bool,
    pub fail_fast: u32,
    /// Publish non-slow files before splitting the slow ones.
    pub early_release: bool,
}

/// Estimate for jobs with no history: the median known duration.
pub fn default_timing(timings: &HashMap<String, f64>) -> f64 {
    let mut durations: Vec<f64> = timings.values().copied().collect();
    if durations.is_empty() {
        return 0.0;
    }
    durations.sort_by(|a, b| b.total_cmp(a));
    durations[durations.len() / 2]
}

/// Order jobs longest first. Jobs with equal estimates keep their order.
pub fn order_by_duration(
    mut jobs: Vec<String>,
    timings: &HashMap<String, f64>,
    default: f64,
) -> Vec<String> {
    for job in &jobs {
        if !timings.contains_key(job) {
            debug!(job = %job, default, "New/untimed job");
        }
    }
    let estimate = |job: &String| timings.get(job).copied().unwrap_or(default);
    jobs.sort_by(|a, b| estimate(b).total_cmp(&estimate(a)));
    jobs
}

/// Compute and publish the schedule for a build. Called by the elected
/// leader only. Returns the final queue length.
pub async fn publish_schedule(
    store: &dyn JobStore,
    engine: &dyn ExecutionEngine,
    telemetry: &dyn Telemetry,
    worker: &WorkerId,
    files: &[String],
    config: &ScheduleConfig,
) -> WorkerResult<usize> {
    if config.reproduction {
        info!(worker_id = %worker, jobs = files.len(), "Publishing jobs in reproduction order");
        return Ok(store.publish(files, config.fail_fast, true).await?);
    }

    let timings: HashMap<String, f64> = store
        .capture_timings_fingerprint()
        .await?
        .into_iter()
        .collect();

    if timings.is_empty() {
        let mut jobs = files.to_vec();
        jobs.shuffle(&mut rand::thread_rng());
        warn!(
            worker_id = %worker,
            jobs = jobs.len(),
            "No timings found, publishing jobs in random order"
        );
        telemetry.notify(TelemetryEvent::NoTimings {
            build: store.build_id().clone(),
            worker: worker.clone(),
            queue_size: jobs.len(),
        });
        return Ok(store.publish(&jobs, config.fail_fast, true).await?);
    }

    let default = default_timing(&timings);
    let (slow, fast): (Vec<String>, Vec<String>) = match config.split_threshold {
        Some(threshold) => files
            .iter()
            .cloned()
            .partition(|file| timings.get(file).is_some_and(|t| *t >= threshold)),
        None => (Vec::new(), files.to_vec()),
    };

    if slow.is_empty() {
        let jobs = order_by_duration(fast, &timings, default);
        info!(worker_id = %worker, jobs = jobs.len(), "Publishing jobs");
        return Ok(store.publish(&jobs, config.fail_fast, true).await?);
    }

    let mut pending = fast;
    if config.early_release {
        let released = order_by_duration(std::mem::take(&mut pending), &timings, default);
        let len = store.publish(&released, config.fail_fast, false).await?;
        info!(worker_id = %worker, jobs = len, "Released fast jobs before splitting");
    }

    pending.extend(split_slow_files(store, engine, telemetry, worker, slow).await);
    let jobs = order_by_duration(pending, &timings, default);
    let len = store.publish(&jobs, config.fail_fast, true).await?;
    info!(worker_id = %worker, jobs = len, "Published jobs");
    Ok(len)
}

/// Split files into example jobs, falling back to whole files on error.
async fn split_slow_files(
    store: &dyn JobStore,
    engine: &dyn ExecutionEngine,
    telemetry: &dyn Telemetry,
    worker: &WorkerId,
    slow: Vec<String>,
) -> Vec<String> {
    info!(worker_id = %worker, files = slow.len(), "Splitting slow files into examples");
    match engine.list_examples(&slow).await {
        Ok(examples) => {
            // Files the engine listed nothing for still have to run.
            let covered: HashSet<&str> = examples
                .iter()
                .map(|id| suiteq_core::job::file_of(id))
                .collect();
            let missing: Vec<String> = slow
                .iter()
                .filter(|file| !covered.contains(file.as_str()))
                .cloned()
                .collect();
            examples.iter().cloned().chain(missing).collect()
        }
        Err(e) => {
            warn!(worker_id = %worker, error = %e, "Could not split slow files, scheduling them whole");
            telemetry.notify(TelemetryEvent::SplitFailed {
                build: store.build_id().clone(),
                worker: worker.clone(),
                files: slow.clone(),
                error: e.to_string(),
            });
            slow
        }
    }
}
