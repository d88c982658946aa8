//! Reporter that follows a build until it is over.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use suiteq_core::telemetry::{Telemetry, TelemetryEvent};
use suiteq_store::JobStore;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::rerun::job_rerun_command;
use crate::summary::{BuildSummary, FlakyJob, failure_body};
use crate::{ReportError, ReportResult};

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Give up if the build is not over after this long.
    pub timeout: Duration,
    pub queue_wait_timeout: Duration,
    /// Fold this build's timings into the global history on success.
    pub update_timings: bool,
    /// Print rerun commands for flaky jobs.
    pub show_rerun_commands: bool,
    pub rerun_prefix: String,
    pub poll_interval: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            queue_wait_timeout: Duration::from_secs(30),
            update_timings: false,
            show_rerun_commands: true,
            rerun_prefix: "suiteq work".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    /// All jobs ran with no failures and no errors.
    pub successful: bool,
    pub summary: BuildSummary,
}

pub struct Reporter {
    config: ReporterConfig,
    store: Arc<dyn JobStore>,
    telemetry: Arc<dyn Telemetry>,
}

impl Reporter {
    pub fn new(config: ReporterConfig, store: Arc<dyn JobStore>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            config,
            store,
            telemetry,
        }
    }

    /// Follow the build to its end, writing failures and the summary to `out`.
    pub async fn report(&self, out: &mut (dyn Write + Send)) -> ReportResult<ReportOutcome> {
        let store = self.store.as_ref();
        store.wait_until_ready(self.config.queue_wait_timeout).await?;

        let deadline = Instant::now() + self.config.timeout;
        let mut reported: HashSet<String> = HashSet::new();
        let mut heading_printed = false;

        loop {
            let mut failures: Vec<(String, String)> =
                store.example_failures().await?.into_iter().collect();
            failures.sort();
            for (id, message) in failures {
                if !reported.insert(id) {
                    continue;
                }
                if !heading_printed {
                    writeln!(out, "\nFailures:\n")?;
                    heading_printed = true;
                }
                writeln!(out, "{}", failure_body(&message))?;
            }
            out.flush()?;

            if store.exhausted().await? || store.build_failed_fast().await? {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ReportError::Timeout(self.config.timeout.as_secs()));
            }
            sleep(self.config.poll_interval).await;
        }

        store.mark_finished().await?;
        let timestamps = store.timestamps().await?;
        let since_elected = timestamps.since_elected();
        let since_ready = timestamps.since_ready();
        let build_duration = since_elected.or(since_ready);
        if let Some(duration) = build_duration {
            store.record_build_time(duration).await?;
        }

        let successful = store.build_successful().await?;
        if self.config.update_timings && successful {
            if store.fold_build_timings().await? {
                info!(build = %store.build_id(), "Updated global job timings");
            } else {
                warn!(
                    build = %store.build_id(),
                    "Global timings changed since this build was scheduled, not updating them"
                );
            }
        }

        let summary = self.collect_summary().await?;
        write!(out, "{}", summary.render())?;
        out.flush()?;

        let flaky_failures = store.flaky_failures().await?;
        for flaky in &summary.flaky {
            self.telemetry.notify(TelemetryEvent::FlakyJob {
                build: store.build_id().clone(),
                job: flaky.job.clone(),
                worker: flaky.worker.clone(),
                location: flaky.location.clone(),
                rerun_command: job_rerun_command(store, &self.config.rerun_prefix, &flaky.job).await?,
                output: flaky_failures.get(&flaky.job).cloned(),
                build_duration,
            });
        }

        Ok(ReportOutcome {
            successful: successful && summary.failures.is_empty() && summary.errors.is_empty(),
            summary,
        })
    }

    async fn collect_summary(&self) -> ReportResult<BuildSummary> {
        let store = self.store.as_ref();

        let mut failures: Vec<(String, String)> = store.example_failures().await?.into_iter().collect();
        failures.sort();
        let mut errors: Vec<(String, String)> = store.errors().await?.into_iter().collect();
        errors.sort();
        let mut withdrawals: Vec<(String, u64)> = store.withdrawals().await?.into_iter().collect();
        withdrawals.sort();

        let failed_fast = if store.build_failed_fast().await? {
            store.fail_fast().await?
        } else {
            None
        };

        let mut flaky = Vec::new();
        for job in store.flaky_jobs().await? {
            let rerun_command = if self.config.show_rerun_commands {
                job_rerun_command(store, &self.config.rerun_prefix, &job).await?
            } else {
                None
            };
            flaky.push(FlakyJob {
                location: store.job_location(&job).await?,
                worker: store.failed_job_worker(&job).await?,
                timing: store.job_build_timing(&job).await?,
                rerun_command,
                job,
            });
        }

        let timestamps = store.timestamps().await?;
        Ok(BuildSummary {
            failures,
            errors,
            failed_fast,
            example_count: store.example_count().await?,
            processed_count: store.processed_count().await?,
            requeues: store.requeues().await?.values().sum(),
            flaky,
            withdrawals,
            lost_jobs: store.lost_jobs().await?.len(),
            since_elected: timestamps.since_elected(),
            since_ready: timestamps.since_ready(),
            total_execution_time: store.total_execution_time().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use suiteq_core::{BuildId, WorkerId};
    use suiteq_store::{MemoryBackend, MemoryJobStore};

    #[derive(Default)]
    struct CapturingTelemetry {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl Telemetry for CapturingTelemetry {
        fn notify(&self, event: TelemetryEvent) {
            self.events.lock().push(event);
        }
    }

    fn config() -> ReporterConfig {
        ReporterConfig {
            timeout: Duration::from_secs(5),
            queue_wait_timeout: Duration::from_secs(1),
            update_timings: true,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn finished_build(backend: &MemoryBackend) -> MemoryJobStore {
        let store = backend.store(BuildId::new("b1"));
        let w = WorkerId::new("w1");
        backend.set_time(100.0);
        store.become_leader(&w).await.unwrap();
        store.capture_timings_fingerprint().await.unwrap();
        store
            .publish(&["./a_spec.rb".to_string(), "./b_spec.rb".to_string()], 0, true)
            .await
            .unwrap();
        store.save_worker_seed(&w, 99).await.unwrap();
        for _ in 0..2 {
            let job = store.reserve_next(&w).await.unwrap().unwrap();
            store.increment_example_count(2).await.unwrap();
            store.record_job_timing(&job, 30.0).await.unwrap();
            store.acknowledge(&job, &w).await.unwrap();
        }
        backend.advance(Duration::from_secs(90));
        store
    }

    #[tokio::test]
    async fn test_successful_build_updates_timings() {
        let backend = MemoryBackend::new();
        let store = Arc::new(finished_build(&backend).await);
        let telemetry = Arc::new(CapturingTelemetry::default());
        let reporter = Reporter::new(config(), store.clone(), telemetry.clone());

        let mut out = Vec::new();
        let outcome = reporter.report(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(outcome.successful);
        assert!(out.contains("4 examples (2 jobs), 0 failures, 0 errors, 0 requeues"));
        assert!(out.contains("Spec time (from elected master)\t: 1:30"));
        assert!(out.contains("Worker total execution time\t: 1:00"));
        assert!(!out.contains("Failures:"));
        assert_eq!(store.build_times().await.unwrap(), vec![90.0]);
        assert_eq!(store.global_timings().await.unwrap().len(), 2);
        assert!(telemetry.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failures_and_flaky_jobs_reported() {
        let backend = MemoryBackend::new();
        let store = finished_build(&backend).await;
        let w = WorkerId::new("w1");
        store
            .record_example_failure("./a_spec.rb[1:1]", "expected true\nSUITEQ_SEED=99 bin/run-tests ./a_spec.rb:3 # works")
            .await
            .unwrap();
        store.requeue("./b_spec.rb[1:2]", 3, &w, "./b_spec.rb:8").await.unwrap();
        store.record_flaky_failure("./b_spec.rb[1:2]", "first attempt").await.unwrap();
        let job = store.reserve_next(&w).await.unwrap().unwrap();
        store.acknowledge(&job, &w).await.unwrap();

        let store = Arc::new(store);
        let telemetry = Arc::new(CapturingTelemetry::default());
        let reporter = Reporter::new(config(), store.clone(), telemetry.clone());

        let mut out = Vec::new();
        let outcome = reporter.report(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(!outcome.successful);
        assert!(out.contains("\nFailures:\n\nexpected true\n"));
        assert!(out.contains("Failed examples:\n\n  SUITEQ_SEED=99 bin/run-tests ./a_spec.rb:3 # works\n"));
        assert!(out.contains("1 failures, 0 errors, 1 requeues, 1 flaky"));
        assert!(out.contains("./b_spec.rb:8 @ w1 timing=---"));
        assert!(out.contains(
            "suiteq work --build b1-rerun --worker rerun --seed 99 --max-requeues 0 --fail-fast 1 \
             --reproduction ./a_spec.rb ./b_spec.rb"
        ));
        // Failed builds never touch the global timings.
        assert!(store.global_timings().await.unwrap().is_empty());

        let events = telemetry.events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TelemetryEvent::FlakyJob { job, output, .. } => {
                assert_eq!(job, "./b_spec.rb[1:2]");
                assert_eq!(output.as_deref(), Some("first attempt"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rerun_commands_can_be_hidden() {
        let backend = MemoryBackend::new();
        let store = finished_build(&backend).await;
        let w = WorkerId::new("w1");
        store.requeue("./a_spec.rb", 3, &w, "./a_spec.rb:1").await.unwrap();
        let job = store.reserve_next(&w).await.unwrap().unwrap();
        store.acknowledge(&job, &w).await.unwrap();

        let mut config = config();
        config.show_rerun_commands = false;
        let reporter = Reporter::new(config, Arc::new(store), Arc::new(CapturingTelemetry::default()));
        let mut out = Vec::new();
        reporter.report(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("::group::Flaky jobs detected (count=1):"));
        assert!(!out.contains("--reproduction"));
    }

    #[tokio::test]
    async fn test_times_out_on_unfinished_build() {
        let backend = MemoryBackend::new();
        let store = backend.store(BuildId::new("b1"));
        store.publish(&["./a_spec.rb".to_string()], 0, true).await.unwrap();

        let mut config = config();
        config.timeout = Duration::from_millis(30);
        let reporter = Reporter::new(config, Arc::new(store), Arc::new(CapturingTelemetry::default()));
        let err = reporter.report(&mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, ReportError::Timeout(_)));
    }
}
