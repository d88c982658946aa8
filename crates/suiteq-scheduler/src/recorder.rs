//! Engine observer that writes job outcomes to the store.

use async_trait::async_trait;
use std::time::Duration;
use suiteq_core::WorkerId;
use suiteq_core::engine::{ExampleFailure, JobObserver};
use suiteq_store::JobStore;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::heartbeat::Heartbeat;

/// Settings shared by every job a worker runs.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub max_requeues: u32,
    pub requeue_delay: Duration,
    /// Record job durations into the build timings.
    pub populate_timings: bool,
    /// Command line that runs the engine, used in rerun lines.
    pub engine_command: String,
}

/// Observer for one job run.
pub struct JobRecorder<'a> {
    store: &'a dyn JobStore,
    worker: &'a WorkerId,
    heartbeat: &'a mut Heartbeat,
    settings: &'a RecorderSettings,
    job: &'a str,
    seed: u32,
    load_error_recorded: bool,
}

impl<'a> JobRecorder<'a> {
    pub fn new(
        store: &'a dyn JobStore,
        worker: &'a WorkerId,
        heartbeat: &'a mut Heartbeat,
        settings: &'a RecorderSettings,
        job: &'a str,
        seed: u32,
    ) -> Self {
        Self {
            store,
            worker,
            heartbeat,
            settings,
            job,
            seed,
            load_error_recorded: false,
        }
    }

    /// Line that reruns a single failed example. Always the last line of a
    /// recorded failure message.
    pub fn rerun_line(&self, failure: &ExampleFailure) -> String {
        format!(
            "SUITEQ_SEED={} {} {} # {} (worker {})",
            self.seed,
            self.settings.engine_command,
            failure.location,
            failure.description,
            self.worker
        )
    }
}

#[async_trait]
impl JobObserver for JobRecorder<'_> {
    async fn suite_finished(
        &mut self,
        duration: Duration,
        example_count: u64,
    ) -> suiteq_core::Result<()> {
        self.store.increment_example_count(example_count).await?;
        if self.settings.populate_timings {
            self.store
                .record_job_timing(self.job, duration.as_secs_f64())
                .await?;
        }
        Ok(())
    }

    async fn example_finished(&mut self) -> suiteq_core::Result<()> {
        self.heartbeat.beat_if_due(self.store, self.worker).await?;
        Ok(())
    }

    async fn example_failed(&mut self, failure: ExampleFailure) -> suiteq_core::Result<()> {
        let requeued = self
            .store
            .requeue(
                &failure.id,
                self.settings.max_requeues,
                self.worker,
                &failure.location,
            )
            .await?;

        if requeued {
            info!(
                worker_id = %self.worker,
                example = %failure.id,
                "Example failed, requeued for another attempt"
            );
            self.store
                .record_flaky_failure(&failure.id, &failure.message)
                .await?;
            // Give another worker the chance to reserve it before we do.
            sleep(self.settings.requeue_delay).await;
        } else {
            warn!(worker_id = %self.worker, example = %failure.id, "Example failed");
            let mut message = failure.message.trim_end().to_string();
            for frame in &failure.backtrace {
                message.push_str("\n# ");
                message.push_str(frame);
            }
            message.push('\n');
            message.push_str(&self.rerun_line(&failure));
            self.store
                .record_example_failure(&failure.id, &message)
                .await?;
        }
        Ok(())
    }

    async fn load_error(&mut self, message: String) -> suiteq_core::Result<()> {
        if self.load_error_recorded {
            return Ok(());
        }
        warn!(worker_id = %self.worker, job = %self.job, "Job failed to load");
        self.store.record_error(self.job, &message).await?;
        self.load_error_recorded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suiteq_core::BuildId;
    use suiteq_store::{MemoryBackend, MemoryJobStore};

    fn settings(max_requeues: u32) -> RecorderSettings {
        RecorderSettings {
            max_requeues,
            requeue_delay: Duration::ZERO,
            populate_timings: true,
            engine_command: "bin/run-tests".to_string(),
        }
    }

    fn failure() -> ExampleFailure {
        ExampleFailure {
            id: "./a_spec.rb[1:1]".to_string(),
            message: "expected 1, got 2\n".to_string(),
            location: "./a_spec.rb:4".to_string(),
            description: "adds numbers".to_string(),
            backtrace: vec!["./a_spec.rb:5:in `block (2 levels)'".to_string()],
        }
    }

    fn store() -> MemoryJobStore {
        MemoryBackend::new().store(BuildId::new("b1"))
    }

    #[tokio::test]
    async fn test_failure_is_requeued_then_recorded() {
        let store = store();
        let worker = WorkerId::new("w1");
        let mut heartbeat = Heartbeat::new(Duration::from_secs(10));
        let settings = settings(1);
        let mut recorder =
            JobRecorder::new(&store, &worker, &mut heartbeat, &settings, "./a_spec.rb", 7);

        recorder.example_failed(failure()).await.unwrap();
        assert!(store.example_failures().await.unwrap().is_empty());
        assert!(store.flaky_failures().await.unwrap().contains_key("./a_spec.rb[1:1]"));
        assert_eq!(store.unprocessed_jobs().await.unwrap(), vec!["./a_spec.rb[1:1]"]);

        recorder.example_failed(failure()).await.unwrap();
        let failures = store.example_failures().await.unwrap();
        let message = &failures["./a_spec.rb[1:1]"];
        assert_eq!(
            message.lines().last(),
            Some("SUITEQ_SEED=7 bin/run-tests ./a_spec.rb:4 # adds numbers (worker w1)")
        );
        assert_eq!(
            message.as_str(),
            "expected 1, got 2\n\
             # ./a_spec.rb:5:in `block (2 levels)'\n\
             SUITEQ_SEED=7 bin/run-tests ./a_spec.rb:4 # adds numbers (worker w1)"
        );
    }

    #[tokio::test]
    async fn test_only_first_load_error_recorded() {
        let store = store();
        let worker = WorkerId::new("w1");
        let mut heartbeat = Heartbeat::new(Duration::from_secs(10));
        let settings = settings(3);
        let mut recorder =
            JobRecorder::new(&store, &worker, &mut heartbeat, &settings, "./a_spec.rb", 7);

        recorder.load_error("syntax error".to_string()).await.unwrap();
        recorder.load_error("other".to_string()).await.unwrap();
        assert_eq!(
            store.errors().await.unwrap().get("./a_spec.rb").map(String::as_str),
            Some("syntax error")
        );
        assert!(store.requeues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suite_finished_records_count_and_timing() {
        let store = store();
        let worker = WorkerId::new("w1");
        let mut heartbeat = Heartbeat::new(Duration::from_secs(10));
        let settings = settings(3);
        let mut recorder =
            JobRecorder::new(&store, &worker, &mut heartbeat, &settings, "./a_spec.rb", 7);

        recorder.example_finished().await.unwrap();
        recorder
            .suite_finished(Duration::from_millis(1500), 4)
            .await
            .unwrap();
        assert_eq!(store.example_count().await.unwrap(), 4);
        assert_eq!(store.job_build_timing("./a_spec.rb").await.unwrap(), Some(1.5));
        assert_eq!(store.heartbeats().await.unwrap().len(), 1);
    }
}
