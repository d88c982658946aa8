//! Worker that pulls jobs from the build queue.

use std::sync::Arc;
use std::time::Duration;
use suiteq_core::WorkerId;
use suiteq_core::engine::{ExecutionEngine, JobRun};
use suiteq_core::telemetry::{Telemetry, TelemetryEvent};
use suiteq_store::JobStore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::heartbeat::Heartbeat;
use crate::recorder::{JobRecorder, RecorderSettings};
use crate::schedule::{ScheduleConfig, publish_schedule};
use crate::WorkerResult;

/// What a worker does once there is nothing left for it to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdlePolicy {
    #[default]
    Exit,
    /// Keep the process alive until shut down.
    StayAlive,
}

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue was exhausted.
    Finished,
    /// The build reached its fail-fast threshold.
    FailedFast,
    /// Shutdown was requested.
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker: WorkerId,
    /// Ordering seed; random when unset.
    pub seed: Option<u32>,
    pub max_requeues: u32,
    pub fail_fast: u32,
    pub liveness: Duration,
    pub queue_wait_timeout: Duration,
    pub file_split_threshold: Option<f64>,
    pub early_release: bool,
    pub reproduction: bool,
    pub populate_timings: bool,
    pub idle: IdlePolicy,
    pub requeue_delay: Duration,
    /// Sleep when no job is available but the build is not done.
    pub backoff: Duration,
    pub engine_command: String,
}

impl WorkerConfig {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            seed: None,
            max_requeues: 3,
            fail_fast: 0,
            liveness: Duration::from_secs(60),
            queue_wait_timeout: Duration::from_secs(30),
            file_split_threshold: None,
            early_release: true,
            reproduction: false,
            populate_timings: false,
            idle: IdlePolicy::Exit,
            requeue_delay: Duration::from_millis(500),
            backoff: Duration::from_millis(100),
            engine_command: String::new(),
        }
    }
}

const IDLE_TICK: Duration = Duration::from_secs(1);

/// A worker bound to one build.
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ExecutionEngine>,
    telemetry: Arc<dyn Telemetry>,
    files: Vec<String>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        engine: Arc<dyn ExecutionEngine>,
        telemetry: Arc<dyn Telemetry>,
        files: Vec<String>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            telemetry,
            files,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop at the next tick once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.config.worker
    }

    /// Run the worker loop.
    pub async fn run(&self) -> WorkerResult<WorkerExit> {
        let worker = &self.config.worker;
        let store = self.store.as_ref();
        println!(
            "Working for build {} (worker={}, engine={})",
            store.build_id(),
            worker,
            self.engine.name()
        );

        if store.become_leader(worker).await? {
            info!(worker_id = %worker, "Elected as leader, publishing schedule");
            let schedule = ScheduleConfig {
                split_threshold: self.config.file_split_threshold,
                reproduction: self.config.reproduction,
                fail_fast: self.config.fail_fast,
                early_release: self.config.early_release,
            };
            publish_schedule(
                store,
                self.engine.as_ref(),
                self.telemetry.as_ref(),
                worker,
                &self.files,
                &schedule,
            )
            .await?;
        }

        store.wait_until_published(self.config.queue_wait_timeout).await?;

        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::random::<u32>() % 0xFFFF);
        store.save_worker_seed(worker, seed).await?;
        info!(worker_id = %worker, seed, "Starting worker");

        let recorder_settings = RecorderSettings {
            max_requeues: self.config.max_requeues,
            requeue_delay: self.config.requeue_delay,
            populate_timings: self.config.populate_timings,
            engine_command: self.config.engine_command.clone(),
        };
        let mut heartbeat = Heartbeat::for_liveness(self.config.liveness);
        let mut fail_fast_notified = false;

        loop {
            if self.shutdown.is_cancelled() {
                info!(worker_id = %worker, "Shutdown requested, stopping");
                return Ok(WorkerExit::ShutDown);
            }

            heartbeat.beat_if_due(store, worker).await?;

            if store.build_failed_fast().await? {
                if !fail_fast_notified {
                    let threshold = store.fail_fast().await?.unwrap_or_default();
                    warn!(worker_id = %worker, threshold, "Build failed fast, not starting more jobs");
                    self.telemetry.notify(TelemetryEvent::FailFast {
                        build: store.build_id().clone(),
                        worker: worker.clone(),
                        threshold,
                    });
                    fail_fast_notified = true;
                }
                match self.config.idle {
                    IdlePolicy::Exit => return Ok(WorkerExit::FailedFast),
                    IdlePolicy::StayAlive => {
                        self.idle().await;
                        continue;
                    }
                }
            }

            let now = store.now().await?;
            if let Some(lost) = store.reclaim_one_lost_job(now, self.config.liveness).await? {
                warn!(
                    worker_id = %worker,
                    job = %lost.job,
                    dead_worker = %lost.worker,
                    "Requeued job of dead worker"
                );
                continue;
            }

            match store.reserve_next(worker).await? {
                Some(job) => {
                    self.execute(&job, seed, &mut heartbeat, &recorder_settings)
                        .await?
                }
                None if store.exhausted().await? => {
                    if store.mark_finished().await? {
                        info!(worker_id = %worker, "Build finished");
                    }
                    match self.config.idle {
                        IdlePolicy::Exit => return Ok(WorkerExit::Finished),
                        IdlePolicy::StayAlive => self.idle().await,
                    }
                }
                None => sleep(self.config.backoff).await,
            }
        }
    }

    async fn execute(
        &self,
        job: &str,
        seed: u32,
        heartbeat: &mut Heartbeat,
        settings: &RecorderSettings,
    ) -> WorkerResult<()> {
        let worker = &self.config.worker;
        let store = self.store.as_ref();
        info!(worker_id = %worker, job = %job, "Reserved job");

        let run = JobRun {
            job: job.to_string(),
            seed,
        };
        let mut recorder = JobRecorder::new(store, worker, heartbeat, settings, job, seed);
        match self.engine.run(&run, &mut recorder).await {
            Ok(()) => {}
            Err(suiteq_core::Error::Store(message)) => {
                return Err(suiteq_core::Error::Store(message).into());
            }
            Err(e) => {
                error!(worker_id = %worker, job = %job, error = %e, "Engine could not run job");
                store.record_error(job, &e.to_string()).await?;
            }
        }

        store.acknowledge(job, worker).await?;
        Ok(())
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = sleep(IDLE_TICK) => {}
        }
    }
}
