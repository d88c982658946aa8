//! `suiteq work`.

use anyhow::{Context, Result, bail};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use suiteq_config::{FileFilter, Settings, resolve_files};
use suiteq_core::telemetry::TracingTelemetry;
use suiteq_core::{BuildId, WorkerId};
use suiteq_executor::CommandEngine;
use suiteq_scheduler::shutdown::{cancel_on_stdin_close, install_shutdown_handler};
use suiteq_scheduler::{
    IdlePolicy, SUPERVISED_CHILD_ENV, Supervisor, SupervisorConfig, Worker, WorkerConfig,
};
use suiteq_store::{JobStore, RedisJobStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Hands the worker id to the supervised child, so a generated id survives
/// the re-exec.
const WORKER_ENV: &str = "SUITEQ_WORKER";

#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Build identifier, shared by every worker of the build
    #[arg(long, short = 'b', env = "SUITEQ_BUILD")]
    build: BuildId,

    /// Worker identifier, distinct within the build (random if unset)
    #[arg(long, short = 'w', env = "SUITEQ_WORKER")]
    worker: Option<WorkerId>,

    /// Seed handed to the engine
    #[arg(long, env = "SUITEQ_WORKER_SEED")]
    seed: Option<u32>,

    /// Retry a failed example up to N times before it counts as a failure
    #[arg(long, env = "SUITEQ_MAX_REQUEUES")]
    max_requeues: Option<u32>,

    /// Stop starting jobs after N failures and errors (0 disables)
    #[arg(long, env = "SUITEQ_FAIL_FAST")]
    fail_fast: Option<u32>,

    /// Split files slower than N seconds into their examples
    #[arg(long, env = "SUITEQ_FILE_SPLIT_THRESHOLD")]
    file_split_threshold: Option<f64>,

    /// Record job timings of this build
    #[arg(long, env = "SUITEQ_UPDATE_TIMINGS")]
    update_timings: bool,

    /// Run the given jobs in the given order, without timings or shuffling
    #[arg(long, env = "SUITEQ_REPRODUCTION")]
    reproduction: bool,

    /// Seconds to wait for the queue to be published
    #[arg(long, env = "SUITEQ_QUEUE_WAIT_TIMEOUT")]
    queue_wait_timeout: Option<u64>,

    /// Seconds without a heartbeat after which a worker is presumed dead
    #[arg(long)]
    liveness: Option<u64>,

    /// Seconds a worker gets to finish its job after shutdown is requested
    #[arg(long)]
    graceful_shutdown_timeout: Option<u64>,

    /// Stay alive once the queue is exhausted
    #[arg(long)]
    keep_alive: bool,

    /// Engine command line, e.g. "bin/run-tests --json"
    #[arg(long, env = "SUITEQ_ENGINE")]
    engine: Option<String>,

    /// Only run files matching this pattern (repeatable)
    #[arg(long)]
    include: Vec<String>,

    /// Skip files matching this pattern (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Run the worker in this process instead of under a supervisor
    #[arg(long)]
    no_supervisor: bool,

    /// Test files or directories
    files: Vec<String>,
}

impl WorkArgs {
    fn apply(&self, settings: &mut Settings) {
        let worker = &mut settings.worker;
        if let Some(n) = self.max_requeues {
            worker.max_requeues = n;
        }
        if let Some(n) = self.fail_fast {
            worker.fail_fast = n;
        }
        if let Some(secs) = self.file_split_threshold {
            worker.file_split_threshold = Some(secs);
        }
        if let Some(secs) = self.queue_wait_timeout {
            worker.queue_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.liveness {
            worker.liveness = Duration::from_secs(secs);
        }
        if let Some(secs) = self.graceful_shutdown_timeout {
            worker.graceful_shutdown_timeout = Duration::from_secs(secs);
        }
        worker.update_timings |= self.update_timings;
        worker.keep_alive |= self.keep_alive;

        if let Some(engine) = &self.engine {
            settings.engine = engine.split_whitespace().map(str::to_string).collect();
        }
        settings.files.include.extend(self.include.iter().cloned());
        settings.files.exclude.extend(self.exclude.iter().cloned());
    }

    /// Jobs this worker offers for scheduling. Reproduction replays the
    /// arguments exactly, repeats included.
    fn jobs(&self, settings: &Settings, cwd: &Path) -> Result<Vec<String>> {
        if self.reproduction {
            return Ok(self.files.clone());
        }
        let filter = FileFilter::new(&settings.files)?;
        Ok(resolve_files(&self.files, &filter, cwd)?)
    }
}

pub async fn run(mut settings: Settings, args: WorkArgs) -> Result<i32> {
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    if settings.engine.is_empty() {
        bail!("No engine configured: set `engine` in suiteq.kdl or pass --engine");
    }

    let build = args.build.clone();
    let worker = args.worker.clone().unwrap_or_else(WorkerId::generate);

    let store = RedisJobStore::connect(&settings.redis_url, build.clone())
        .await
        .with_context(|| format!("Failed to connect to {}", settings.redis_url))?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let supervised_child = std::env::var_os(SUPERVISED_CHILD_ENV).is_some();
    if supervised_child || args.no_supervisor {
        let shutdown = install_shutdown_handler(settings.worker.shutdown_signal)?;
        if supervised_child {
            cancel_on_stdin_close(shutdown.clone());
        }
        run_worker(&settings, &args, worker, store, shutdown).await
    } else {
        supervise(&settings, worker, store).await
    }
}

async fn supervise(settings: &Settings, worker: WorkerId, store: Arc<dyn JobStore>) -> Result<i32> {
    let shutdown = install_shutdown_handler(settings.worker.shutdown_signal)?;
    let program = std::env::current_exe().context("Failed to locate the suiteq executable")?;

    let mut config = SupervisorConfig::new(program, std::env::args().skip(1).collect());
    config.env.push((WORKER_ENV.to_string(), worker.to_string()));
    config.graceful_shutdown_timeout = settings.worker.graceful_shutdown_timeout;

    let code = Supervisor::new(config, store, worker, shutdown).run().await?;
    Ok(code)
}

async fn run_worker(
    settings: &Settings,
    args: &WorkArgs,
    worker: WorkerId,
    store: Arc<dyn JobStore>,
    shutdown: CancellationToken,
) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let files = args.jobs(settings, &cwd)?;
    info!(worker_id = %worker, files = files.len(), "Resolved test files");

    let engine = CommandEngine::new(&settings.engine)?.with_working_dir(cwd);

    let ws = &settings.worker;
    let mut config = WorkerConfig::new(worker);
    config.seed = args.seed;
    config.max_requeues = ws.max_requeues;
    config.fail_fast = ws.fail_fast;
    config.liveness = ws.liveness;
    config.queue_wait_timeout = ws.queue_wait_timeout;
    config.file_split_threshold = ws.file_split_threshold;
    config.early_release = ws.early_release;
    config.reproduction = args.reproduction;
    config.populate_timings = ws.update_timings;
    config.idle = if ws.keep_alive {
        IdlePolicy::StayAlive
    } else {
        IdlePolicy::Exit
    };
    config.engine_command = settings.engine.join(" ");

    let exit = Worker::new(
        config,
        store,
        Arc::new(engine),
        Arc::new(TracingTelemetry),
        files,
    )
    .with_shutdown(shutdown)
    .run()
    .await?;

    info!(?exit, "Worker finished");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: WorkArgs,
    }

    #[test]
    fn test_flags_override_settings() {
        let harness = Harness::parse_from([
            "suiteq",
            "--build",
            "b1",
            "--max-requeues",
            "0",
            "--fail-fast",
            "2",
            "--liveness",
            "30",
            "--keep-alive",
            "--engine",
            "bin/run-tests --json",
            "--include",
            "models/",
            "spec/",
        ]);
        let mut settings = Settings::default();
        harness.args.apply(&mut settings);

        assert_eq!(settings.worker.max_requeues, 0);
        assert_eq!(settings.worker.fail_fast, 2);
        assert_eq!(settings.worker.liveness, Duration::from_secs(30));
        assert!(settings.worker.keep_alive);
        assert_eq!(settings.engine, vec!["bin/run-tests", "--json"]);
        assert_eq!(settings.files.include, vec!["models/"]);
        assert_eq!(harness.args.files, vec!["spec/"]);
    }

    #[test]
    fn test_unset_flags_keep_settings() {
        let harness = Harness::parse_from(["suiteq", "--build", "b1"]);
        let mut settings = Settings::default();
        settings.worker.max_requeues = 7;
        settings.engine = vec!["rspec".to_string()];
        harness.args.apply(&mut settings);

        assert_eq!(settings.worker.max_requeues, 7);
        assert_eq!(settings.engine, vec!["rspec"]);
        assert!(settings.worker.early_release);
    }

    #[test]
    fn test_reproduction_keeps_jobs_verbatim() {
        let harness = Harness::parse_from([
            "suiteq",
            "--build",
            "b1-rerun",
            "--reproduction",
            "./a_spec.rb[1:1]",
            "./b_spec.rb",
            "./a_spec.rb[1:1]",
        ]);
        let jobs = harness.args.jobs(&Settings::default(), Path::new("/nonexistent")).unwrap();
        assert_eq!(jobs, vec!["./a_spec.rb[1:1]", "./b_spec.rb", "./a_spec.rb[1:1]"]);
    }

    #[test]
    fn test_normal_run_dedupes_jobs() {
        let harness = Harness::parse_from(["suiteq", "--build", "b1", "./a_spec.rb", "./a_spec.rb"]);
        let jobs = harness.args.jobs(&Settings::default(), Path::new("/nonexistent")).unwrap();
        assert_eq!(jobs, vec!["./a_spec.rb"]);
    }

    #[test]
    fn test_ids_are_validated() {
        assert!(Harness::try_parse_from(["suiteq", "--build", ""]).is_err());
        assert!(Harness::try_parse_from(["suiteq", "--build", "b1", "--worker", "a:b"]).is_err());

        let harness = Harness::parse_from(["suiteq", "--build", "b1", "--worker", "w1"]);
        assert_eq!(harness.args.build, BuildId::new("b1"));
        assert_eq!(harness.args.worker, Some(WorkerId::new("w1")));
    }
}
