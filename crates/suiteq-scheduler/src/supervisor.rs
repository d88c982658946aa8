//! Process supervisor around a single worker.
//!
//! The worker runs as a child process (normally this same binary, re-run
//! with [`SUPERVISED_CHILD_ENV`] set). Its stdin pipe is the shutdown
//! channel: closing it asks the worker to stop after the current job. A
//! worker that is still alive `graceful_shutdown_timeout` later is killed.
//! Whatever happened, the worker is removed from the build afterwards so a
//! job it was holding goes back to the queue.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use suiteq_core::WorkerId;
use suiteq_store::JobStore;
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{WorkerError, WorkerResult};

/// Set in the environment of a supervised worker.
pub const SUPERVISED_CHILD_ENV: &str = "SUITEQ_SUPERVISED_CHILD";

/// Exit code reported when the worker was terminated by a signal.
pub const FORCED_EXIT_CODE: i32 = -2;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub graceful_shutdown_timeout: Duration,
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            graceful_shutdown_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    store: Arc<dyn JobStore>,
    worker: WorkerId,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn JobStore>,
        worker: WorkerId,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            worker,
            shutdown,
        }
    }

    /// Run the worker to completion and return its exit code.
    pub async fn run(&self) -> WorkerResult<i32> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(SUPERVISED_CHILD_ENV, "1")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        info!(worker_id = %self.worker, pid = child.id(), "Spawned worker process");

        let mut pipe = child.stdin.take();
        let mut shutdown_at: Option<Instant> = None;
        let mut killed = false;
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                _ = self.shutdown.cancelled(), if shutdown_at.is_none() => {
                    info!(worker_id = %self.worker, "Shutdown requested, asking worker to stop");
                    shutdown_at = Some(Instant::now());
                }
                _ = ticker.tick() => {}
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if let Some(at) = shutdown_at {
                // Dropping the write end delivers EOF to the worker.
                drop(pipe.take());
                if !killed && at.elapsed() >= self.config.graceful_shutdown_timeout {
                    warn!(
                        worker_id = %self.worker,
                        timeout_secs = self.config.graceful_shutdown_timeout.as_secs_f64(),
                        "Worker did not stop in time, killing it"
                    );
                    child.start_kill()?;
                    killed = true;
                }
            }
        };

        match self.store.remove_worker(&self.worker).await {
            Ok(true) => warn!(
                worker_id = %self.worker,
                "Worker exited while holding a job, job requeued"
            ),
            Ok(false) => {}
            Err(e) => error!(worker_id = %self.worker, error = %e, "Failed to remove worker"),
        }

        let code = status.code().unwrap_or(FORCED_EXIT_CODE);
        info!(worker_id = %self.worker, code, "Worker exited");
        Ok(code)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use suiteq_core::BuildId;
    use suiteq_store::MemoryBackend;

    fn shell(script: &str) -> SupervisorConfig {
        let mut config = SupervisorConfig::new("sh", vec!["-c".to_string(), script.to_string()]);
        config.poll_interval = Duration::from_millis(20);
        config.graceful_shutdown_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn test_mirrors_exit_code() {
        let store = Arc::new(MemoryBackend::new().store(BuildId::new("b1")));
        let supervisor = Supervisor::new(
            shell("exit 3"),
            store,
            WorkerId::new("w1"),
            CancellationToken::new(),
        );
        assert_eq!(supervisor.run().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_child_sees_supervised_env() {
        let store = Arc::new(MemoryBackend::new().store(BuildId::new("b1")));
        let supervisor = Supervisor::new(
            shell(r#"[ "$SUITEQ_SUPERVISED_CHILD" = "1" ]"#),
            store,
            WorkerId::new("w1"),
            CancellationToken::new(),
        );
        assert_eq!(supervisor.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closing_pipe_stops_worker() {
        let store = Arc::new(MemoryBackend::new().store(BuildId::new("b1")));
        let token = CancellationToken::new();
        // `cat` exits cleanly on EOF.
        let supervisor = Supervisor::new(shell("cat > /dev/null"), store, WorkerId::new("w1"), token.clone());
        token.cancel();
        assert_eq!(supervisor.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stubborn_worker_is_killed_and_withdrawn() {
        let store = Arc::new(MemoryBackend::new().store(BuildId::new("b1")));
        let worker = WorkerId::new("w1");
        store.publish(&["./a_spec.rb".to_string()], 0, true).await.unwrap();
        store.reserve_next(&worker).await.unwrap();

        let token = CancellationToken::new();
        let supervisor = Supervisor::new(
            shell("sleep 5"),
            store.clone(),
            worker,
            token.clone(),
        );
        token.cancel();

        assert_eq!(supervisor.run().await.unwrap(), FORCED_EXIT_CODE);
        assert_eq!(store.unprocessed_jobs().await.unwrap(), vec!["./a_spec.rb"]);
        assert_eq!(store.withdrawals().await.unwrap().get("w1"), Some(&1));
    }
}
