//! External command engine.
//!
//! Runs a test program once per job. The program receives the job id as its
//! last argument and the seed in `SUITEQ_SEED`, and reports progress as one
//! JSON object per stdout line:
//!
//! ```text
//! {"event":"example_finished"}
//! {"event":"example_failed","id":"./a_spec.rb[1:2]","message":"...","location":"./a_spec.rb:8","description":"..."}
//! {"event":"load_error","message":"..."}
//! {"event":"suite_finished","duration":1.25,"example_count":3}
//! ```
//!
//! Any other output is passed through to our stdout.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use suiteq_core::engine::{ExampleFailure, ExecutionEngine, JobObserver, JobRun};
use suiteq_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable carrying the ordering seed.
pub const SEED_ENV: &str = "SUITEQ_SEED";

/// One line of engine output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ExampleFinished,
    ExampleFailed(ExampleFailure),
    LoadError {
        message: String,
    },
    SuiteFinished {
        duration: f64,
        #[serde(default)]
        example_count: u64,
    },
}

impl EngineEvent {
    /// Parse an output line, `None` if it is not an event.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}

#[derive(Debug, Deserialize)]
struct ListOutput {
    examples: Vec<ListedExample>,
}

#[derive(Debug, Deserialize)]
struct ListedExample {
    id: String,
}

/// Engine that shells out to a test program.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandEngine {
    /// Create an engine from a command line (program followed by leading
    /// arguments).
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("engine command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExecutionEngine for CommandEngine {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn run(&self, run: &JobRun, observer: &mut dyn JobObserver) -> Result<()> {
        let started = Instant::now();
        let mut child = self
            .command()
            .arg(&run.job)
            .env(SEED_ENV, run.seed.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn {}: {e}", self.program)))?;

        debug!(program = %self.program, job = %run.job, seed = run.seed, "Spawned engine");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("engine stdout was not captured".to_string()))?;
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        let mut reported_problem = false;
        let mut suite_finished = false;
        let mut examples = 0u64;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            // Test output is not necessarily UTF-8.
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(event) = EngineEvent::parse(line) else {
                println!("{line}");
                continue;
            };
            match event {
                EngineEvent::ExampleFinished => {
                    examples += 1;
                    observer.example_finished().await?;
                }
                EngineEvent::ExampleFailed(failure) => {
                    reported_problem = true;
                    observer.example_failed(failure).await?;
                }
                EngineEvent::LoadError { message } => {
                    reported_problem = true;
                    observer.load_error(message).await?;
                }
                EngineEvent::SuiteFinished {
                    duration,
                    example_count,
                } => {
                    suite_finished = true;
                    let duration = Duration::try_from_secs_f64(duration).unwrap_or_default();
                    observer.suite_finished(duration, example_count).await?;
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() && !reported_problem {
            warn!(job = %run.job, %status, "Engine exited without reporting a failure");
            observer
                .load_error(format!(
                    "{} exited with {status} while running {}",
                    self.program, run.job
                ))
                .await?;
        }
        if !suite_finished {
            observer.suite_finished(started.elapsed(), examples).await?;
        }

        info!(job = %run.job, %status, elapsed_ms = started.elapsed().as_millis() as u64, "Engine finished");
        Ok(())
    }

    async fn list_examples(&self, files: &[String]) -> Result<Vec<String>> {
        let output = self
            .command()
            .arg("--list")
            .args(files)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ListFailed(format!("failed to spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(Error::ListFailed(format!(
                "{} --list exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let listed: ListOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::ListFailed(format!("unreadable example list: {e}")))?;
        Ok(listed.examples.into_iter().map(|e| e.id).collect())
    }
}
