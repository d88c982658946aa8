//! End-of-build summary.

use std::fmt::Write;

/// A job that failed at least once and then passed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlakyJob {
    pub job: String,
    pub location: Option<String>,
    pub worker: Option<String>,
    /// Duration of the passing run, in seconds.
    pub timing: Option<f64>,
    pub rerun_command: Option<String>,
}

/// Everything the summary shows, collected from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSummary {
    /// `(example id, message)`, ordered by id.
    pub failures: Vec<(String, String)>,
    /// `(job, message)`, ordered by job.
    pub errors: Vec<(String, String)>,
    /// Threshold that was reached, if the build failed fast.
    pub failed_fast: Option<u32>,
    pub example_count: u64,
    pub processed_count: usize,
    pub requeues: u64,
    pub flaky: Vec<FlakyJob>,
    /// `(worker, times withdrawn)`, ordered by worker.
    pub withdrawals: Vec<(String, u64)>,
    pub lost_jobs: usize,
    pub since_elected: Option<f64>,
    pub since_ready: Option<f64>,
    pub total_execution_time: f64,
}

/// `m:ss`, truncating fractions of a second.
pub fn humanize_duration(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// A recorded failure without its trailing rerun line.
pub fn failure_body(message: &str) -> String {
    let lines: Vec<&str> = message.lines().collect();
    match lines.split_last() {
        Some((_, body)) => body.join("\n"),
        None => String::new(),
    }
}

/// The rerun line of a recorded failure.
pub fn failure_rerun_line(message: &str) -> &str {
    message.lines().last().unwrap_or_default()
}

impl BuildSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(threshold) = self.failed_fast {
            out.push_str("\n\n");
            let _ = writeln!(out, "The limit of {threshold} failures has been reached");
            out.push_str("Aborting...\n");
        }

        if !self.failures.is_empty() {
            out.push_str("\nFailed examples:\n\n");
            for (_, message) in &self.failures {
                let _ = writeln!(out, "  {}", failure_rerun_line(message));
            }
        }

        for (_, message) in &self.errors {
            out.push_str(message);
            if !message.ends_with('\n') {
                out.push('\n');
            }
        }

        out.push_str("\nTotal results:\n");
        let _ = write!(
            out,
            "  {} examples ({} jobs), {} failures, {} errors, {} requeues",
            self.example_count,
            self.processed_count,
            self.failures.len(),
            self.errors.len(),
            self.requeues
        );
        if !self.flaky.is_empty() {
            let _ = write!(out, ", {} flaky", self.flaky.len());
        }
        if !self.withdrawals.is_empty() {
            let _ = write!(out, ", {} withdrawals", self.withdrawals.len());
        }
        if self.lost_jobs > 0 {
            let _ = write!(out, ", {} lost jobs (unique)", self.lost_jobs);
        }
        out.push_str("\n\n\n");

        if let Some(secs) = self.since_elected {
            let _ = writeln!(out, "Spec time (from elected master)\t: {}", humanize_duration(secs));
        }
        if let Some(secs) = self.since_ready {
            let _ = writeln!(out, "Spec time (from queue ready)\t: {}", humanize_duration(secs));
        }
        let _ = writeln!(
            out,
            "Worker total execution time\t: {}",
            humanize_duration(self.total_execution_time)
        );

        if !self.withdrawals.is_empty() {
            let _ = write!(out, "\nWorkers withdrawn (count={}):\n", self.withdrawals.len());
            for (worker, count) in &self.withdrawals {
                let _ = writeln!(out, "  Worker {worker} withdrawn {count} times");
            }
        }

        if !self.flaky.is_empty() {
            out.push_str("\n\n");
            let _ = writeln!(out, "::group::Flaky jobs detected (count={}):", self.flaky.len());
            for flaky in &self.flaky {
                let timing = flaky
                    .timing
                    .map(humanize_duration)
                    .unwrap_or_else(|| "---".to_string());
                let _ = writeln!(
                    out,
                    "{} @ {} timing={timing}",
                    flaky.location.as_deref().unwrap_or(&flaky.job),
                    flaky.worker.as_deref().unwrap_or("---"),
                );
                if let Some(command) = &flaky.rerun_command {
                    let _ = write!(out, "{command}\n\n\n");
                }
            }
            out.push_str("::endgroup::\n");
        }

        out
    }
}
