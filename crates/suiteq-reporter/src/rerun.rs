//! Commands that replay what a worker ran up to a failing job.

use suiteq_core::BuildId;
use suiteq_core::job::file_of;
use suiteq_store::{JobStore, StoreResult};

/// The jobs a worker ran, up to and including `job`.
///
/// Falls back to the job's file when the worker ran the whole file, and to
/// the full history when neither is found.
pub fn history_until<'a>(history: &'a [String], job: &str) -> &'a [String] {
    let index = history
        .iter()
        .position(|j| j == job)
        .or_else(|| history.iter().position(|j| j == file_of(job)));
    match index {
        Some(index) => &history[..=index],
        None => history,
    }
}

/// Build the reproduction command for a failed job.
pub fn rerun_command(
    prefix: &str,
    build: &BuildId,
    seed: Option<u32>,
    history: &[String],
    job: &str,
) -> String {
    let mut command = format!("{prefix} --build {build}-rerun --worker rerun");
    if let Some(seed) = seed {
        command.push_str(&format!(" --seed {seed}"));
    }
    command.push_str(" --max-requeues 0 --fail-fast 1 --reproduction");
    for j in history_until(history, job) {
        command.push(' ');
        command.push_str(j);
    }
    command
}

/// Reproduction command for `job`, looked up from the worker that last
/// failed it. `None` if the job was never requeued.
pub async fn job_rerun_command(
    store: &dyn JobStore,
    prefix: &str,
    job: &str,
) -> StoreResult<Option<String>> {
    let Some(worker) = store.failed_job_worker(job).await? else {
        return Ok(None);
    };
    let history = store.worker_jobs(&worker).await?;
    let seed = store.worker_seed(&worker).await?;
    Ok(Some(rerun_command(prefix, store.build_id(), seed, &history, job)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_history_slicing() {
        let history = strings(&["./a.rb", "./b.rb", "./c.rb[1:1]", "./d.rb"]);
        assert_eq!(history_until(&history, "./c.rb[1:1]"), &history[..3]);
        // The whole file ran, not the example.
        assert_eq!(history_until(&history, "./b.rb[1:2]"), &history[..2]);
        assert_eq!(history_until(&history, "./zzz.rb"), &history[..]);
    }

    #[test]
    fn test_rerun_command_format() {
        let history = strings(&["./a.rb", "./b.rb", "./c.rb"]);
        let command = rerun_command("suiteq work", &BuildId::new("b42"), Some(1234), &history, "./b.rb[1:1]");
        assert_eq!(
            command,
            "suiteq work --build b42-rerun --worker rerun --seed 1234 \
             --max-requeues 0 --fail-fast 1 --reproduction ./a.rb ./b.rb"
        );
    }
}
