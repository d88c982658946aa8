//! `suiteq report`.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use suiteq_config::Settings;
use suiteq_core::BuildId;
use suiteq_core::telemetry::TracingTelemetry;
use suiteq_reporter::{Reporter, ReporterConfig};
use suiteq_store::{JobStore, RedisJobStore};

/// Set to `1` or `true` to leave rerun commands out of the summary.
const RERUN_COMMAND_SKIP_ENV: &str = "SUITEQ_REPORTER_RERUN_COMMAND_SKIP";

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Build identifier
    #[arg(long, short = 'b', env = "SUITEQ_BUILD")]
    build: BuildId,

    /// Fail if the build is not over after N seconds
    #[arg(long, env = "SUITEQ_REPORT_TIMEOUT")]
    timeout: Option<u64>,

    /// Seconds to wait for the queue to be published
    #[arg(long, env = "SUITEQ_QUEUE_WAIT_TIMEOUT")]
    queue_wait_timeout: Option<u64>,

    /// Fold this build's timings into the global timings if it passed
    #[arg(long, env = "SUITEQ_UPDATE_TIMINGS")]
    update_timings: bool,
}

fn env_set(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true"))
}

fn reporter_config(settings: &Settings, args: &ReportArgs, skip_rerun_commands: bool) -> ReporterConfig {
    ReporterConfig {
        timeout: args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(settings.reporter.timeout),
        queue_wait_timeout: args
            .queue_wait_timeout
            .map(Duration::from_secs)
            .unwrap_or(settings.worker.queue_wait_timeout),
        update_timings: args.update_timings || settings.worker.update_timings,
        show_rerun_commands: !skip_rerun_commands,
        rerun_prefix: settings.reporter.rerun_prefix.clone(),
        ..Default::default()
    }
}

pub async fn run(settings: Settings, args: ReportArgs) -> Result<i32> {
    settings.validate().context("Invalid settings")?;
    let config = reporter_config(&settings, &args, env_set(RERUN_COMMAND_SKIP_ENV));

    let store = RedisJobStore::connect(&settings.redis_url, args.build.clone())
        .await
        .with_context(|| format!("Failed to connect to {}", settings.redis_url))?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let reporter = Reporter::new(config, store, Arc::new(TracingTelemetry));
    let mut stdout = std::io::stdout();
    let outcome = reporter.report(&mut stdout).await?;

    Ok(if outcome.successful { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ReportArgs,
    }

    #[test]
    fn test_reporter_config_from_flags() {
        let harness = Harness::parse_from(["suiteq", "--build", "b1", "--timeout", "120", "--update-timings"]);
        let config = reporter_config(&Settings::default(), &harness.args, true);

        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.queue_wait_timeout, Duration::from_secs(30));
        assert!(config.update_timings);
        assert!(!config.show_rerun_commands);
        assert_eq!(config.rerun_prefix, "suiteq work");
    }

    #[test]
    fn test_reporter_config_defaults_to_settings() {
        let harness = Harness::parse_from(["suiteq", "-b", "b1"]);
        let mut settings = Settings::default();
        settings.reporter.timeout = Duration::from_secs(900);
        let config = reporter_config(&settings, &harness.args, false);

        assert_eq!(config.timeout, Duration::from_secs(900));
        assert!(!config.update_timings);
        assert!(config.show_rerun_commands);
    }

    #[test]
    fn test_build_id_is_validated() {
        assert!(Harness::try_parse_from(["suiteq", "--build", "b 1"]).is_err());
    }
}
