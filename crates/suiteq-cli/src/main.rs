//! suiteq CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::report::ReportArgs;
use commands::work::WorkArgs;

#[derive(Parser)]
#[command(name = "suiteq")]
#[command(about = "Distribute a test suite across parallel workers", long_about = None)]
struct Cli {
    /// URL of the shared store (e.g. redis://127.0.0.1:6379/0)
    #[arg(long, global = true, env = "SUITEQ_REDIS_URL")]
    redis_url: Option<String>,

    /// Settings file (defaults to suiteq.kdl when it exists)
    #[arg(long, global = true, env = "SUITEQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a build as a worker and run jobs off its queue
    Work(WorkArgs),
    /// Follow a build, print its failures and summary, and exit non-zero if
    /// it did not pass
    Report(ReportArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the engine output and the report.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = commands::load_settings(cli.config.as_deref(), cli.redis_url)?;

    let code = match cli.command {
        Commands::Work(args) => commands::work::run(settings, args).await?,
        Commands::Report(args) => commands::report::run(settings, args).await?,
    };

    std::process::exit(code);
}
