//! cohort - bulk identity import CLI.
//!
//! Exit codes: 0 success (analyzer: also when retryable errors remain),
//! 1 completed with at least one failure, 2 fatal (bad arguments, missing
//! input, unreadable checkpoint directory).

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "cohort", about = "Bulk user import engine for the target identity service")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import users from a CSV (resumable; use --job-id to continue a run)
    Import(commands::import::ImportArgs),
    /// Analyze a job's error log and build a retry CSV
    Analyze(commands::analyze::AnalyzeArgs),
    /// Create roles and permissions from a definitions CSV
    Roles(commands::roles::RolesArgs),
    /// List known jobs and their progress
    Jobs(commands::jobs::JobsArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = cohort_logging::init_logging("cohort", cli.verbose) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::from(2);
    }

    let result = match cli.command {
        Commands::Import(args) => commands::import::run(args).await,
        Commands::Analyze(args) => commands::analyze::run(args).await,
        Commands::Roles(args) => commands::roles::run(args).await,
        Commands::Jobs(args) => commands::jobs::run(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
