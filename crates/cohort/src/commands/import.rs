//! `cohort import` - run or resume a bulk import.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use cohort_coordinator::Coordinator;
use cohort_protocol::{
    ImportMode, ImportOptions, ImportSummary, JobStatus, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY,
    DEFAULT_RATE_PER_SEC, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_WORKERS,
};
use cohort_worker::CancellationToken;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Input CSV of users
    pub csv: PathBuf,

    /// Import mode: single-org, multi-org, or user-only
    #[arg(long, default_value = "multi-org")]
    pub mode: ImportMode,

    /// Organization id (required for single-org mode)
    #[arg(long)]
    pub org_id: Option<String>,

    /// Target API base URL
    #[arg(long, env = "COHORT_API_URL")]
    pub api_url: Option<String>,

    /// Target API key
    #[arg(long, env = "COHORT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Requests per second against the target
    #[arg(long, default_value_t = DEFAULT_RATE_PER_SEC)]
    pub rate: u32,

    /// Optional burst size for the rate limiter
    #[arg(long)]
    pub burst: Option<u32>,

    /// Worker tasks processing chunks in parallel
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Concurrent rows per worker
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Rows per chunk (the unit of checkpointing)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Checkpoint directory (default: ~/.cohort/checkpoints)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Resume the job with this id instead of starting a new one
    #[arg(long)]
    pub job_id: Option<String>,

    /// Delete the created user when its membership cannot be created
    #[arg(long)]
    pub require_membership: bool,

    /// Do not create organizations that are missing in the target
    #[arg(long)]
    pub no_create_orgs: bool,

    /// Resolve and validate without touching the target
    #[arg(long)]
    pub dry_run: bool,

    /// Optional CSV of external_id,role_slugs merged into each row
    #[arg(long)]
    pub user_roles: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
}

pub async fn run(args: ImportArgs) -> Result<ExitCode> {
    anyhow::ensure!(args.csv.exists(), "input CSV not found: {}", args.csv.display());

    let mut options = ImportOptions::new(
        args.csv.clone(),
        super::checkpoint_dir(args.checkpoint_dir.clone()),
    );
    options.mode = args.mode;
    options.org_id = args.org_id.clone();
    options.chunk_size = args.chunk_size;
    options.concurrency = args.concurrency;
    options.workers = args.workers;
    options.rate_per_sec = args.rate;
    options.burst = args.burst;
    options.require_membership = args.require_membership;
    options.create_missing_orgs = !args.no_create_orgs;
    options.dry_run = args.dry_run;
    options.job_id = args.job_id.clone();
    options.user_roles_csv = args.user_roles.clone();
    options.request_timeout_ms = args.request_timeout_ms;
    options
        .validate()
        .map_err(|message| anyhow::anyhow!(message))?;

    let target = super::build_target(
        args.dry_run,
        args.api_url.clone(),
        args.api_key.clone(),
        args.request_timeout_ms,
    )?;

    // Ctrl-C drains in-flight chunks; a second Ctrl-C kills the process.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt received, draining (Ctrl-C again to force quit)");
                cancel.cancel();
            }
        });
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} rows {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let progress_bar = bar.clone();
    let coordinator = Coordinator::new(options, target).with_progress(Arc::new(
        move |done, total| {
            if progress_bar.length() != Some(total) {
                progress_bar.set_length(total);
            }
            progress_bar.set_position(done);
        },
    ));

    let outcome = coordinator.run(cancel).await?;
    bar.finish_and_clear();

    info!(job_id = %outcome.job_id, status = %outcome.status, "import finished");
    println!("Job {} {}", outcome.job_id, outcome.status);
    print_summary(&outcome.summary);
    if outcome.summary.failures > 0 {
        println!(
            "\n{} failed rows logged to {}",
            outcome.summary.failures,
            outcome.errors_file.display()
        );
        println!(
            "Run `cohort analyze --job-id {}` to classify them and build a retry CSV.",
            outcome.job_id
        );
    }

    if outcome.status == JobStatus::Completed && outcome.summary.failures == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn print_summary(summary: &ImportSummary) {
    let mut table = Table::new();
    table.set_header(vec!["metric", "count"]);
    table.add_row(vec!["rows processed".to_string(), summary.total.to_string()]);
    table.add_row(vec!["successes".to_string(), summary.successes.to_string()]);
    table.add_row(vec!["failures".to_string(), summary.failures.to_string()]);
    table.add_row(vec!["users created".to_string(), summary.users_created.to_string()]);
    table.add_row(vec![
        "memberships created".to_string(),
        summary.memberships_created.to_string(),
    ]);
    table.add_row(vec![
        "duplicate users".to_string(),
        summary.duplicate_users.to_string(),
    ]);
    table.add_row(vec![
        "duplicate memberships".to_string(),
        summary.duplicate_memberships.to_string(),
    ]);
    table.add_row(vec![
        "roles assigned".to_string(),
        summary.roles_assigned.to_string(),
    ]);
    println!("{table}");

    if !summary.warnings.is_empty() {
        println!("\nwarnings ({}):", summary.warnings.len());
        for warning in summary.warnings.iter().take(10) {
            println!("  - {warning}");
        }
        if summary.warnings.len() > 10 {
            println!("  ... and {} more", summary.warnings.len() - 10);
        }
    }
}
