//! `cohort jobs` - list checkpointed jobs and their progress.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use cohort_protocol::{paths, JobState};
use comfy_table::Table;

#[derive(Args, Debug)]
pub struct JobsArgs {
    /// Checkpoint directory (default: ~/.cohort/checkpoints)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
}

pub fn run(args: JobsArgs) -> Result<ExitCode> {
    let dir = super::checkpoint_dir(args.checkpoint_dir);
    if !dir.exists() {
        println!("no jobs found ({} does not exist)", dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut states: Vec<JobState> = Vec::new();
    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("unreadable checkpoint directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let checkpoint = entry.path().join(paths::CHECKPOINT_FILE);
        if !checkpoint.is_file() {
            continue;
        }
        let raw = std::fs::read_to_string(&checkpoint)
            .with_context(|| format!("unreadable checkpoint: {}", checkpoint.display()))?;
        match serde_json::from_str::<JobState>(&raw) {
            Ok(state) => states.push(state),
            Err(e) => eprintln!("skipping {}: {e}", checkpoint.display()),
        }
    }

    if states.is_empty() {
        println!("no jobs found in {}", dir.display());
        return Ok(ExitCode::SUCCESS);
    }
    states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let mut table = Table::new();
    table.set_header(vec![
        "job", "status", "mode", "chunks", "successes", "failures", "updated",
    ]);
    for state in &states {
        let (pending, completed, failed) = state.counts_by_status();
        table.add_row(vec![
            state.job_id.to_string(),
            state.status.to_string(),
            state.mode.to_string(),
            format!("{}/{} done, {} failed, {} pending", completed, state.chunks.len(), failed, pending),
            state.summary.successes.to_string(),
            state.summary.failures.to_string(),
            state.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(ExitCode::SUCCESS)
}
