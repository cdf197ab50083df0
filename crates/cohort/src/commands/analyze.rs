//! `cohort analyze` - classify a job's error log and emit retry artifacts.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use cohort_analyzer::{analyze_file, build_report, write_retry_csv};
use cohort_protocol::{paths, JobId};
use comfy_table::Table;
use tracing::info;

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Path to an errors.jsonl file (alternative to --job-id)
    pub errors_file: Option<PathBuf>,

    /// Analyze the error log of this job
    #[arg(long, conflicts_with = "errors_file")]
    pub job_id: Option<String>,

    /// Checkpoint directory (default: ~/.cohort/checkpoints)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Where to write the retry CSV (default: retry.csv next to the log)
    #[arg(long)]
    pub retry_csv: Option<PathBuf>,

    /// Where to write the JSON report (default: not written)
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Keep rows whose email already appeared in the retry CSV
    #[arg(long)]
    pub include_duplicates: bool,
}

pub async fn run(args: AnalyzeArgs) -> Result<ExitCode> {
    let errors_file = match (&args.errors_file, &args.job_id) {
        (Some(path), _) => path.clone(),
        (None, Some(job_id)) => paths::errors_file(
            &super::checkpoint_dir(args.checkpoint_dir.clone()),
            &JobId::new(job_id.clone()),
        ),
        (None, None) => anyhow::bail!("provide an errors file or --job-id"),
    };
    anyhow::ensure!(
        errors_file.exists(),
        "error log not found: {}",
        errors_file.display()
    );

    let analysis = analyze_file(&errors_file)?;
    info!(
        total = analysis.total_errors,
        groups = analysis.groups.len(),
        "analysis complete"
    );

    println!(
        "{} errors in {} groups ({} retryable, {} non-retryable)",
        analysis.total_errors,
        analysis.groups.len(),
        analysis.retryable_count(),
        analysis.non_retryable_count()
    );

    let mut table = Table::new();
    table.set_header(vec!["group", "count", "severity", "retryable", "pattern"]);
    for group in &analysis.groups {
        let mut pattern = group.pattern.clone();
        if pattern.len() > 60 {
            pattern.truncate(57);
            pattern.push_str("...");
        }
        table.add_row(vec![
            group.id.clone(),
            group.count.to_string(),
            format!("{:?}", group.severity).to_lowercase(),
            if group.retryable { "yes" } else { "no" }.to_string(),
            pattern,
        ]);
    }
    println!("{table}");

    if let Some(report_path) = &args.report {
        let report = build_report(&analysis);
        let body = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(report_path, body)
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;
        println!("report written to {}", report_path.display());
    }

    if analysis.retryable_records.is_empty() {
        println!("no retryable errors; retry CSV not generated");
    } else {
        let retry_path = args.retry_csv.clone().unwrap_or_else(|| {
            errors_file
                .parent()
                .map(|dir| dir.join("retry.csv"))
                .unwrap_or_else(|| PathBuf::from("retry.csv"))
        });
        let rows = write_retry_csv(&analysis.retryable_records, &retry_path, args.include_duplicates)?;
        println!("{} rows written to {}", rows, retry_path.display());
    }

    Ok(ExitCode::SUCCESS)
}
