//! `cohort roles` - one-shot pre-import role/permission setup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use cohort_coordinator::{process_role_definitions, RoleOutcomeKind};
use cohort_protocol::DEFAULT_RATE_PER_SEC;
use cohort_target::RateLimiter;
use cohort_worker::{OrgCache, OrgCacheConfig, RoleCache};
use comfy_table::Table;

#[derive(Args, Debug)]
pub struct RolesArgs {
    /// Role definitions CSV
    /// (role_slug, role_name, role_type, permissions, org_id, org_external_id)
    pub definitions: PathBuf,

    /// Target API base URL
    #[arg(long, env = "COHORT_API_URL")]
    pub api_url: Option<String>,

    /// Target API key
    #[arg(long, env = "COHORT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Requests per second against the target
    #[arg(long, default_value_t = DEFAULT_RATE_PER_SEC)]
    pub rate: u32,

    /// Resolve and validate without touching the target
    #[arg(long)]
    pub dry_run: bool,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = cohort_protocol::DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
}

pub async fn run(args: RolesArgs) -> Result<ExitCode> {
    anyhow::ensure!(
        args.definitions.exists(),
        "definitions CSV not found: {}",
        args.definitions.display()
    );

    let target = super::build_target(
        args.dry_run,
        args.api_url.clone(),
        args.api_key.clone(),
        args.request_timeout_ms,
    )?;
    let limiter = RateLimiter::spawn(args.rate, None);
    let orgs = OrgCache::new(
        Arc::clone(&target),
        limiter.clone(),
        OrgCacheConfig {
            dry_run: args.dry_run,
            ..Default::default()
        },
    );
    let roles = RoleCache::new(Arc::clone(&target), limiter.clone(), args.dry_run);

    let report =
        process_role_definitions(&args.definitions, target, limiter, &orgs, &roles).await?;

    let mut table = Table::new();
    table.set_header(vec!["role", "outcome"]);
    for outcome in &report.outcomes {
        let description = match &outcome.kind {
            RoleOutcomeKind::Created => "created".to_string(),
            RoleOutcomeKind::Exists => "exists".to_string(),
            RoleOutcomeKind::PermissionMismatch { missing, extra } => format!(
                "exists (permission mismatch: missing {:?}, extra {:?})",
                missing, extra
            ),
            RoleOutcomeKind::Skipped { reason } => format!("skipped ({reason})"),
            RoleOutcomeKind::Failed { message } => format!("failed ({message})"),
        };
        table.add_row(vec![outcome.role_slug.clone(), description]);
    }
    println!("{table}");
    println!(
        "{} roles created, {} permissions created, {} failed",
        report.created(),
        report.permissions_created,
        report.failed()
    );

    if report.failed() > 0 {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
