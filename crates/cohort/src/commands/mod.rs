pub mod analyze;
pub mod import;
pub mod jobs;
pub mod roles;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use cohort_target::{DryRunTarget, HttpTarget, HttpTargetConfig, TargetApi};

/// Build the target handle shared by import and roles commands.
pub fn build_target(
    dry_run: bool,
    api_url: Option<String>,
    api_key: Option<String>,
    timeout_ms: u64,
) -> Result<Arc<dyn TargetApi>> {
    if dry_run {
        return Ok(Arc::new(DryRunTarget::new()));
    }
    let base_url = api_url
        .ok_or_else(|| anyhow::anyhow!("--api-url (or COHORT_API_URL) is required unless --dry-run"))?;
    let api_key = api_key
        .ok_or_else(|| anyhow::anyhow!("--api-key (or COHORT_API_KEY) is required unless --dry-run"))?;
    let target = HttpTarget::new(HttpTargetConfig {
        base_url,
        api_key,
        timeout_ms,
    })
    .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
    Ok(Arc::new(target))
}

/// Default checkpoint directory unless overridden.
pub fn checkpoint_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(cohort_logging::default_checkpoint_dir)
}
