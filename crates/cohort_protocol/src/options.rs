//! Job configuration with engine-wide defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ImportMode;

/// Requests per second against the target API.
pub const DEFAULT_RATE_PER_SEC: u32 = 10;
/// Data rows per chunk.
pub const DEFAULT_CHUNK_SIZE: u64 = 500;
/// Concurrent row processors per worker.
pub const DEFAULT_CONCURRENCY: usize = 10;
/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;
/// Hard worker cap.
pub const HARD_MAX_WORKERS: usize = 8;
/// Org cache capacity (entries).
pub const DEFAULT_ORG_CACHE_CAPACITY: usize = 10_000;
/// Per-request timeout against the target API.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Everything a single import run needs to know. Built by the CLI, consumed
/// by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    pub csv_path: PathBuf,
    pub mode: ImportMode,
    /// Resolved organization id for single-org mode.
    pub org_id: Option<String>,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub workers: usize,
    pub rate_per_sec: u32,
    pub burst: Option<u32>,
    /// Roll back the created user when its membership cannot be created.
    pub require_membership: bool,
    /// Create organizations on cache miss when the row carries an org name.
    pub create_missing_orgs: bool,
    pub dry_run: bool,
    pub checkpoint_dir: PathBuf,
    /// Resume an existing job instead of creating a new one.
    pub job_id: Option<String>,
    /// Optional side input: CSV of `external_id,role_slugs` merged into each
    /// row's own role slugs.
    pub user_roles_csv: Option<PathBuf>,
    pub request_timeout_ms: u64,
}

impl ImportOptions {
    pub fn new(csv_path: impl Into<PathBuf>, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            mode: ImportMode::MultiOrg,
            org_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            workers: DEFAULT_WORKERS,
            rate_per_sec: DEFAULT_RATE_PER_SEC,
            burst: None,
            require_membership: false,
            create_missing_orgs: true,
            dry_run: false,
            checkpoint_dir: checkpoint_dir.into(),
            job_id: None,
            user_roles_csv: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    /// Clamp the worker count into `[1, HARD_MAX_WORKERS]`.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, HARD_MAX_WORKERS)
    }

    /// Validate cross-field constraints the CLI cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk size must be at least 1".to_string());
        }
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        if self.rate_per_sec == 0 {
            return Err("rate must be at least 1 request/sec".to_string());
        }
        match self.mode {
            ImportMode::SingleOrg if self.org_id.is_none() => {
                Err("single-org mode requires an organization id".to_string())
            }
            ImportMode::UserOnly if self.org_id.is_some() => {
                Err("user-only mode does not take an organization id".to_string())
            }
            _ => Ok(()),
        }
    }
}
