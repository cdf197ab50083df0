//! Canonical data model for import jobs.
//!
//! These are the serde shapes of everything the engine persists or ships
//! between tasks: the checkpoint document, chunk records, cumulative
//! summaries, cache entries, and per-row error records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identifiers
// ============================================================================

/// Canonical job identifier. Opaque string, unique per checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Canonical enums
// ============================================================================

/// How rows map onto organizations.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImportMode {
    /// Every user receives membership in one fixed organization.
    #[serde(rename = "single-org")]
    SingleOrg,
    /// Organization resolved per row via the org cache.
    #[default]
    #[serde(rename = "multi-org")]
    MultiOrg,
    /// No org columns, no memberships.
    #[serde(rename = "user-only")]
    UserOnly,
}

impl ImportMode {
    pub const ALL: &'static [ImportMode] =
        &[ImportMode::SingleOrg, ImportMode::MultiOrg, ImportMode::UserOnly];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::SingleOrg => "single-org",
            ImportMode::MultiOrg => "multi-org",
            ImportMode::UserOnly => "user-only",
        }
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single-org" | "single_org" => Ok(ImportMode::SingleOrg),
            "multi-org" | "multi_org" => Ok(ImportMode::MultiOrg),
            "user-only" | "user_only" => Ok(ImportMode::UserOnly),
            _ => Err(format!(
                "Invalid import mode: '{}'. Expected: single-org, multi-org, or user-only",
                s
            )),
        }
    }
}

/// Lifecycle of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobStatus {
    #[default]
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "in-progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a single chunk. A chunk only ever moves
/// `pending -> completed` or `pending -> failed -> pending` (on resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

/// Which stage of the row pipeline produced an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    UserCreate,
    MembershipCreate,
    OrgResolution,
    RoleAssignment,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::UserCreate => "user_create",
            ErrorType::MembershipCreate => "membership_create",
            ErrorType::OrgResolution => "org_resolution",
            ErrorType::RoleAssignment => "role_assignment",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role scope in the target service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    #[serde(rename = "EnvironmentRole")]
    Environment,
    #[serde(rename = "OrganizationRole")]
    Organization,
}

// ============================================================================
// Summaries and chunks
// ============================================================================

/// Cumulative counters for a job. Persisted inside the checkpoint and
/// recomputed from chunk results on resume so it stays idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub memberships_created: u64,
    pub users_created: u64,
    pub duplicate_users: u64,
    pub duplicate_memberships: u64,
    pub roles_assigned: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ImportSummary {
    /// Fold one chunk result into the running totals.
    pub fn absorb(&mut self, result: &ChunkResult) {
        self.total += result.successes + result.failures;
        self.successes += result.successes;
        self.failures += result.failures;
        self.memberships_created += result.memberships_created;
        self.users_created += result.users_created;
        self.duplicate_users += result.duplicate_users;
        self.duplicate_memberships += result.duplicate_memberships;
        self.roles_assigned += result.roles_assigned;
    }
}

/// Counters produced by one chunk run. The unit of checkpoint progress,
/// not of target-side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub successes: u64,
    pub failures: u64,
    pub memberships_created: u64,
    pub users_created: u64,
    pub duplicate_users: u64,
    pub duplicate_memberships: u64,
    pub roles_assigned: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A contiguous 1-indexed, inclusive `[start_row, end_row]` slice of the CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub chunk_id: u32,
    pub start_row: u64,
    pub end_row: u64,
    pub status: ChunkStatus,
    pub successes: u64,
    pub failures: u64,
    pub memberships_created: u64,
    pub users_created: u64,
    pub duplicate_users: u64,
    pub duplicate_memberships: u64,
    pub roles_assigned: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Chunk {
    pub fn new(chunk_id: u32, start_row: u64, end_row: u64) -> Self {
        Self {
            chunk_id,
            start_row,
            end_row,
            status: ChunkStatus::Pending,
            successes: 0,
            failures: 0,
            memberships_created: 0,
            users_created: 0,
            duplicate_users: 0,
            duplicate_memberships: 0,
            roles_assigned: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Partition `[1..total_rows]` into contiguous, non-overlapping chunks of
    /// at most `chunk_size` rows. An empty CSV yields no chunks.
    pub fn partition(total_rows: u64, chunk_size: u64) -> Vec<Chunk> {
        assert!(chunk_size > 0, "chunk_size must be positive");
        let mut chunks = Vec::new();
        let mut start = 1u64;
        let mut id = 0u32;
        while start <= total_rows {
            let end = (start + chunk_size - 1).min(total_rows);
            chunks.push(Chunk::new(id, start, end));
            start = end + 1;
            id += 1;
        }
        chunks
    }

    /// Number of data rows covered by this chunk.
    pub fn row_count(&self) -> u64 {
        self.end_row - self.start_row + 1
    }

    /// Record a completed run of this chunk.
    pub fn apply_result(&mut self, result: &ChunkResult, completed_at: DateTime<Utc>) {
        self.status = ChunkStatus::Completed;
        self.successes = result.successes;
        self.failures = result.failures;
        self.memberships_created = result.memberships_created;
        self.users_created = result.users_created;
        self.duplicate_users = result.duplicate_users;
        self.duplicate_memberships = result.duplicate_memberships;
        self.roles_assigned = result.roles_assigned;
        self.completed_at = Some(completed_at);
        self.duration_ms = Some(result.duration_ms);
    }

    /// The counters this chunk contributed, as a result record.
    pub fn as_result(&self) -> ChunkResult {
        ChunkResult {
            successes: self.successes,
            failures: self.failures,
            memberships_created: self.memberships_created,
            users_created: self.users_created,
            duplicate_users: self.duplicate_users,
            duplicate_memberships: self.duplicate_memberships,
            roles_assigned: self.roles_assigned,
            duration_ms: self.duration_ms.unwrap_or(0),
            warnings: Vec::new(),
        }
    }
}

// ============================================================================
// Caches
// ============================================================================

/// One resolved organization, as serialized into the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgCacheEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cached_at: DateTime<Utc>,
}

/// One resolved role. Worker-local only; shipped to the coordinator as part
/// of the cache delta, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCacheEntry {
    pub slug: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(rename = "type")]
    pub kind: RoleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl RoleCacheEntry {
    /// Cache key: `env:<slug>` for environment roles, `org:<orgId>:<slug>`
    /// otherwise.
    pub fn cache_key(&self) -> String {
        match (&self.kind, &self.org_id) {
            (RoleKind::Environment, _) => format!("env:{}", self.slug),
            (RoleKind::Organization, Some(org)) => format!("org:{}:{}", org, self.slug),
            // An org role without an org id cannot happen through the cache;
            // keep the key total anyway.
            (RoleKind::Organization, None) => format!("org:?:{}", self.slug),
        }
    }
}

/// Hit/miss accounting for a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Org cache contents as stored in the checkpoint for warm-start on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SerializedOrgCache {
    pub entries: Vec<OrgCacheEntry>,
    pub stats: CacheStats,
}

// ============================================================================
// Job state (the checkpoint document)
// ============================================================================

/// The persisted job state. One pretty-printed JSON document per job,
/// written atomically by the coordinator only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: JobId,
    pub csv_path: String,
    /// SHA-256 of the input file. Never changes after creation; a mismatch
    /// on resume is a warning, not fatal.
    pub csv_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chunk_size: u64,
    pub concurrency: usize,
    /// Data rows, header excluded.
    pub total_rows: u64,
    pub mode: ImportMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub chunks: Vec<Chunk>,
    pub summary: ImportSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_cache: Option<SerializedOrgCache>,
    pub status: JobStatus,
}

impl JobState {
    pub fn chunk(&self, chunk_id: u32) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.chunk_id == chunk_id)
    }

    pub fn chunk_mut(&mut self, chunk_id: u32) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.chunk_id == chunk_id)
    }

    pub fn all_chunks_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }

    pub fn counts_by_status(&self) -> (usize, usize, usize) {
        let mut pending = 0;
        let mut completed = 0;
        let mut failed = 0;
        for chunk in &self.chunks {
            match chunk.status {
                ChunkStatus::Pending => pending += 1,
                ChunkStatus::Completed => completed += 1,
                ChunkStatus::Failed => failed += 1,
            }
        }
        (pending, completed, failed)
    }
}

// ============================================================================
// CSV rows
// ============================================================================

/// One logical CSV row. Known columns are typed fields; anything else lands
/// in `extra` so custom columns survive into error records and the retry CSV.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserRow {
    /// 1-indexed data row number (header excluded).
    pub record_number: u64,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Raw column value; boolean-ish parsing happens in the row processor.
    pub email_verified: Option<String>,
    pub external_id: Option<String>,
    pub password: Option<String>,
    pub password_hash: Option<String>,
    pub password_hash_type: Option<String>,
    /// Raw JSON text, parsed (and validated) by the row processor.
    pub metadata: Option<String>,
    pub org_id: Option<String>,
    pub org_external_id: Option<String>,
    pub org_name: Option<String>,
    /// Raw column value; CSV or JSON array of slugs.
    pub role_slugs: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl UserRow {
    /// Verbatim column map for error records and the retry CSV.
    pub fn to_column_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let standard: [(&str, &Option<String>); 13] = [
            ("email", &self.email),
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("email_verified", &self.email_verified),
            ("external_id", &self.external_id),
            ("password", &self.password),
            ("password_hash", &self.password_hash),
            ("password_hash_type", &self.password_hash_type),
            ("metadata", &self.metadata),
            ("org_id", &self.org_id),
            ("org_external_id", &self.org_external_id),
            ("org_name", &self.org_name),
            ("role_slugs", &self.role_slugs),
        ];
        for (key, value) in standard {
            if let Some(value) = value {
                map.insert(key.to_string(), value.clone());
            }
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

// ============================================================================
// Error records
// ============================================================================

/// One JSONL line in the error log. Write-once, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub record_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub error_type: ErrorType,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Vendor error code, propagated verbatim from the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Verbatim parsed columns of the failing row.
    pub raw_row: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_slugs: Option<Vec<String>>,
}
