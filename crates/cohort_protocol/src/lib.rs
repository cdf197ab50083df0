//! Shared types for the cohort import engine.
//!
//! Everything that crosses a boundary lives here: the persisted checkpoint
//! document, chunk records, per-row error records, the CSV row model, the
//! coordinator <-> worker channel payloads, and the checkpoint directory
//! layout. This crate does no I/O of its own.

pub mod messages;
pub mod options;
pub mod paths;
pub mod types;

// Re-export types for convenience
pub use messages::{CacheDelta, WorkerCommand, WorkerEvent};
pub use options::{
    ImportOptions, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_ORG_CACHE_CAPACITY,
    DEFAULT_RATE_PER_SEC, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_WORKERS, HARD_MAX_WORKERS,
};
pub use types::{
    CacheStats, Chunk, ChunkResult, ChunkStatus, ErrorRecord, ErrorType, ImportMode,
    ImportSummary, JobId, JobState, JobStatus, OrgCacheEntry, RoleCacheEntry, RoleKind,
    SerializedOrgCache, UserRow,
};
