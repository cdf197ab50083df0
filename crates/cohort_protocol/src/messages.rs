//! Coordinator <-> worker channel payloads.
//!
//! Workers are in-process tasks, but everything crossing the channel is a
//! plain serializable record: no shared mutable state, cache state travels
//! as explicit deltas.

use serde::{Deserialize, Serialize};

use crate::types::{Chunk, ChunkResult, OrgCacheEntry, RoleCacheEntry};

/// Coordinator -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkerCommand {
    /// Process one chunk of the CSV.
    Process { chunk: Chunk },
    /// Finish the current chunk (if any) and exit.
    Shutdown,
}

/// Cache entries a worker accumulated while processing a chunk. Merged
/// add-only into the coordinator's caches; entries for the same key are
/// semantically equal, so ordering does not matter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheDelta {
    pub orgs: Vec<OrgCacheEntry>,
    pub roles: Vec<RoleCacheEntry>,
}

impl CacheDelta {
    pub fn is_empty(&self) -> bool {
        self.orgs.is_empty() && self.roles.is_empty()
    }
}

/// Worker -> coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkerEvent {
    ChunkStarted {
        worker_id: usize,
        chunk_id: u32,
    },
    ChunkCompleted {
        worker_id: usize,
        chunk_id: u32,
        result: ChunkResult,
        delta: CacheDelta,
    },
    /// A chunk-fatal error (CSV parse failure, cancellation). Row-level
    /// failures never surface here; they are counts in `ChunkCompleted`.
    ChunkFailed {
        worker_id: usize,
        chunk_id: u32,
        message: String,
    },
}
