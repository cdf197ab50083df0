//! Worker data plane.
//!
//! Design principles:
//! - Caches are worker-local; the coordinator merges snapshots after each
//!   chunk, so nothing here shares mutable state across workers.
//! - The CSV is streamed, never loaded; a chunk skips to its row range.
//! - Row-level failures are data (error records + counters), never Errs.
//!   Only CSV parse failures and cancellation fail a chunk.

pub mod cancel;
pub mod chunk;
pub mod csv_stream;
pub mod error_log;
pub mod org_cache;
pub mod retry;
pub mod role_cache;
pub mod row;
pub mod worker;

pub use cancel::CancellationToken;
pub use chunk::{process_chunk, ChunkError};
pub use error_log::ErrorLogWriter;
pub use org_cache::{OrgCache, OrgCacheConfig, OrgLookup, ResolveError, ResolveFailure};
pub use role_cache::RoleCache;
pub use row::{process_row, RowContext, RowOutcome, RowStatus};
pub use worker::{Worker, WorkerConfig};
