//! Chunk processor: stream the CSV, skip to the chunk's row range, and run
//! rows through the processor under a local concurrency semaphore.
//!
//! Row failures are counts plus error-log lines, never `Err`s. The only
//! chunk-fatal conditions are CSV parse errors and cancellation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cohort_protocol::{Chunk, ChunkResult};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::cancel::CancellationToken;
use crate::csv_stream::{self, HeaderMap};
use crate::error_log::ErrorLogWriter;
use crate::row::{process_row, RowContext, RowStatus};

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("CSV parse error: {0}")]
    Csv(String),
    #[error("chunk cancelled")]
    Cancelled,
    #[error("{0}")]
    Io(String),
}

/// Process every row in `[chunk.start_row, chunk.end_row]`.
///
/// The CSV is streamed from the beginning; rows outside the range are
/// discarded. The error log is flushed before returning on every path.
pub async fn process_chunk(
    chunk: &Chunk,
    csv_path: &Path,
    concurrency: usize,
    ctx: Arc<RowContext>,
    error_log: Arc<ErrorLogWriter>,
    cancel: CancellationToken,
) -> Result<ChunkResult, ChunkError> {
    let started = Instant::now();

    let mut reader = csv_stream::open_reader(csv_path).map_err(|e| ChunkError::Io(e.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|e| ChunkError::Csv(e.to_string()))?
        .clone();
    let header = HeaderMap::from_headers(&headers, false).map_err(|e| ChunkError::Csv(e.to_string()))?;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let totals = Arc::new(Mutex::new(ChunkResult::default()));
    let row_cancelled = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();
    let mut interrupted = false;

    for (index, record) in reader.records().enumerate() {
        let record_number = index as u64 + 1;
        if record_number < chunk.start_row {
            // Still consume parse errors in the skipped prefix.
            record.map_err(|e| ChunkError::Csv(e.to_string()))?;
            continue;
        }
        if record_number > chunk.end_row {
            break;
        }
        if cancel.is_cancelled() || row_cancelled.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }

        let record = record.map_err(|e| ChunkError::Csv(e.to_string()))?;
        let row = header.parse_row(&record, record_number);

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.expect("chunk semaphore never closed")
            }
        };

        let ctx = Arc::clone(&ctx);
        let error_log = Arc::clone(&error_log);
        let totals = Arc::clone(&totals);
        let row_cancelled = Arc::clone(&row_cancelled);
        tasks.spawn(async move {
            let _permit = permit;
            let outcome = process_row(&ctx, &row).await;

            for record in &outcome.errors {
                if let Err(e) = error_log.append(record) {
                    error!(record = row.record_number, %e, "failed to append error record");
                }
            }

            let mut totals = totals.lock().expect("chunk totals poisoned");
            match outcome.status {
                RowStatus::Success => totals.successes += 1,
                RowStatus::Failed => totals.failures += 1,
                RowStatus::Cancelled => {
                    row_cancelled.store(true, Ordering::SeqCst);
                }
            }
            totals.users_created += outcome.users_created;
            totals.memberships_created += outcome.memberships_created;
            totals.duplicate_users += outcome.duplicate_users;
            totals.duplicate_memberships += outcome.duplicate_memberships;
            totals.roles_assigned += outcome.roles_assigned;
            totals.warnings.extend(outcome.warnings);
        });
    }

    // Let in-flight rows finish before deciding the chunk's fate.
    while tasks.join_next().await.is_some() {}

    if let Err(e) = error_log.flush() {
        error!(%e, "failed to flush error log");
    }

    if interrupted || cancel.is_cancelled() || row_cancelled.load(Ordering::SeqCst) {
        return Err(ChunkError::Cancelled);
    }

    let mut result = match Arc::try_unwrap(totals) {
        Ok(mutex) => mutex.into_inner().expect("chunk totals poisoned"),
        Err(arc) => arc.lock().expect("chunk totals poisoned").clone(),
    };
    result.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        chunk_id = chunk.chunk_id,
        successes = result.successes,
        failures = result.failures,
        duration_ms = result.duration_ms,
        "chunk complete"
    );
    Ok(result)
}
