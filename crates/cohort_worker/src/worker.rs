//! Worker task.
//!
//! One worker processes one chunk at a time: it receives assignments over a
//! command channel, runs the chunk processor, and reports the result plus a
//! snapshot of its caches back to the coordinator. Caches live as long as
//! the worker, so later chunks on the same worker reuse earlier resolutions.

use std::path::PathBuf;
use std::sync::Arc;

use cohort_protocol::{CacheDelta, WorkerCommand, WorkerEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::chunk::{process_chunk, ChunkError};
use crate::error_log::ErrorLogWriter;
use crate::row::RowContext;

/// Worker configuration (plain data).
pub struct WorkerConfig {
    pub worker_id: usize,
    pub csv_path: PathBuf,
    pub errors_path: PathBuf,
    pub concurrency: usize,
}

pub struct Worker {
    config: WorkerConfig,
    ctx: Arc<RowContext>,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        ctx: Arc<RowContext>,
        commands: mpsc::Receiver<WorkerCommand>,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            ctx,
            commands,
            events,
            cancel,
        }
    }

    /// Main loop: one chunk at a time until shutdown or channel close.
    pub async fn run(mut self) {
        let worker_id = self.config.worker_id;
        info!(worker_id, "worker started");

        while let Some(command) = self.commands.recv().await {
            match command {
                WorkerCommand::Shutdown => break,
                WorkerCommand::Process { chunk } => {
                    let chunk_id = chunk.chunk_id;
                    let _ = self
                        .events
                        .send(WorkerEvent::ChunkStarted { worker_id, chunk_id })
                        .await;

                    let event = match self.process(&chunk).await {
                        Ok(result) => WorkerEvent::ChunkCompleted {
                            worker_id,
                            chunk_id,
                            result,
                            delta: self.cache_delta(),
                        },
                        Err(error) => {
                            warn!(worker_id, chunk_id, %error, "chunk failed");
                            WorkerEvent::ChunkFailed {
                                worker_id,
                                chunk_id,
                                message: error.to_string(),
                            }
                        }
                    };
                    if self.events.send(event).await.is_err() {
                        // Coordinator is gone; nothing left to report to.
                        break;
                    }
                }
            }
        }

        info!(worker_id, "worker stopped");
    }

    async fn process(
        &self,
        chunk: &cohort_protocol::Chunk,
    ) -> Result<cohort_protocol::ChunkResult, ChunkError> {
        let error_log = Arc::new(
            ErrorLogWriter::open(&self.config.errors_path)
                .map_err(|e| ChunkError::Io(e.to_string()))?,
        );
        process_chunk(
            chunk,
            &self.config.csv_path,
            self.config.concurrency,
            Arc::clone(&self.ctx),
            error_log,
            self.cancel.clone(),
        )
        .await
    }

    /// Final cache entries to merge back into the coordinator.
    fn cache_delta(&self) -> CacheDelta {
        CacheDelta {
            orgs: self.ctx.orgs.snapshot(),
            roles: self.ctx.roles.snapshot(),
        }
    }
}
