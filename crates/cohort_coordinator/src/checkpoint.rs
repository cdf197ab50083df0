//! Checkpoint manager: the persistent job state.
//!
//! Single writer (the coordinator); every mutation is an atomic save
//! (write `<path>.tmp`, rename). The cumulative summary is recomputed from
//! chunk results on resume, so re-running a finished job is a no-op.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cohort_protocol::{
    paths, Chunk, ChunkResult, ChunkStatus, ImportMode, ImportSummary, JobId, JobState, JobStatus,
    SerializedOrgCache,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no checkpoint found for job {0}")]
    NotFound(JobId),
    #[error("unknown chunk id {0}")]
    UnknownChunk(u32),
}

/// Inputs for a fresh job state.
pub struct CreateParams {
    /// Generated (UUID v4) when not supplied.
    pub job_id: Option<String>,
    pub csv_path: PathBuf,
    pub total_rows: u64,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub mode: ImportMode,
    pub org_id: Option<String>,
}

pub struct CheckpointManager {
    root: PathBuf,
    state: JobState,
}

impl CheckpointManager {
    /// Build the initial state and persist it.
    pub fn create(root: &Path, params: CreateParams) -> Result<Self, CheckpointError> {
        let job_id = JobId::new(
            params
                .job_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        let csv_hash = hash_file(&params.csv_path)?;
        let now = Utc::now();
        let state = JobState {
            job_id: job_id.clone(),
            csv_path: params.csv_path.display().to_string(),
            csv_hash,
            created_at: now,
            updated_at: now,
            chunk_size: params.chunk_size,
            concurrency: params.concurrency,
            total_rows: params.total_rows,
            mode: params.mode,
            org_id: params.org_id,
            chunks: Chunk::partition(params.total_rows, params.chunk_size),
            summary: ImportSummary {
                started_at: Some(now),
                ..Default::default()
            },
            org_cache: None,
            status: JobStatus::InProgress,
        };
        let mut manager = Self {
            root: root.to_path_buf(),
            state,
        };
        manager.save()?;
        info!(job_id = %manager.state.job_id, chunks = manager.state.chunks.len(), "checkpoint created");
        Ok(manager)
    }

    /// Load an existing job, re-arm failed chunks, and recompute the
    /// summary from chunk results. A CSV hash mismatch is surfaced as a
    /// warning, never an error.
    pub fn resume(
        root: &Path,
        job_id: &JobId,
        csv_path: &Path,
    ) -> Result<(Self, Vec<String>), CheckpointError> {
        let path = paths::checkpoint_file(root, job_id);
        if !path.exists() {
            return Err(CheckpointError::NotFound(job_id.clone()));
        }
        let raw = fs::read_to_string(&path)?;
        let state: JobState = serde_json::from_str(&raw)?;
        let mut manager = Self {
            root: root.to_path_buf(),
            state,
        };

        let mut warnings = Vec::new();
        match hash_file(csv_path) {
            Ok(hash) if hash != manager.state.csv_hash => {
                let message = format!(
                    "input CSV has changed since the job was created (was {}, now {})",
                    &manager.state.csv_hash[..12.min(manager.state.csv_hash.len())],
                    &hash[..12.min(hash.len())]
                );
                warn!(job_id = %manager.state.job_id, "{message}");
                warnings.push(message);
            }
            Ok(_) => {}
            Err(e) => warnings.push(format!("could not hash input CSV: {e}")),
        }

        for chunk in &mut manager.state.chunks {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
            }
        }
        manager.recompute_summary();
        if !manager.state.all_chunks_completed() {
            manager.state.status = JobStatus::InProgress;
        }
        for warning in &warnings {
            manager.state.summary.warnings.push(warning.clone());
        }
        manager.save()?;
        Ok((manager, warnings))
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn job_id(&self) -> &JobId {
        &self.state.job_id
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        paths::checkpoint_file(&self.root, &self.state.job_id)
    }

    pub fn errors_path(&self) -> PathBuf {
        paths::errors_file(&self.root, &self.state.job_id)
    }

    /// Deterministic next chunk: lowest id that is pending.
    pub fn next_pending_chunk(&self) -> Option<Chunk> {
        self.state
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .min_by_key(|c| c.chunk_id)
            .cloned()
    }

    pub fn mark_chunk_started(&mut self, chunk_id: u32) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let chunk = self
            .state
            .chunk_mut(chunk_id)
            .ok_or(CheckpointError::UnknownChunk(chunk_id))?;
        chunk.started_at = Some(now);
        self.save()
    }

    /// Record a chunk result plus the current org cache in one atomic save.
    pub fn mark_chunk_completed(
        &mut self,
        chunk_id: u32,
        result: &ChunkResult,
        org_cache: SerializedOrgCache,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let chunk = self
            .state
            .chunk_mut(chunk_id)
            .ok_or(CheckpointError::UnknownChunk(chunk_id))?;
        chunk.apply_result(result, now);
        self.state.summary.absorb(result);
        self.state
            .summary
            .warnings
            .extend(result.warnings.iter().cloned());
        self.state.org_cache = Some(org_cache);
        self.save()
    }

    pub fn mark_chunk_failed(&mut self, chunk_id: u32) -> Result<(), CheckpointError> {
        let chunk = self
            .state
            .chunk_mut(chunk_id)
            .ok_or(CheckpointError::UnknownChunk(chunk_id))?;
        chunk.status = ChunkStatus::Failed;
        self.save()
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) -> Result<(), CheckpointError> {
        self.state.summary.warnings.push(warning.into());
        self.save()
    }

    /// Close out the job.
    pub fn finalize(&mut self, status: JobStatus) -> Result<(), CheckpointError> {
        self.state.status = status;
        self.state.summary.ended_at = Some(Utc::now());
        self.save()
    }

    /// Serialized org cache from the last completed chunk, for warm-start.
    pub fn org_cache(&self) -> Option<&SerializedOrgCache> {
        self.state.org_cache.as_ref()
    }

    /// Rebuild summary counters from completed chunks only.
    fn recompute_summary(&mut self) {
        let warnings = std::mem::take(&mut self.state.summary.warnings);
        let started_at = self.state.summary.started_at;
        let mut summary = ImportSummary {
            started_at,
            warnings,
            ..Default::default()
        };
        for chunk in &self.state.chunks {
            if chunk.status == ChunkStatus::Completed {
                summary.absorb(&chunk.as_result());
            }
        }
        self.state.summary = summary;
    }

    /// Atomic save: write `<path>.tmp`, then rename over the target.
    fn save(&mut self) -> Result<(), CheckpointError> {
        self.state.updated_at = Utc::now();
        let path = self.checkpoint_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&self.state)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Streaming SHA-256 of a file, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
