//! Coordinator / worker pool.
//!
//! Lifecycle: loading (checkpoint + pre-warm) -> running (dispatch loop) ->
//! draining (shutdown commands, join workers) -> terminated (finalized
//! checkpoint). The coordinator is the only writer of the checkpoint file;
//! workers only ever talk back over the event channel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cohort_protocol::{
    ChunkStatus, ImportMode, ImportOptions, ImportSummary, JobId, JobStatus, WorkerCommand,
    WorkerEvent,
};
use cohort_target::{RateLimiter, TargetApi};
use cohort_worker::{
    csv_stream, CancellationToken, OrgCache, OrgCacheConfig, OrgLookup, RoleCache, RowContext,
    Worker, WorkerConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointManager, CreateParams};

/// Called after every chunk completion with (rows accounted for, total rows).
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Result of one coordinator run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    pub summary: ImportSummary,
    pub errors_file: PathBuf,
}

pub struct Coordinator {
    options: ImportOptions,
    target: Arc<dyn TargetApi>,
    progress: Option<ProgressFn>,
}

impl Coordinator {
    pub fn new(options: ImportOptions, target: Arc<dyn TargetApi>) -> Self {
        Self {
            options,
            target,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drive the import to completion (or cancellation).
    pub async fn run(self, cancel: CancellationToken) -> Result<RunOutcome> {
        self.options
            .validate()
            .map_err(|message| anyhow::anyhow!(message))?;
        let csv_path = self.options.csv_path.clone();
        anyhow::ensure!(
            csv_path.exists(),
            "input CSV not found: {}",
            csv_path.display()
        );

        // Unknown columns are warned once per name, here and nowhere else.
        csv_stream::read_header(&csv_path, true)?;

        let mut checkpoint = self.open_checkpoint(&csv_path)?;
        let job_id = checkpoint.job_id().clone();
        let errors_file = checkpoint.errors_path();
        let total_rows = checkpoint.state().total_rows;
        info!(%job_id, total_rows, chunks = checkpoint.state().chunks.len(), "job loaded");

        if checkpoint.state().all_chunks_completed() {
            // Nothing to do: empty CSV, or a finished job re-run.
            if checkpoint.state().status != JobStatus::Completed {
                checkpoint.finalize(JobStatus::Completed)?;
            }
            return Ok(RunOutcome {
                job_id,
                status: JobStatus::Completed,
                summary: checkpoint.state().summary.clone(),
                errors_file,
            });
        }

        let limiter = RateLimiter::spawn(self.options.rate_per_sec, self.options.burst);
        let org_config = OrgCacheConfig {
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        // Authoritative caches live here; workers get seeded copies and ship
        // their entries back as deltas.
        let orgs = Arc::new(OrgCache::new(
            Arc::clone(&self.target),
            limiter.clone(),
            org_config.clone(),
        ));
        if let Some(serialized) = checkpoint.org_cache() {
            orgs.restore(serialized);
            info!(entries = orgs.len(), "org cache warm-started from checkpoint");
        }
        let roles = Arc::new(RoleCache::new(
            Arc::clone(&self.target),
            limiter.clone(),
            self.options.dry_run,
        ));

        let user_roles = Arc::new(match &self.options.user_roles_csv {
            Some(path) => load_user_roles(path)?,
            None => HashMap::new(),
        });

        self.prewarm(&csv_path, &orgs, &roles, &cancel, &mut checkpoint)
            .await?;

        // Spawn the worker pool.
        let pending = checkpoint
            .state()
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .count();
        let worker_count = self.options.effective_workers().min(pending.max(1));
        let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(32);
        let mut command_txs = Vec::with_capacity(worker_count);
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>(1);
            command_txs.push(command_tx);

            let worker_orgs = Arc::new(OrgCache::new(
                Arc::clone(&self.target),
                limiter.clone(),
                org_config.clone(),
            ));
            worker_orgs.merge_entries(orgs.snapshot());
            let worker_roles = Arc::new(RoleCache::new(
                Arc::clone(&self.target),
                limiter.clone(),
                self.options.dry_run,
            ));
            worker_roles.merge_entries(roles.snapshot());

            let ctx = Arc::new(RowContext {
                mode: self.options.mode,
                org_id: checkpoint.state().org_id.clone(),
                require_membership: self.options.require_membership,
                create_missing_orgs: self.options.create_missing_orgs,
                target: Arc::clone(&self.target),
                limiter: limiter.clone(),
                orgs: worker_orgs,
                roles: worker_roles,
                user_roles: Arc::clone(&user_roles),
            });
            let worker = Worker::new(
                WorkerConfig {
                    worker_id,
                    csv_path: csv_path.clone(),
                    errors_path: errors_file.clone(),
                    concurrency: self.options.concurrency,
                },
                ctx,
                command_rx,
                event_tx.clone(),
                cancel.clone(),
            );
            workers.spawn(worker.run());
        }
        drop(event_tx);

        // Dispatch loop: chunks go out in id order, complete in any order.
        let mut idle: Vec<usize> = (0..worker_count).rev().collect();
        let mut assigned: HashSet<u32> = HashSet::new();
        let mut in_flight = 0usize;
        let mut draining = false;

        loop {
            while !cancel.is_cancelled() {
                let Some(worker_id) = idle.pop() else { break };
                let next = checkpoint
                    .state()
                    .chunks
                    .iter()
                    .filter(|c| c.status == ChunkStatus::Pending && !assigned.contains(&c.chunk_id))
                    .min_by_key(|c| c.chunk_id)
                    .cloned();
                let Some(chunk) = next else {
                    idle.push(worker_id);
                    break;
                };
                let chunk_id = chunk.chunk_id;
                checkpoint.mark_chunk_started(chunk_id)?;
                debug!(worker_id, chunk_id, "dispatching chunk");
                if command_txs[worker_id]
                    .send(WorkerCommand::Process { chunk })
                    .await
                    .is_err()
                {
                    warn!(worker_id, chunk_id, "worker gone; chunk will retry on resume");
                    checkpoint.mark_chunk_failed(chunk_id)?;
                    continue;
                }
                assigned.insert(chunk_id);
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !draining => {
                    info!("cancellation requested; draining in-flight chunks");
                    limiter.shutdown();
                    draining = true;
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        WorkerEvent::ChunkStarted { worker_id, chunk_id } => {
                            debug!(worker_id, chunk_id, "chunk started");
                        }
                        WorkerEvent::ChunkCompleted { worker_id, chunk_id, result, delta } => {
                            in_flight -= 1;
                            assigned.remove(&chunk_id);
                            idle.push(worker_id);
                            orgs.merge_entries(delta.orgs);
                            roles.merge_entries(delta.roles);
                            checkpoint.mark_chunk_completed(chunk_id, &result, orgs.serialize())?;
                            if let Some(progress) = &self.progress {
                                progress(checkpoint.state().summary.total, total_rows);
                            }
                        }
                        WorkerEvent::ChunkFailed { worker_id, chunk_id, message } => {
                            in_flight -= 1;
                            assigned.remove(&chunk_id);
                            idle.push(worker_id);
                            warn!(worker_id, chunk_id, %message, "chunk failed");
                            checkpoint.mark_chunk_failed(chunk_id)?;
                        }
                    }
                }
            }
        }

        // Draining: stop workers, then the limiter.
        for command_tx in &command_txs {
            let _ = command_tx.send(WorkerCommand::Shutdown).await;
        }
        drop(command_txs);
        while workers.join_next().await.is_some() {}
        limiter.shutdown();

        // Anything still assigned never reported back (worker crash).
        for chunk_id in assigned {
            checkpoint.mark_chunk_failed(chunk_id)?;
        }

        let status = if checkpoint.state().all_chunks_completed() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        checkpoint.finalize(status)?;
        info!(%job_id, ?status, "job finished");

        Ok(RunOutcome {
            job_id,
            status,
            summary: checkpoint.state().summary.clone(),
            errors_file,
        })
    }

    fn open_checkpoint(&self, csv_path: &Path) -> Result<CheckpointManager> {
        match &self.options.job_id {
            Some(job_id) => {
                let (manager, warnings) = CheckpointManager::resume(
                    &self.options.checkpoint_dir,
                    &JobId::new(job_id.clone()),
                    csv_path,
                )
                .context("Failed to resume checkpoint")?;
                for warning in warnings {
                    warn!("{warning}");
                }
                Ok(manager)
            }
            None => {
                let total_rows = csv_stream::count_data_rows(csv_path)?;
                CheckpointManager::create(
                    &self.options.checkpoint_dir,
                    CreateParams {
                        job_id: None,
                        csv_path: csv_path.to_path_buf(),
                        total_rows,
                        chunk_size: self.options.chunk_size,
                        concurrency: self.options.concurrency,
                        mode: self.options.mode,
                        org_id: self.options.org_id.clone(),
                    },
                )
                .context("Failed to create checkpoint")
            }
        }
    }

    /// Warm the caches before dispatching: unique orgs from a fast CSV scan,
    /// then each org's roles. Workers never attempt to create an org the
    /// pre-warm already resolved.
    async fn prewarm(
        &self,
        csv_path: &Path,
        orgs: &Arc<OrgCache>,
        roles: &Arc<RoleCache>,
        cancel: &CancellationToken,
        checkpoint: &mut CheckpointManager,
    ) -> Result<()> {
        let mut resolved = Vec::new();
        match self.options.mode {
            ImportMode::UserOnly => return Ok(()),
            ImportMode::SingleOrg => {
                if let Some(org_id) = &self.options.org_id {
                    resolved.push(org_id.clone());
                }
            }
            ImportMode::MultiOrg => {
                let unique = csv_stream::scan_unique_orgs(csv_path)?;
                info!(count = unique.len(), "pre-warming organization cache");
                for (external_id, name) in unique {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let lookup = OrgLookup {
                        org_external_id: Some(&external_id),
                        create_if_missing: self.options.create_missing_orgs && name.is_some(),
                        org_name: name.as_deref(),
                        ..Default::default()
                    };
                    match orgs.resolve(lookup).await {
                        Ok(Some(org_id)) => resolved.push(org_id),
                        Ok(None) => {
                            checkpoint.push_warning(format!(
                                "organization not found during pre-warm: {external_id}"
                            ))?;
                        }
                        Err(error) => {
                            warn!(external_id, %error, "organization pre-warm failed");
                        }
                    }
                }
            }
        }

        for org_id in &resolved {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(error) = roles.warm_from_organization(org_id).await {
                warn!(org_id, %error, "role pre-warm failed");
            }
        }
        Ok(())
    }
}

/// Load the `external_id -> role slugs` side input.
fn load_user_roles(path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open user-roles CSV: {}", path.display()))?;
    let headers = reader.headers().context("Failed to read user-roles header")?;
    let external_id_idx = headers
        .iter()
        .position(|h| h.trim() == "external_id")
        .context("user-roles CSV is missing the 'external_id' column")?;
    let slugs_idx = headers
        .iter()
        .position(|h| h.trim() == "role_slugs")
        .context("user-roles CSV is missing the 'role_slugs' column")?;

    let mut mapping: HashMap<String, Vec<String>> = HashMap::new();
    for record in reader.records() {
        let record = record.context("user-roles CSV parse error")?;
        let external_id = record.get(external_id_idx).unwrap_or("").trim();
        if external_id.is_empty() {
            continue;
        }
        let slugs = csv_stream::parse_role_slugs(record.get(slugs_idx).unwrap_or(""));
        if slugs.is_empty() {
            continue;
        }
        let entry = mapping.entry(external_id.to_string()).or_default();
        for slug in slugs {
            if !entry.contains(&slug) {
                entry.push(slug);
            }
        }
    }
    Ok(mapping)
}
