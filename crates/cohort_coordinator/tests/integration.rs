//! End-to-end coordinator runs against the in-memory target.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cohort_coordinator::{CheckpointManager, Coordinator, CreateParams};
use cohort_protocol::{
    paths, ChunkResult, ImportMode, ImportOptions, JobId, JobState, JobStatus,
};
use cohort_target::mock::MockTarget;
use cohort_target::TargetApi;
use cohort_worker::CancellationToken;

fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

fn options(csv: &Path, dir: &Path) -> ImportOptions {
    let mut options = ImportOptions::new(csv, dir.join("checkpoints"));
    options.rate_per_sec = 1_000;
    options.burst = Some(1_000);
    options
}

#[tokio::test]
async fn test_single_org_happy_path() {
    let tmp = tempfile::tempdir().unwrap();
    let csv = write_csv(tmp.path(), "users.csv", "email\nalice@example.com\nbob@example.com\n");
    let target = Arc::new(MockTarget::new());
    target.seed_org("org_A", "Acme", None);

    let mut opts = options(&csv, tmp.path());
    opts.mode = ImportMode::SingleOrg;
    opts.org_id = Some("org_A".to_string());
    opts.workers = 1;
    opts.chunk_size = 2;

    let outcome = Coordinator::new(opts, Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.summary.total, 2);
    assert_eq!(outcome.summary.successes, 2);
    assert_eq!(outcome.summary.failures, 0);
    assert_eq!(outcome.summary.memberships_created, 2);
    assert_eq!(target.memberships_for_org("org_A"), 2);

    // One chunk, completed, persisted.
    let raw = fs::read_to_string(paths::checkpoint_file(
        &tmp.path().join("checkpoints"),
        &outcome.job_id,
    ))
    .unwrap();
    let state: JobState = serde_json::from_str(&raw).unwrap();
    assert_eq!(state.chunks.len(), 1);
    assert!(state.all_chunks_completed());
}

#[tokio::test]
async fn test_multi_org_rows_share_one_created_org() {
    let tmp = tempfile::tempdir().unwrap();
    let csv = write_csv(
        tmp.path(),
        "users.csv",
        "email,org_external_id,org_name\n\
         a@example.com,ext_1,Acme\n\
         b@example.com,ext_1,Acme\n",
    );
    let target = Arc::new(MockTarget::new());

    let mut opts = options(&csv, tmp.path());
    opts.workers = 2;
    opts.chunk_size = 1;

    let outcome = Coordinator::new(opts, Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.summary.memberships_created, 2);
    // The pre-warm resolves ext_1 once; exactly one org exists afterwards.
    assert_eq!(target.org_count(), 1);
    assert_eq!(target.calls("create_org"), 1);
}

#[tokio::test]
async fn test_empty_csv_completes_with_no_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let csv = write_csv(tmp.path(), "users.csv", "email\n");
    let target = Arc::new(MockTarget::new());

    let mut opts = options(&csv, tmp.path());
    opts.mode = ImportMode::UserOnly;

    let outcome = Coordinator::new(opts, Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.summary.total, 0);
    assert_eq!(target.calls("create_user"), 0);
}

#[tokio::test]
async fn test_failures_are_counted_and_logged() {
    let tmp = tempfile::tempdir().unwrap();
    let csv = write_csv(
        tmp.path(),
        "users.csv",
        "email,first_name\nalice@example.com,Ada\n,NoEmail\n",
    );
    let target = Arc::new(MockTarget::new());

    let mut opts = options(&csv, tmp.path());
    opts.mode = ImportMode::UserOnly;

    let outcome = Coordinator::new(opts, Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.summary.successes, 1);
    assert_eq!(outcome.summary.failures, 1);

    let log = fs::read_to_string(&outcome.errors_file).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("Missing required email"));
}

/// Crash-then-resume: chunks completed before the kill are not re-attempted,
/// and the final summary matches an uninterrupted run.
#[tokio::test]
async fn test_resume_processes_only_pending_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let mut body = String::from("email\n");
    for i in 0..10 {
        body.push_str(&format!("user{i}@example.com\n"));
    }
    let csv = write_csv(tmp.path(), "users.csv", &body);
    let checkpoint_dir = tmp.path().join("checkpoints");

    // Simulate a killed run: chunks 0 and 1 (rows 1-4) already completed.
    let manager = CheckpointManager::create(
        &checkpoint_dir,
        CreateParams {
            job_id: Some("job-resume".to_string()),
            csv_path: csv.clone(),
            total_rows: 10,
            chunk_size: 2,
            concurrency: 4,
            mode: ImportMode::UserOnly,
            org_id: None,
        },
    )
    .unwrap();
    drop(manager);
    let (mut manager, _) =
        CheckpointManager::resume(&checkpoint_dir, &JobId::new("job-resume"), &csv).unwrap();
    for chunk_id in [0u32, 1] {
        let result = ChunkResult {
            successes: 2,
            users_created: 2,
            ..Default::default()
        };
        manager
            .mark_chunk_completed(chunk_id, &result, Default::default())
            .unwrap();
    }
    drop(manager);

    let target = Arc::new(MockTarget::new());
    let mut opts = options(&csv, tmp.path());
    opts.mode = ImportMode::UserOnly;
    opts.workers = 1;
    opts.chunk_size = 2;
    opts.job_id = Some("job-resume".to_string());

    let outcome = Coordinator::new(opts, Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    // Only rows 5-10 hit the target.
    assert_eq!(target.calls("create_user"), 6);
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.summary.total, 10);
    assert_eq!(outcome.summary.successes, 10);
    assert_eq!(outcome.summary.failures, 0);
}

/// Running a completed job again is a no-op with the same summary.
#[tokio::test]
async fn test_completed_job_rerun_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let csv = write_csv(tmp.path(), "users.csv", "email\na@example.com\n");
    let target = Arc::new(MockTarget::new());

    let mut opts = options(&csv, tmp.path());
    opts.mode = ImportMode::UserOnly;
    let first = Coordinator::new(opts.clone(), Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.summary.successes, 1);
    let calls_after_first = target.calls("create_user");

    let mut rerun_opts = opts;
    rerun_opts.job_id = Some(first.job_id.to_string());
    let second = Coordinator::new(rerun_opts, Arc::clone(&target) as Arc<dyn TargetApi>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.summary.successes, first.summary.successes);
    assert_eq!(second.summary.total, first.summary.total);
    assert_eq!(target.calls("create_user"), calls_after_first);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let csv = write_csv(
        tmp.path(),
        "users.csv",
        "email,org_external_id,org_name\na@example.com,ext_1,Acme\n",
    );
    let real_target = Arc::new(MockTarget::new());

    let mut opts = options(&csv, tmp.path());
    opts.dry_run = true;

    // Dry-run callers wire in the DryRunTarget; org/role caches fabricate
    // ids without touching it either way.
    let outcome = Coordinator::new(
        opts,
        Arc::new(cohort_target::DryRunTarget::new()) as Arc<dyn TargetApi>,
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(outcome.summary.successes, 1);
    assert_eq!(outcome.summary.memberships_created, 1);
    assert_eq!(real_target.calls("create_user"), 0);
}
