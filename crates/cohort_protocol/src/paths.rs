//! Checkpoint directory layout.
//!
//! ```text
//! <checkpoint_dir>/
//!   <job_id>/
//!     checkpoint.json     # atomic-renamed state document
//!     errors.jsonl        # one JSON object per failed row
//! ```

use std::path::{Path, PathBuf};

use crate::types::JobId;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const ERRORS_FILE: &str = "errors.jsonl";

/// Directory holding one job's checkpoint and error log.
pub fn job_dir(checkpoint_dir: &Path, job_id: &JobId) -> PathBuf {
    checkpoint_dir.join(sanitize_job_id(job_id.as_str()))
}

/// Path of the job's state document.
pub fn checkpoint_file(checkpoint_dir: &Path, job_id: &JobId) -> PathBuf {
    job_dir(checkpoint_dir, job_id).join(CHECKPOINT_FILE)
}

/// Path of the job's append-only error log.
pub fn errors_file(checkpoint_dir: &Path, job_id: &JobId) -> PathBuf {
    job_dir(checkpoint_dir, job_id).join(ERRORS_FILE)
}

/// Job ids come from user flags; keep them filesystem-safe.
fn sanitize_job_id(job_id: &str) -> String {
    job_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let job_id = JobId::new("job-20260801-1");
        let root = Path::new("/tmp/checkpoints");
        assert_eq!(
            checkpoint_file(root, &job_id),
            PathBuf::from("/tmp/checkpoints/job-20260801-1/checkpoint.json")
        );
        assert_eq!(
            errors_file(root, &job_id),
            PathBuf::from("/tmp/checkpoints/job-20260801-1/errors.jsonl")
        );
    }

    #[test]
    fn test_sanitize() {
        let job_id = JobId::new("../etc/passwd");
        let dir = job_dir(Path::new("/cp"), &job_id);
        assert_eq!(dir, PathBuf::from("/cp/.._etc_passwd"));
    }
}
