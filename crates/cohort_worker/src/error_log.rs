//! Append-only JSONL error log.
//!
//! One writer per chunk, one full-line buffer per record, so concurrent
//! chunks appending to the same file never interleave partial lines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use cohort_protocol::ErrorRecord;

pub struct ErrorLogWriter {
    file: Mutex<File>,
}

impl ErrorLogWriter {
    /// Open (creating parents as needed) for append.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open error log: {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one record as a single line.
    pub fn append(&self, record: &ErrorRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize error record")?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("error log writer poisoned"))?;
        file.write_all(line.as_bytes())
            .context("Failed to append error record")?;
        Ok(())
    }

    /// Flush buffered OS state before the chunk returns.
    pub fn flush(&self) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("error log writer poisoned"))?;
        file.flush().context("Failed to flush error log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cohort_protocol::ErrorType;
    use std::collections::BTreeMap;

    fn record(n: u64) -> ErrorRecord {
        ErrorRecord {
            record_number: n,
            email: Some(format!("user{n}@example.com")),
            user_id: None,
            error_type: ErrorType::UserCreate,
            error_message: "boom".to_string(),
            http_status: Some(500),
            code: None,
            request_id: None,
            timestamp: Utc::now(),
            raw_row: BTreeMap::new(),
            org_id: None,
            org_external_id: None,
            role_slugs: None,
        }
    }

    #[test]
    fn test_append_one_line_per_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("job").join("errors.jsonl");
        let writer = ErrorLogWriter::open(&path).unwrap();
        writer.append(&record(1)).unwrap();
        writer.append(&record(2)).unwrap();
        writer.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ErrorRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.record_number, 2);
    }

    #[test]
    fn test_reopen_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("errors.jsonl");
        {
            let writer = ErrorLogWriter::open(&path).unwrap();
            writer.append(&record(1)).unwrap();
        }
        {
            let writer = ErrorLogWriter::open(&path).unwrap();
            writer.append(&record(2)).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
