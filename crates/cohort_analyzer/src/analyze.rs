//! Streaming analysis of an errors.jsonl file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cohort_protocol::{ErrorRecord, ErrorType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::classify::{classify, RetryStrategy, Severity};
use crate::normalize::Normalizer;

/// Example records retained per group.
const MAX_EXAMPLES: usize = 3;
/// Affected emails retained per group.
const MAX_AFFECTED_EMAILS: usize = 10;

/// One group of errors sharing a normalized pattern, error type and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorGroup {
    /// 12 hex chars of SHA-256(pattern | error type | status).
    pub id: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub count: u64,
    pub severity: Severity,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    /// Stable reason identifier from the classifier.
    pub reason: String,
    pub examples: Vec<ErrorRecord>,
    pub affected_emails: Vec<String>,
}

/// In-memory result of one analysis pass.
#[derive(Debug)]
pub struct Analysis {
    pub errors_file: PathBuf,
    pub errors_file_hash: String,
    pub total_errors: u64,
    /// Lines that did not parse as error records.
    pub malformed_lines: u64,
    pub groups: Vec<ErrorGroup>,
    /// Records the retry CSV is built from, in log order.
    pub retryable_records: Vec<ErrorRecord>,
    pub retryable_by_reason: BTreeMap<String, u64>,
    pub non_retryable_by_reason: BTreeMap<String, u64>,
}

impl Analysis {
    pub fn retryable_count(&self) -> u64 {
        self.retryable_by_reason.values().sum()
    }

    pub fn non_retryable_count(&self) -> u64 {
        self.non_retryable_by_reason.values().sum()
    }
}

/// Stream the error log line by line. Memory stays proportional to the
/// number of groups plus retryable records.
pub fn analyze_file(path: &Path) -> Result<Analysis> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open error log: {}", path.display()))?;
    let reader = BufReader::new(file);
    let normalizer = Normalizer::new();

    let mut groups: BTreeMap<String, ErrorGroup> = BTreeMap::new();
    let mut retryable_records = Vec::new();
    let mut retryable_by_reason: BTreeMap<String, u64> = BTreeMap::new();
    let mut non_retryable_by_reason: BTreeMap<String, u64> = BTreeMap::new();
    let mut total_errors = 0u64;
    let mut malformed_lines = 0u64;

    for (line_number, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read error log line")?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ErrorRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_number + 1, %e, "skipping malformed error record");
                malformed_lines += 1;
                continue;
            }
        };
        total_errors += 1;

        let classification = classify(&record);
        let pattern = normalizer.normalize(&record.error_message);
        let id = group_id(&pattern, record.error_type, record.http_status);

        let group = groups.entry(id.clone()).or_insert_with(|| ErrorGroup {
            id,
            pattern: pattern.clone(),
            error_type: Some(record.error_type),
            http_status: record.http_status,
            count: 0,
            severity: classification.severity,
            retryable: classification.retryable,
            retry_strategy: Some(classification.strategy.clone()),
            reason: classification.reason.to_string(),
            examples: Vec::new(),
            affected_emails: Vec::new(),
        });
        group.count += 1;
        if group.examples.len() < MAX_EXAMPLES {
            group.examples.push(record.clone());
        }
        if let Some(email) = &record.email {
            if group.affected_emails.len() < MAX_AFFECTED_EMAILS
                && !group.affected_emails.contains(email)
            {
                group.affected_emails.push(email.clone());
            }
        }

        let bucket = if classification.retryable {
            &mut retryable_by_reason
        } else {
            &mut non_retryable_by_reason
        };
        *bucket.entry(classification.reason.to_string()).or_insert(0) += 1;

        if classification.retryable {
            retryable_records.push(record);
        }
    }

    let mut groups: Vec<ErrorGroup> = groups.into_values().collect();
    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));

    Ok(Analysis {
        errors_file: path.to_path_buf(),
        errors_file_hash: hash_file(path)?,
        total_errors,
        malformed_lines,
        groups,
        retryable_records,
        retryable_by_reason,
        non_retryable_by_reason,
    })
}

fn group_id(pattern: &str, error_type: ErrorType, status: Option<u16>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pattern.as_bytes());
    hasher.update(b"|");
    hasher.update(error_type.as_str().as_bytes());
    hasher.update(b"|");
    match status {
        Some(status) => hasher.update(status.to_string().as_bytes()),
        None => hasher.update(b"none"),
    }
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..12].to_string()
}

fn hash_file(path: &Path) -> Result<String> {
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
