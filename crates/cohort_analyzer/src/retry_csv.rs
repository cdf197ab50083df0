//! Retry CSV output.
//!
//! Standard columns come first in a fixed order; whatever custom columns the
//! input carried follow. Rows are deduplicated by lowercased email unless
//! duplicates are requested.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use cohort_protocol::ErrorRecord;

/// Fixed leading column order for retry CSVs.
pub const STANDARD_COLUMNS: &[&str] = &[
    "email",
    "password",
    "password_hash",
    "password_hash_type",
    "first_name",
    "last_name",
    "email_verified",
    "external_id",
    "metadata",
    "org_id",
    "org_external_id",
    "org_name",
];

/// Write retryable records as an importable CSV. Returns the number of data
/// rows written.
pub fn write_retry_csv(
    records: &[ErrorRecord],
    path: &Path,
    include_duplicates: bool,
) -> Result<u64> {
    // Custom columns: anything in any raw row that is not standard.
    let mut custom: BTreeSet<String> = BTreeSet::new();
    for record in records {
        for key in record.raw_row.keys() {
            if !STANDARD_COLUMNS.contains(&key.as_str()) {
                custom.insert(key.clone());
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create retry CSV: {}", path.display()))?;

    let mut header: Vec<&str> = STANDARD_COLUMNS.to_vec();
    header.extend(custom.iter().map(|s| s.as_str()));
    writer.write_record(&header).context("Failed to write header")?;

    let mut seen_emails: HashSet<String> = HashSet::new();
    let mut rows = 0u64;
    for record in records {
        if !include_duplicates {
            if let Some(email) = &record.email {
                if !seen_emails.insert(email.to_lowercase()) {
                    continue;
                }
            }
        }
        let mut row: Vec<String> = Vec::with_capacity(header.len());
        for column in STANDARD_COLUMNS {
            row.push(record.raw_row.get(*column).cloned().unwrap_or_default());
        }
        for column in &custom {
            row.push(record.raw_row.get(column).cloned().unwrap_or_default());
        }
        writer.write_record(&row).context("Failed to write row")?;
        rows += 1;
    }
    writer.flush().context("Failed to flush retry CSV")?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cohort_protocol::ErrorType;
    use std::collections::BTreeMap;

    fn record(email: &str, extra: &[(&str, &str)]) -> ErrorRecord {
        let mut raw_row = BTreeMap::new();
        raw_row.insert("email".to_string(), email.to_string());
        for (key, value) in extra {
            raw_row.insert(key.to_string(), value.to_string());
        }
        ErrorRecord {
            record_number: 1,
            email: Some(email.to_string()),
            user_id: None,
            error_type: ErrorType::UserCreate,
            error_message: "boom".to_string(),
            http_status: Some(500),
            code: None,
            request_id: None,
            timestamp: Utc::now(),
            raw_row,
            org_id: None,
            org_external_id: None,
            role_slugs: None,
        }
    }

    #[test]
    fn test_dedup_by_lowercased_email() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("retry.csv");
        let records = vec![
            record("a@x.co", &[]),
            record("A@X.CO", &[]),
            record("b@x.co", &[]),
        ];
        let rows = write_retry_csv(&records, &path, false).unwrap();
        assert_eq!(rows, 2);

        let rows = write_retry_csv(&records, &path, true).unwrap();
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_column_order_and_custom_columns() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("retry.csv");
        let records = vec![record(
            "a@x.co",
            &[("department", "eng"), ("org_name", "Acme"), ("role_slugs", "admin")],
        )];
        write_retry_csv(&records, &path, false).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.starts_with(
            "email,password,password_hash,password_hash_type,first_name,last_name,\
             email_verified,external_id,metadata,org_id,org_external_id,org_name"
        ));
        // Custom columns come after the standard block.
        let header_cols: Vec<&str> = header.split(',').collect();
        assert!(header_cols.len() > STANDARD_COLUMNS.len());
        assert!(header_cols[STANDARD_COLUMNS.len()..].contains(&"department"));
        assert!(header_cols[STANDARD_COLUMNS.len()..].contains(&"role_slugs"));

        let data = content.lines().nth(1).unwrap();
        assert!(data.starts_with("a@x.co,"));
        assert!(data.contains("Acme"));
        assert!(data.contains("eng"));
    }

    #[test]
    fn test_records_without_email_always_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("retry.csv");
        let mut nameless = record("x@x.co", &[]);
        nameless.email = None;
        nameless.raw_row.clear();
        let rows = write_retry_csv(&[nameless.clone(), nameless], &path, false).unwrap();
        assert_eq!(rows, 2);
    }
}
