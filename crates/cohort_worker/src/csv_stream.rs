//! CSV streaming and row parsing.
//!
//! Known columns become typed `UserRow` fields; anything else lands in
//! `extra` so custom columns survive into error records and the retry CSV.
//! Column sets are not part of any type: a file with only `email` is as
//! valid as one with every column.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use cohort_protocol::UserRow;
use tracing::warn;

/// Columns the importer understands, by header name.
pub const KNOWN_COLUMNS: &[&str] = &[
    "email",
    "first_name",
    "last_name",
    "email_verified",
    "external_id",
    "password",
    "password_hash",
    "password_hash_type",
    "metadata",
    "org_id",
    "org_external_id",
    "org_name",
    "role_slugs",
];

/// Maps record positions to row fields, resolved once per reader.
#[derive(Debug, Clone)]
pub struct HeaderMap {
    /// Column name per position, normalized (BOM stripped, trimmed).
    columns: Vec<String>,
    unknown: Vec<String>,
}

impl HeaderMap {
    /// Build from a header record. Unknown columns are tolerated; when
    /// `warn_unknown` is set each one is logged exactly once.
    pub fn from_headers(headers: &csv::StringRecord, warn_unknown: bool) -> Result<Self> {
        let mut columns = Vec::with_capacity(headers.len());
        let mut unknown = Vec::new();
        for (index, raw) in headers.iter().enumerate() {
            let mut name = raw.trim();
            if index == 0 {
                name = name.trim_start_matches('\u{feff}');
            }
            let name = name.to_string();
            if !name.is_empty() && !KNOWN_COLUMNS.contains(&name.as_str()) {
                if warn_unknown {
                    warn!(column = %name, "ignoring unknown CSV column");
                }
                unknown.push(name.clone());
            }
            columns.push(name);
        }
        if !columns.iter().any(|c| c == "email") {
            anyhow::bail!("CSV is missing the required 'email' column");
        }
        Ok(Self { columns, unknown })
    }

    pub fn unknown_columns(&self) -> &[String] {
        &self.unknown
    }

    /// Parse one record into a row. Values are trimmed; blank cells are
    /// absent, not empty strings.
    pub fn parse_row(&self, record: &csv::StringRecord, record_number: u64) -> UserRow {
        let mut row = UserRow {
            record_number,
            ..Default::default()
        };
        let mut extra = BTreeMap::new();
        for (index, value) in record.iter().enumerate() {
            let Some(column) = self.columns.get(index) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let value = value.to_string();
            match column.as_str() {
                "email" => row.email = Some(value),
                "first_name" => row.first_name = Some(value),
                "last_name" => row.last_name = Some(value),
                "email_verified" => row.email_verified = Some(value),
                "external_id" => row.external_id = Some(value),
                "password" => row.password = Some(value),
                "password_hash" => row.password_hash = Some(value),
                "password_hash_type" => row.password_hash_type = Some(value),
                "metadata" => row.metadata = Some(value),
                "org_id" => row.org_id = Some(value),
                "org_external_id" => row.org_external_id = Some(value),
                "org_name" => row.org_name = Some(value),
                "role_slugs" => row.role_slugs = Some(value),
                "" => {}
                other => {
                    extra.insert(other.to_string(), value);
                }
            }
        }
        row.extra = extra;
        row
    }
}

/// Open a reader over the input CSV.
pub fn open_reader(path: &Path) -> Result<csv::Reader<File>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open CSV: {}", path.display()))?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file))
}

/// Read and validate the header row only.
pub fn read_header(path: &Path, warn_unknown: bool) -> Result<HeaderMap> {
    let mut reader = open_reader(path)?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read CSV header: {}", path.display()))?;
    HeaderMap::from_headers(headers, warn_unknown)
}

/// Count data rows (header excluded) with a fast scan.
pub fn count_data_rows(path: &Path) -> Result<u64> {
    let mut reader = open_reader(path)?;
    let mut count = 0u64;
    for record in reader.records() {
        record.with_context(|| format!("CSV parse error in {}", path.display()))?;
        count += 1;
    }
    Ok(count)
}

/// Unique `(org_external_id, org_name?)` pairs, first occurrence wins,
/// input order preserved. Used to pre-warm the org cache.
pub fn scan_unique_orgs(path: &Path) -> Result<Vec<(String, Option<String>)>> {
    let mut reader = open_reader(path)?;
    let headers = reader.headers().context("Failed to read CSV header")?;
    let header = HeaderMap::from_headers(headers, false)?;

    let mut seen = std::collections::HashSet::new();
    let mut orgs = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("CSV parse error in {}", path.display()))?;
        let row = header.parse_row(&record, index as u64 + 1);
        if let Some(external_id) = row.org_external_id {
            if seen.insert(external_id.clone()) {
                orgs.push((external_id, row.org_name));
            }
        }
    }
    Ok(orgs)
}

/// Parse a `role_slugs` cell: JSON array of strings, or comma-separated.
pub fn parse_role_slugs(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if raw.starts_with('[') {
        if let Ok(slugs) = serde_json::from_str::<Vec<String>>(raw) {
            return slugs
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Boolean-ish cell parsing: `true|1|yes|y` / `false|0|no|n`, else absent.
pub fn parse_boolish(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_header_requires_email() {
        let file = write_csv("first_name,last_name\nAda,Lovelace\n");
        assert!(read_header(file.path(), false).is_err());
    }

    #[test]
    fn test_bom_is_stripped() {
        let file = write_csv("\u{feff}email\nalice@example.com\n");
        let header = read_header(file.path(), false).unwrap();
        assert!(header.unknown_columns().is_empty());
    }

    #[test]
    fn test_unknown_columns_collected() {
        let file = write_csv("email,department\nalice@example.com,eng\n");
        let header = read_header(file.path(), false).unwrap();
        assert_eq!(header.unknown_columns(), &["department".to_string()]);
    }

    #[test]
    fn test_parse_row_trims_and_skips_blanks() {
        let file = write_csv("email,first_name,org_id\n  alice@example.com , Ada ,\n");
        let mut reader = open_reader(file.path()).unwrap();
        let header = HeaderMap::from_headers(reader.headers().unwrap(), false).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        let row = header.parse_row(&record, 1);
        assert_eq!(row.email.as_deref(), Some("alice@example.com"));
        assert_eq!(row.first_name.as_deref(), Some("Ada"));
        assert!(row.org_id.is_none());
    }

    #[test]
    fn test_extra_columns_preserved() {
        let file = write_csv("email,department\na@b.co,eng\n");
        let mut reader = open_reader(file.path()).unwrap();
        let header = HeaderMap::from_headers(reader.headers().unwrap(), false).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        let row = header.parse_row(&record, 1);
        assert_eq!(row.extra.get("department").unwrap(), "eng");
    }

    #[test]
    fn test_count_rows() {
        let file = write_csv("email\na@b.co\nb@b.co\n");
        assert_eq!(count_data_rows(file.path()).unwrap(), 2);
        let empty = write_csv("email\n");
        assert_eq!(count_data_rows(empty.path()).unwrap(), 0);
    }

    #[test]
    fn test_scan_unique_orgs() {
        let file = write_csv(
            "email,org_external_id,org_name\n\
             a@b.co,ext_1,Acme\n\
             b@b.co,ext_1,Acme\n\
             c@b.co,ext_2,\n",
        );
        let orgs = scan_unique_orgs(file.path()).unwrap();
        assert_eq!(
            orgs,
            vec![
                ("ext_1".to_string(), Some("Acme".to_string())),
                ("ext_2".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_parse_role_slugs() {
        assert_eq!(parse_role_slugs("admin, member"), vec!["admin", "member"]);
        assert_eq!(parse_role_slugs(r#"["admin","member"]"#), vec!["admin", "member"]);
        assert!(parse_role_slugs("  ").is_empty());
    }

    #[test]
    fn test_parse_boolish() {
        assert_eq!(parse_boolish("YES"), Some(true));
        assert_eq!(parse_boolish("0"), Some(false));
        assert_eq!(parse_boolish("maybe"), None);
    }
}
