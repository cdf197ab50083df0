//! JSON analysis report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyze::{Analysis, ErrorGroup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_errors: u64,
    pub unique_groups: u64,
    pub malformed_lines: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryabilityBucket {
    pub count: u64,
    pub percentage: f64,
    pub by_reason: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retryability {
    pub retryable: RetryabilityBucket,
    pub non_retryable: RetryabilityBucket,
}

/// Human-readable remediation hint for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub group_id: String,
    pub reason: String,
    pub suggestion: String,
    /// Whether the fix is something the operator can do in the CSV.
    pub actionable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub summary: ReportSummary,
    pub groups: Vec<ErrorGroup>,
    pub retryability: Retryability,
    pub suggestions: Vec<Suggestion>,
    pub timestamp: DateTime<Utc>,
    pub errors_file: String,
    pub errors_file_hash: String,
}

/// Assemble the report from an analysis pass.
pub fn build_report(analysis: &Analysis) -> AnalysisReport {
    let retryable_count = analysis.retryable_count();
    let non_retryable_count = analysis.non_retryable_count();
    let total = analysis.total_errors;

    AnalysisReport {
        summary: ReportSummary {
            total_errors: total,
            unique_groups: analysis.groups.len() as u64,
            malformed_lines: analysis.malformed_lines,
        },
        groups: analysis.groups.clone(),
        retryability: Retryability {
            retryable: RetryabilityBucket {
                count: retryable_count,
                percentage: percentage(retryable_count, total),
                by_reason: analysis.retryable_by_reason.clone(),
            },
            non_retryable: RetryabilityBucket {
                count: non_retryable_count,
                percentage: percentage(non_retryable_count, total),
                by_reason: analysis.non_retryable_by_reason.clone(),
            },
        },
        suggestions: analysis.groups.iter().map(suggestion_for).collect(),
        timestamp: Utc::now(),
        errors_file: analysis.errors_file.display().to_string(),
        errors_file_hash: analysis.errors_file_hash.clone(),
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

fn suggestion_for(group: &ErrorGroup) -> Suggestion {
    let (suggestion, actionable) = match group.reason.as_str() {
        "validation_error" | "user_create_validation_error" | "membership_validation_error" => (
            "Correct the invalid field values in the CSV, then re-import the affected rows",
            true,
        ),
        "conflict_duplicate" => (
            "These users already exist in the target; remove the duplicate rows from the CSV",
            true,
        ),
        "membership_duplicate" => (
            "Memberships already exist; no action needed for these rows",
            false,
        ),
        "org_not_found" => (
            "Create the referenced organizations or fix org_id/org_external_id in the CSV",
            true,
        ),
        "org_lookup_error" => (
            "Transient organization lookup failures; re-run the retry CSV",
            false,
        ),
        "rate_limit" => (
            "Re-run the retry CSV with a lower request rate, or wait before retrying",
            false,
        ),
        "server_error" => (
            "Target-side failures; re-run the retry CSV once the service recovers",
            false,
        ),
        "membership_error_user_exists" => (
            "Users exist but memberships failed; re-run the retry CSV to create them",
            false,
        ),
        "conflict" => (
            "Reconcile the conflicting entities in the target, then re-import",
            true,
        ),
        _ => ("Re-run the retry CSV; these failures look transient", false),
    };
    Suggestion {
        group_id: group.id.clone(),
        reason: group.reason.clone(),
        suggestion: suggestion.to_string(),
        actionable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze_file;
    use chrono::Utc;
    use cohort_protocol::{ErrorRecord, ErrorType};
    use std::io::Write;

    fn log_with(records: Vec<ErrorRecord>) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for record in records {
            writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn record(status: Option<u16>, message: &str) -> ErrorRecord {
        ErrorRecord {
            record_number: 1,
            email: Some("a@b.co".to_string()),
            user_id: None,
            error_type: ErrorType::UserCreate,
            error_message: message.to_string(),
            http_status: status,
            code: None,
            request_id: None,
            timestamp: Utc::now(),
            raw_row: Default::default(),
            org_id: None,
            org_external_id: None,
            role_slugs: None,
        }
    }

    #[test]
    fn test_report_shape() {
        let log = log_with(vec![
            record(Some(400), "Email is invalid"),
            record(Some(500), "boom"),
        ]);
        let analysis = analyze_file(log.path()).unwrap();
        let report = build_report(&analysis);

        assert_eq!(report.summary.total_errors, 2);
        assert_eq!(report.summary.unique_groups, 2);
        assert_eq!(report.retryability.retryable.count, 1);
        assert_eq!(report.retryability.non_retryable.count, 1);
        assert!((report.retryability.retryable.percentage - 50.0).abs() < f64::EPSILON);
        assert_eq!(report.suggestions.len(), 2);
        assert!(!report.errors_file_hash.is_empty());

        let json = serde_json::to_string_pretty(&report).unwrap();
        assert!(json.contains("\"retryability\""));
        assert!(json.contains("\"byReason\""));
    }

    #[test]
    fn test_actionable_flags() {
        let log = log_with(vec![
            record(Some(400), "Email is invalid"),
            record(Some(429), "Too Many Requests"),
        ]);
        let analysis = analyze_file(log.path()).unwrap();
        let report = build_report(&analysis);
        let by_reason: BTreeMap<&str, bool> = report
            .suggestions
            .iter()
            .map(|s| (s.reason.as_str(), s.actionable))
            .collect();
        assert_eq!(by_reason["validation_error"], true);
        assert_eq!(by_reason["rate_limit"], false);
    }
}
