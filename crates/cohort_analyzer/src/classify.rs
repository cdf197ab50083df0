//! Retryability classification.
//!
//! The decision tree is evaluated strictly in order; the first matching
//! rule wins. Reasons are stable identifiers grouped on by the report.

use cohort_protocol::{ErrorRecord, ErrorType};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use regex::Regex;

/// Backoff applied to rate-limited groups in the retry plan.
pub const RATE_LIMIT_RETRY_DELAY_MS: u64 = 5_000;

fn not_found_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)not found").expect("static regex"))
}

/// Row-local validation failures carry no HTTP status but are never worth
/// retrying without a CSV fix.
fn validation_message_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)missing required|invalid json|both org_id and org_external_id")
            .expect("static regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    Immediate,
    WithBackoff,
    AfterFix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    #[serde(rename = "type")]
    pub kind: RetryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_required: Option<String>,
}

impl RetryStrategy {
    fn immediate() -> Self {
        Self {
            kind: RetryKind::Immediate,
            delay_ms: None,
            fix_required: None,
        }
    }

    fn with_backoff(delay_ms: u64) -> Self {
        Self {
            kind: RetryKind::WithBackoff,
            delay_ms: Some(delay_ms),
            fix_required: None,
        }
    }

    fn after_fix(fix: &str) -> Self {
        Self {
            kind: RetryKind::AfterFix,
            delay_ms: None,
            fix_required: Some(fix.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub retryable: bool,
    /// Stable reason identifier, e.g. `rate_limit`, `validation_error`.
    pub reason: &'static str,
    pub strategy: RetryStrategy,
    pub severity: Severity,
}

/// Classify one error record. Pure: same record, same answer.
pub fn classify(record: &ErrorRecord) -> Classification {
    let status = record.http_status;
    let (retryable, reason, strategy) = decide(record, status);
    Classification {
        retryable,
        reason,
        strategy,
        severity: severity(record, status, retryable),
    }
}

fn decide(record: &ErrorRecord, status: Option<u16>) -> (bool, &'static str, RetryStrategy) {
    if status == Some(429) {
        return (
            true,
            "rate_limit",
            RetryStrategy::with_backoff(RATE_LIMIT_RETRY_DELAY_MS),
        );
    }
    if matches!(status, Some(s) if s >= 500) {
        return (true, "server_error", RetryStrategy::immediate());
    }
    if record.error_type == ErrorType::UserCreate && status == Some(409) {
        let reason = if record.error_message.to_lowercase().contains("already exists") {
            "conflict_duplicate"
        } else {
            "user_create_validation_error"
        };
        return (
            false,
            reason,
            RetryStrategy::after_fix("remove or reconcile the conflicting user"),
        );
    }
    if matches!(status, Some(400) | Some(422)) {
        let reason = match record.error_type {
            ErrorType::MembershipCreate => "membership_validation_error",
            _ => "validation_error",
        };
        return (
            false,
            reason,
            RetryStrategy::after_fix("correct the row's field values"),
        );
    }
    if status.is_none() && validation_message_re().is_match(&record.error_message) {
        return (
            false,
            "validation_error",
            RetryStrategy::after_fix("correct the row's field values"),
        );
    }
    if record.error_type == ErrorType::OrgResolution {
        if not_found_re().is_match(&record.error_message) {
            return (
                false,
                "org_not_found",
                RetryStrategy::after_fix("create the organization or fix the org reference"),
            );
        }
        return (true, "org_lookup_error", RetryStrategy::immediate());
    }
    if record.error_type == ErrorType::MembershipCreate && record.user_id.is_some() {
        if status == Some(409) {
            return (
                false,
                "membership_duplicate",
                RetryStrategy::after_fix("membership already exists; drop the row"),
            );
        }
        return (true, "membership_error_user_exists", RetryStrategy::immediate());
    }
    if status == Some(409) {
        // A conflict that is not an "already exists" duplicate is a data
        // problem, not a transient one.
        return (
            false,
            "conflict",
            RetryStrategy::after_fix("reconcile the conflicting entity"),
        );
    }
    (true, "unknown_error", RetryStrategy::immediate())
}

fn severity(record: &ErrorRecord, status: Option<u16>, retryable: bool) -> Severity {
    if record.error_type == ErrorType::OrgResolution
        || (!retryable && matches!(status, Some(400) | Some(422)))
    {
        return Severity::Critical;
    }
    if status == Some(409) {
        return Severity::High;
    }
    if status == Some(429) || matches!(status, Some(s) if s >= 500) {
        return Severity::Medium;
    }
    Severity::Low
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(error_type: ErrorType, status: Option<u16>, message: &str) -> ErrorRecord {
        ErrorRecord {
            record_number: 1,
            email: Some("a@b.co".to_string()),
            user_id: None,
            error_type,
            error_message: message.to_string(),
            http_status: status,
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
    fn test_429_retries_with_backoff() {
        let c = classify(&record(ErrorType::UserCreate, Some(429), "Too Many Requests"));
        assert!(c.retryable);
        assert_eq!(c.reason, "rate_limit");
        assert_eq!(c.strategy.kind, RetryKind::WithBackoff);
        assert_eq!(c.strategy.delay_ms, Some(5_000));
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_5xx_retries_immediately() {
        let c = classify(&record(ErrorType::UserCreate, Some(503), "upstream unavailable"));
        assert!(c.retryable);
        assert_eq!(c.reason, "server_error");
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_user_create_409_is_not_retryable() {
        let c = classify(&record(
            ErrorType::UserCreate,
            Some(409),
            "A user with this email already exists",
        ));
        assert!(!c.retryable);
        assert_eq!(c.reason, "conflict_duplicate");
        assert_eq!(c.severity, Severity::High);

        let c = classify(&record(ErrorType::UserCreate, Some(409), "state conflict"));
        assert_eq!(c.reason, "user_create_validation_error");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn test_400_and_422_are_validation() {
        for status in [400u16, 422] {
            let c = classify(&record(ErrorType::UserCreate, Some(status), "Email is invalid"));
            assert!(!c.retryable);
            assert_eq!(c.reason, "validation_error");
            assert_eq!(c.severity, Severity::Critical);
            assert_eq!(c.strategy.kind, RetryKind::AfterFix);
        }
    }

    #[test]
    fn test_org_resolution_split() {
        let c = classify(&record(ErrorType::OrgResolution, None, "Organization not found"));
        assert!(!c.retryable);
        assert_eq!(c.reason, "org_not_found");
        assert_eq!(c.severity, Severity::Critical);

        let c = classify(&record(ErrorType::OrgResolution, None, "connection reset"));
        assert!(c.retryable);
        assert_eq!(c.reason, "org_lookup_error");
        // Any org_resolution error is critical.
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_membership_with_existing_user() {
        let mut r = record(ErrorType::MembershipCreate, Some(409), "Membership already exists");
        r.user_id = Some("user_1".to_string());
        let c = classify(&r);
        assert!(!c.retryable);
        assert_eq!(c.reason, "membership_duplicate");

        let mut r = record(ErrorType::MembershipCreate, None, "socket closed");
        r.user_id = Some("user_1".to_string());
        let c = classify(&r);
        assert!(c.retryable);
        assert_eq!(c.reason, "membership_error_user_exists");
    }

    #[test]
    fn test_membership_validation_error() {
        let mut r = record(ErrorType::MembershipCreate, Some(422), "invalid organization");
        r.user_id = Some("user_1".to_string());
        let c = classify(&r);
        assert!(!c.retryable);
        assert_eq!(c.reason, "membership_validation_error");
    }

    #[test]
    fn test_no_status_is_retryable_unknown() {
        let c = classify(&record(ErrorType::UserCreate, None, "socket hang up"));
        assert!(c.retryable);
        assert_eq!(c.reason, "unknown_error");
        assert_eq!(c.severity, Severity::Low);
    }

    #[test]
    fn test_row_local_validation_is_not_retryable() {
        let c = classify(&record(ErrorType::UserCreate, None, "Missing required email"));
        assert!(!c.retryable);
        assert_eq!(c.reason, "validation_error");
        // No status, so none of the severity escalations apply.
        assert_eq!(c.severity, Severity::Low);

        let c = classify(&record(ErrorType::UserCreate, None, "Invalid JSON in metadata"));
        assert!(!c.retryable);
    }
}
