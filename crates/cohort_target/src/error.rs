//! Target error type.
//!
//! Clone because coalesced cache lookups fan one failure out to several
//! waiters, and mocks script responses by value.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)rate.?limit").expect("static regex"))
}

fn not_found_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)not found").expect("static regex"))
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TargetError {
    /// The target answered with a non-success status. Status, vendor code,
    /// request id and message are propagated verbatim into error records.
    #[error("{message}")]
    Api {
        status: u16,
        code: Option<String>,
        request_id: Option<String>,
        message: String,
        /// Server-signaled backoff (seconds), from a Retry-After header.
        retry_after: Option<u64>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl TargetError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: None,
            request_id: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn api_with_code(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: Some(code.into()),
            request_id: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Api { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// 429 or a rate-limit-shaped message. Triggers caller-side backoff.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Api { status, message, .. } => {
                *status == 429 || rate_limit_re().is_match(message)
            }
            _ => false,
        }
    }

    /// Server-requested delay, when the response carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => retry_after.map(Duration::from_secs),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api { status, message, .. } => {
                *status == 404 || not_found_re().is_match(message)
            }
            _ => false,
        }
    }

    /// A 409 that means "this entity already exists" (duplicate user or
    /// membership), as opposed to some other conflict.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Api {
                status,
                code,
                message,
                ..
            } => {
                *status == 409
                    && (code
                        .as_deref()
                        .map(|c| c.contains("already_exists") || c.contains("duplicate"))
                        .unwrap_or(false)
                        || message.to_lowercase().contains("already exists"))
            }
            _ => false,
        }
    }

    /// The create-org race signal: the external id was claimed by a
    /// concurrent create.
    pub fn is_external_id_conflict(&self) -> bool {
        match self {
            Self::Api { code, message, .. } => {
                code.as_deref() == Some("external_id_already_assigned")
                    || message.to_lowercase().contains("external_id already assigned")
            }
            _ => false,
        }
    }

    /// Transient failures worth an in-row retry: rate limits, 5xx, timeouts
    /// and transport drops.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => self.is_rate_limited() || *status >= 500,
            Self::Timeout | Self::Transport(_) => true,
            Self::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_detection() {
        assert!(TargetError::api(429, "Too Many Requests").is_rate_limited());
        assert!(TargetError::api(400, "Rate limit exceeded").is_rate_limited());
        assert!(TargetError::api(400, "ratelimit hit").is_rate_limited());
        assert!(!TargetError::api(400, "bad email").is_rate_limited());
        assert!(!TargetError::Timeout.is_rate_limited());
    }

    #[test]
    fn test_already_exists() {
        let err = TargetError::api_with_code(409, "user_already_exists", "User already exists.");
        assert!(err.is_already_exists());
        let other_conflict = TargetError::api(409, "state version conflict");
        assert!(!other_conflict.is_already_exists());
    }

    #[test]
    fn test_external_id_conflict() {
        let err = TargetError::api_with_code(
            409,
            "external_id_already_assigned",
            "external_id is already assigned to another organization",
        );
        assert!(err.is_external_id_conflict());
    }

    #[test]
    fn test_transient() {
        assert!(TargetError::api(503, "upstream sad").is_transient());
        assert!(TargetError::Timeout.is_transient());
        assert!(!TargetError::api(400, "invalid email").is_transient());
        assert!(!TargetError::Cancelled.is_transient());
    }

    #[test]
    fn test_retry_after() {
        let err = TargetError::Api {
            status: 429,
            code: None,
            request_id: None,
            message: "Too Many Requests".to_string(),
            retry_after: Some(1),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    }
}
