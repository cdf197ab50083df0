//! Rate-limit-aware retry around target calls.

use std::future::Future;
use std::time::Duration;

use cohort_target::{RateLimiterHandle, TargetError};
use tracing::debug;

/// Attempts per call, including the first.
pub const MAX_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff: 500ms * 2^(attempt-1).
pub const BACKOFF_BASE_MS: u64 = 500;

/// Acquire a rate-limiter permit, run the call, and retry rate-limited
/// responses with exponential backoff. A server-provided Retry-After
/// overrides the computed delay. Everything that is not a rate limit is
/// returned to the caller on the first occurrence.
pub async fn with_rate_limit_retry<T, F, Fut>(
    limiter: &RateLimiterHandle,
    mut call: F,
) -> Result<T, TargetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TargetError>>,
{
    let mut attempt = 1u32;
    loop {
        limiter.acquire().await?;
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limited() && attempt < MAX_ATTEMPTS => {
                let delay = error.retry_after().unwrap_or_else(|| {
                    Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt - 1))
                });
                debug!(attempt, ?delay, "rate limited, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_target::RateLimiter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let limiter = RateLimiter::spawn(1000, Some(1000));
        let attempts = Arc::new(AtomicU32::new(0));
        let result = with_rate_limit_retry(&limiter, || {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TargetError::api(429, "Too Many Requests"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let limiter = RateLimiter::spawn(1000, Some(1000));
        let attempts = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = with_rate_limit_retry(&limiter, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TargetError::api(429, "Too Many Requests"))
            }
        })
        .await;
        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_non_rate_limit_error_is_not_retried() {
        let limiter = RateLimiter::spawn(1000, Some(1000));
        let attempts = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = with_rate_limit_retry(&limiter, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TargetError::api(400, "invalid email"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().status(), Some(400));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
