//! Job-wide token bucket for target API calls.
//!
//! One limiter task per job, owned by the coordinator. Workers hold a
//! cloneable handle and `acquire()` a permit before every target call;
//! requests are granted in arrival order. Shutting the limiter down resolves
//! every outstanding `acquire()` with `TargetError::Cancelled` so callers can
//! exit without issuing their API call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::error::TargetError;

struct PermitRequest {
    reply: oneshot::Sender<()>,
}

/// Cloneable client side of the limiter.
#[derive(Clone)]
pub struct RateLimiterHandle {
    tx: mpsc::Sender<PermitRequest>,
    shutdown: Arc<Notify>,
}

impl RateLimiterHandle {
    /// Block until a permit is granted. Returns `Err(Cancelled)` once the
    /// limiter has been shut down.
    pub async fn acquire(&self) -> Result<(), TargetError> {
        let (reply, granted) = oneshot::channel();
        self.tx
            .send(PermitRequest { reply })
            .await
            .map_err(|_| TargetError::Cancelled)?;
        granted.await.map_err(|_| TargetError::Cancelled)
    }

    /// Stop the limiter. Queued and future `acquire()` calls fail with
    /// `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

pub struct RateLimiter;

impl RateLimiter {
    /// Spawn the limiter task. `rate_per_sec` must be positive; `burst`
    /// (default 1) allows that many immediate grants after idle periods.
    pub fn spawn(rate_per_sec: u32, burst: Option<u32>) -> RateLimiterHandle {
        let rate = rate_per_sec.max(1);
        let burst = burst.unwrap_or(1).max(1);
        let (tx, rx) = mpsc::channel::<PermitRequest>(1024);
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(run_bucket(rate, burst, rx, Arc::clone(&shutdown)));
        RateLimiterHandle { tx, shutdown }
    }
}

async fn run_bucket(
    rate: u32,
    burst: u32,
    mut rx: mpsc::Receiver<PermitRequest>,
    shutdown: Arc<Notify>,
) {
    let rate = f64::from(rate);
    let capacity = f64::from(burst);
    let mut tokens = capacity;
    let mut last_refill = Instant::now();

    loop {
        let request = tokio::select! {
            _ = shutdown.notified() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                // All handles dropped.
                None => break,
            },
        };

        let now = Instant::now();
        tokens = (tokens + now.duration_since(last_refill).as_secs_f64() * rate).min(capacity);
        last_refill = now;

        if tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - tokens) / rate);
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            tokens = 1.0;
            last_refill = Instant::now();
        }

        tokens -= 1.0;
        // Caller may have given up; a dropped reply is not an error.
        let _ = request.reply.send(());
    }

    debug!("rate limiter stopped");
    // Dropping rx here resolves all queued acquire() calls as cancelled.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_grants_are_fifo_and_throttled() {
        let limiter = RateLimiter::spawn(50, None);
        let start = StdInstant::now();
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        let elapsed = start.elapsed();
        // First grant is free (full bucket), the remaining 4 are paced at
        // 20ms each.
        assert!(elapsed >= Duration::from_millis(60), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_burst_allows_immediate_grants() {
        let limiter = RateLimiter::spawn(1, Some(3));
        let start = StdInstant::now();
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let limiter = RateLimiter::spawn(1, None);
        limiter.acquire().await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.shutdown();

        let result = waiting.await.unwrap();
        assert_eq!(result, Err(TargetError::Cancelled));
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails() {
        let limiter = RateLimiter::spawn(10, None);
        limiter.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.acquire().await, Err(TargetError::Cancelled));
    }
}
