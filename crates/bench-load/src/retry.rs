//! Bounded retries with linear backoff
//!
//! Retryable failures (5xx, model loading) sleep `base_sleep × attempt`
//! and try again until `max_attempts` is used up, at which point the last
//! error is returned unchanged. Any other failure is returned at once.

use bench_core::{Result, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How often and how patiently a request is retried
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Progress of one retried call
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// 1-based number of the attempt in progress
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_sleep: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_sleep,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_sleep())
    }

    /// Sleep after failed attempt number `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_sleep.saturating_mul(attempt)
    }

    /// Run `attempt_fn` until it succeeds, fails fatally or runs out of
    /// attempts. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut state = RetryState::default();

        loop {
            state.attempt += 1;
            match attempt_fn(state.attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && state.attempt < max_attempts => {
                    let delay = self.backoff(state.attempt);
                    debug!(
                        attempt = state.attempt,
                        max_attempts,
                        ?delay,
                        previous = ?state.last_error,
                        error = %e,
                        "Retrying request"
                    );
                    state.last_error = Some(e.to_string());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run `attempt_fn` under a policy of `max_attempts` and `base_sleep`
pub async fn with_retry<T, F, Fut>(attempt_fn: F, max_attempts: u32, base_sleep: Duration) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::new(max_attempts, base_sleep).run(attempt_fn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SLEEP: Duration = Duration::from_millis(1);

    /// Fails with `status` for the first `failures` attempts, then succeeds
    async fn flaky(attempt: u32, failures: u32, status: u16) -> Result<u32> {
        if attempt <= failures {
            Err(Error::from_http_status(status, format!("attempt {}", attempt)))
        } else {
            Ok(attempt)
        }
    }

    #[tokio::test]
    async fn test_succeeds_within_budget() {
        for failures in 0..4 {
            let value = with_retry(|attempt| flaky(attempt, failures, 503), 4, SLEEP)
                .await
                .unwrap();
            assert_eq!(value, failures + 1);
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = with_retry(
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                flaky(attempt, 4, 502)
            },
            4,
            SLEEP,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "HTTP error 502: attempt 4");
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                flaky(attempt, 10, 400)
            },
            8,
            SLEEP,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_fatal_request());
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transport("connection refused")) }
            },
            5,
            SLEEP,
        )
        .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(8, Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
        assert_eq!(RetryPolicy::new(0, SLEEP).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_backoff_is_slept() {
        let started = std::time::Instant::now();
        let _ = with_retry(|attempt| flaky(attempt, 2, 500), 3, Duration::from_millis(20)).await;
        // 20ms after attempt 1, 40ms after attempt 2
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
