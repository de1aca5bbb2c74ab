//! Bounded retry with linear backoff
//!
//! Store and cache calls share one retry combinator. A loop stops at the
//! first of: success, a non-retryable error, the attempt limit, or the
//! overall deadline (when one is configured). The deadline also bounds each
//! attempt, so a call that never answers is abandoned once it runs out.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::error::Elapsed;
use tracing::{debug, warn};

/// Attempts allowed for cache reads and writes
pub const MAX_CACHE_RETRIES: u32 = 2;

/// Attempts allowed for backing store operations
pub const MAX_STORE_RETRIES: u32 = 3;

/// How many times to try an operation and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `backoff_step * n`
    pub backoff_step: Duration,
    /// Upper bound on the whole loop, sleeps included
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Backing store policy: 3 attempts, 500ms × attempt, 10s overall
    pub const STORE: Self = Self {
        max_attempts: MAX_STORE_RETRIES,
        backoff_step: Duration::from_millis(500),
        deadline: Some(Duration::from_secs(10)),
    };

    /// Cache policy: 2 attempts, 200ms × attempt, 2s overall
    pub const CACHE: Self = Self {
        max_attempts: MAX_CACHE_RETRIES,
        backoff_step: Duration::from_millis(200),
        deadline: Some(Duration::from_secs(2)),
    };

    /// Single attempt, no backoff
    pub const NONE: Self = Self {
        max_attempts: 1,
        backoff_step: Duration::ZERO,
        deadline: None,
    };

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Linear backoff after the given (1-based) failed attempt
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STORE
    }
}

/// Error returned once a retry loop gives up
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts actually made
    pub attempts: u32,
    /// Error from the last attempt
    pub last_error: E,
}

/// Run `op` under `policy`
///
/// `op` receives the 1-based attempt number. `is_retryable` decides whether a
/// failure is worth another attempt. With a deadline, an attempt still
/// running when it passes is dropped and reported as an [`Elapsed`] error.
///
/// # Errors
///
/// Returns [`RetryExhausted`] carrying the last error when the loop stops
/// without a success.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display + From<Elapsed>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match policy.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, op(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(elapsed) => {
                        warn!(operation = %operation, attempt, "Attempt outlived the retry deadline");
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: E::from(elapsed),
                        });
                    }
                }
            }
            None => op(attempt).await,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    debug!(operation = %operation, attempt, error = %err, "Non-retryable failure");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                if attempt >= max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                let delay = policy.backoff(attempt);
                if let Some(deadline) = policy.deadline {
                    if started.elapsed() + delay >= deadline {
                        warn!(operation = %operation, attempt, error = %err, "Retry deadline reached");
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                }

                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<u32, RetryExhausted<anyhow::Error>> =
            retry(&RetryPolicy::STORE, "flaky", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(anyhow::anyhow!("boom {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms after the first failure, 1000ms after the second
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryExhausted<anyhow::Error>> =
            retry(&RetryPolicy::CACHE, "down", |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("unreachable")) }
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.last_error.to_string(), "unreachable");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryExhausted<anyhow::Error>> = retry(
            &RetryPolicy::STORE,
            "rejected",
            |err: &anyhow::Error| err.to_string() != "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("fatal")) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_loop_short() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::STORE.with_deadline(Duration::from_millis(700));

        let result: Result<(), RetryExhausted<anyhow::Error>> =
            retry(&policy, "slow", |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("timeout")) }
            })
            .await;

        // first backoff (500ms) fits, second (1000ms) would cross the deadline
        assert_eq!(result.unwrap_err().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_hung_attempt() {
        let policy = RetryPolicy::STORE.with_deadline(Duration::from_millis(700));
        let started = Instant::now();

        let result: Result<(), RetryExhausted<anyhow::Error>> =
            retry(&policy, "hung", |_| true, |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert!(exhausted.last_error.downcast_ref::<Elapsed>().is_some());
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_after_failures_uses_remaining_budget() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), RetryExhausted<anyhow::Error>> =
            retry(&RetryPolicy::STORE, "stalls", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        return Err(anyhow::anyhow!("connection reset"));
                    }
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[test]
    fn test_default_policies_are_bounded() {
        assert!(RetryPolicy::STORE.deadline.is_some());
        assert!(RetryPolicy::CACHE.deadline.is_some());
    }

    #[test]
    fn test_linear_backoff() {
        assert_eq!(RetryPolicy::STORE.backoff(1), Duration::from_millis(500));
        assert_eq!(RetryPolicy::STORE.backoff(2), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::CACHE.backoff(1), Duration::from_millis(200));
    }
}
