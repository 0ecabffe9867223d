//! Retry envelope for remote reads.
//!
//! Delay before attempt `n` (1-indexed) is zero for the first attempt and
//! `base_delay * 2^(n-2)` plus uniform jitter in `[0, jitter_window]` after
//! that. Every attempt carries its own absolute timeout; a timeout counts as
//! one failed attempt. Only `TransientNetwork` and `Timeout` are retried.

use perpsync_core::{SyncError, SyncResult};
use perpsync_telemetry::Metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Cap on the backoff exponent so the shift never overflows.
const MAX_EXPONENT: u32 = 16;

/// Retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to every retry delay.
    pub jitter_window: Duration,
    /// Absolute timeout of one attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            jitter_window: Duration::from_millis(1000),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, window: Duration) -> Self {
        self.jitter_window = window;
        self
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Deterministic delays, for tests and replays.
    #[must_use]
    pub fn without_jitter(self) -> Self {
        self.with_jitter(Duration::ZERO)
    }

    /// Delay before `attempt`, without jitter.
    ///
    /// attempt=1 -> 0
    /// attempt=2 -> base
    /// attempt=3 -> 2*base
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(MAX_EXPONENT);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Delay before `attempt`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_backoff(attempt).saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        let window_ms = u64::try_from(self.jitter_window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=window_ms))
    }
}

/// Drives an operation through a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached.
    ///
    /// On exhaustion returns [`SyncError::RetryExhausted`] carrying the last
    /// error, so the caller can choose between surfacing it and falling back
    /// to stale data.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for n in 1..=max_attempts {
            let delay = self.policy.delay_for_attempt(n);
            if !delay.is_zero() {
                debug!(operation, attempt = n, delay_ms = delay.as_millis(), "Retrying");
                tokio::time::sleep(delay).await;
            }

            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, attempt()).await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.policy.attempt_timeout)),
            };

            match outcome {
                Ok(value) => {
                    Metrics::remote_attempt(operation, "ok");
                    if n > 1 {
                        debug!(operation, attempts = n, "Remote call recovered");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    Metrics::remote_attempt(operation, e.kind());
                    if !e.is_retryable() {
                        debug!(operation, attempt = n, error = %e, "Not retrying");
                        return Err(e);
                    }
                    warn!(
                        operation,
                        attempt = n,
                        max_attempts,
                        error = %e,
                        "Remote call failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Metrics::retry_exhausted(operation);
        let last = last_error.unwrap_or(SyncError::Cancelled);
        Err(SyncError::RetryExhausted {
            attempts: max_attempts,
            last: Box::new(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1000)).without_jitter()
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy();
        assert_eq!(p.base_backoff(1), Duration::ZERO);
        assert_eq!(p.base_backoff(2), Duration::from_millis(1000));
        assert_eq!(p.base_backoff(3), Duration::from_millis(2000));
        assert_eq!(p.base_backoff(4), Duration::from_millis(4000));
        assert_eq!(p.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let p = RetryPolicy::new(5, Duration::from_millis(1000));
        for _ in 0..100 {
            let d = p.delay_for_attempt(3);
            assert!(d >= Duration::from_millis(2000));
            assert!(d <= Duration::from_millis(3000));
        }
        // No jitter before the first attempt either
        assert_eq!(p.delay_for_attempt(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = RetryScheduler::new(policy())
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::TransientNetwork("reset".into()))
                } else {
                    Ok(9)
                }
            })
            .await;
        assert_eq!(result, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1000ms before attempt 2, 2000ms before attempt 3
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_last_error() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<u32> = RetryScheduler::new(policy())
            .run("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::TransientNetwork(format!("attempt {n}")))
            })
            .await;
        assert_eq!(
            result,
            Err(SyncError::RetryExhausted {
                attempts: 3,
                last: Box::new(SyncError::TransientNetwork("attempt 2".into())),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<u32> = RetryScheduler::new(policy())
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Decode("bad tuple".into()))
            })
            .await;
        assert_eq!(result, Err(SyncError::Decode("bad tuple".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(2, Duration::from_millis(100))
            .without_jitter()
            .with_attempt_timeout(Duration::from_secs(15));
        let result: SyncResult<u32> = RetryScheduler::new(p)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result {
            Err(SyncError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(*last, SyncError::Timeout(Duration::from_secs(15)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
