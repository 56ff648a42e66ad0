//! Generic retry combinator with exponential backoff and jitter.
//!
//! Replaces retry-via-exception control flow with an explicit `Result`
//! loop: the operation is re-run only while its error satisfies
//! [`AppError::is_retryable`], with `min(base * factor^attempt, max)`
//! backoff ± 25% jitter between attempts.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Backoff parameters for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Exponential growth factor per attempt.
    pub factor: f64,
    /// Ceiling on a single backoff sleep.
    pub max_delay: Duration,
    /// Fractional jitter applied to each sleep (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        // Uniform in [1 - jitter, 1 + jitter].
        let unit = random_unit();
        let scale = 1.0 - self.jitter + 2.0 * self.jitter * unit;
        Duration::from_secs_f64((base * scale).max(0.0))
    }
}

/// Run `operation` until it succeeds, its error is not retryable, or the
/// attempt budget is spent. Returns the last error on exhaustion.
pub async fn retry_with_backoff<F, T, Fut>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.jittered_backoff(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Jitter from a simple xorshift seeded off the clock. No rand dependency.
// ---------------------------------------------------------------------------

/// A pseudo-random value in [0, 1). Good enough for jitter, not crypto.
pub fn random_unit() -> f64 {
    (xorshift_now() % 10_000) as f64 / 10_000.0
}

/// A pseudo-random value in [0, max_ms). Returns 0 when `max_ms` is 0.
pub fn random_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    xorshift_now() % max_ms
}

fn xorshift_now() -> u64 {
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(300),
            jitter: 0.25,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300)); // capped
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
    }

    #[test]
    fn jittered_backoff_stays_within_quarter_band() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };
        for _ in 0..100 {
            let d = policy.jittered_backoff(1).as_secs_f64();
            assert!((0.075..=0.125).contains(&d), "jittered delay {d} out of band");
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result = retry_with_backoff(&fast_policy(), || {
            let calls = calls_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::NetworkError("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<(), _> = retry_with_backoff(&fast_policy(), || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Timeout(5))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<(), _> = retry_with_backoff(&fast_policy(), || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::AiRefusal("declined".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::AiRefusal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn random_jitter_is_bounded() {
        for _ in 0..100 {
            assert!(random_jitter_ms(50) < 50);
        }
        assert_eq!(random_jitter_ms(0), 0);
    }
}
