//! Circuit breaker for network resilience.
//!
//! Protects image hosts and the vision API from being hammered while they
//! are failing. Unlike a classic in-process breaker, no state field is
//! stored anywhere: the state is recomputed on every call from rolling
//! failure/request counters held in a shared [`CounterStore`], so every
//! worker pointed at the same store observes the same circuit.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[failure rate over threshold]--> OPEN (rejecting)
//!                                                        |
//!                          [cooldown elapsed]            v
//! CLOSED <--[probe succeeds]-- HALF_OPEN <---------------+
//!                                  |
//!                                  +--[probe fails]--> OPEN
//! ```
//!
//! An auto-throttle delay is applied before every admitted request and
//! tuned after each success toward a target number of effective
//! concurrent in-flight requests.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::AppError;
use crate::traits::CounterStore;

/// Current state of the circuit breaker, derived from counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// Cooldown elapsed; the next request probes the target.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Minimum failures inside the window before the circuit can open.
    pub failure_threshold: u64,

    /// Minimum requests inside the window before the failure rate is
    /// considered meaningful.
    pub volume_threshold: u64,

    /// Failure rate (failures / requests) above which the circuit opens.
    pub failure_rate: f64,

    /// Rolling window after which counters self-reset.
    pub window: Duration,

    /// Time after the last failure before a probe is allowed through.
    pub cooldown: Duration,

    /// Auto-throttle target for effective concurrent in-flight requests.
    pub target_concurrency: f64,

    /// Clamp bounds for the auto-throttle delay.
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            volume_threshold: 5,
            failure_rate: 0.5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            target_concurrency: 2.0,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Snapshot of circuit state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub requests: u64,
    pub failures: u64,
    pub current_delay: Duration,
    pub time_until_half_open: Option<Duration>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - request was rejected without any I/O.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl CircuitBreakerError {
    /// Flatten into the application error taxonomy at a pipeline boundary.
    pub fn into_app_error(self) -> AppError {
        match self {
            CircuitBreakerError::Open { name, retry_after } => AppError::CircuitOpen {
                target: name,
                retry_after_secs: retry_after.as_secs(),
            },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Derive the circuit state from raw counters.
///
/// Pure function of (requests, failures, elapsed-since-last-failure,
/// thresholds); shared-store atomicity is the only concurrency concern.
pub fn derive_state(
    requests: u64,
    failures: u64,
    since_last_failure: Option<Duration>,
    config: &CircuitBreakerConfig,
) -> CircuitState {
    let tripped = requests >= config.volume_threshold
        && failures >= config.failure_threshold
        && (failures as f64 / requests as f64) > config.failure_rate;
    if !tripped {
        return CircuitState::Closed;
    }
    match since_last_failure {
        Some(elapsed) if elapsed >= config.cooldown => CircuitState::HalfOpen,
        // A tripped circuit with no recorded failure time cannot place the
        // cooldown, so stay open until the window expires the counters.
        _ => CircuitState::Open,
    }
}

#[derive(Debug)]
struct Throttle {
    current_delay: Duration,
    total_latency: Duration,
    samples: u64,
}

/// Shared-counter circuit breaker with auto-throttling.
#[derive(Clone)]
pub struct CircuitBreaker<S: CounterStore> {
    name: String,
    config: CircuitBreakerConfig,
    store: S,
    throttle: Arc<Mutex<Throttle>>,
}

impl<S: CounterStore> CircuitBreaker<S> {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, store: S) -> Self {
        let throttle = Throttle {
            current_delay: config.min_delay,
            total_latency: Duration::ZERO,
            samples: 0,
        };
        Self {
            name: name.into(),
            config,
            store,
            throttle: Arc::new(Mutex::new(throttle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("circuit:{}:{}", self.name, suffix)
    }

    async fn snapshot(&self) -> Result<(u64, u64, Option<Duration>), AppError> {
        let requests = self.store.get(&self.key("requests")).await?;
        let failures = self.store.get(&self.key("failures")).await?;
        let last_failure_ms = self.store.get(&self.key("last_failure")).await?;
        let since = if last_failure_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(
                now_millis().saturating_sub(last_failure_ms),
            ))
        };
        Ok((requests, failures, since))
    }

    /// Current state, recomputed from the shared counters.
    pub async fn state(&self) -> Result<CircuitState, AppError> {
        let (requests, failures, since) = self.snapshot().await?;
        Ok(derive_state(requests, failures, since, &self.config))
    }

    pub async fn stats(&self) -> Result<CircuitBreakerStats, AppError> {
        let (requests, failures, since) = self.snapshot().await?;
        let state = derive_state(requests, failures, since, &self.config);
        let time_until_half_open = if state == CircuitState::Open {
            since.map(|elapsed| self.config.cooldown.saturating_sub(elapsed))
        } else {
            None
        };
        Ok(CircuitBreakerStats {
            name: self.name.clone(),
            state,
            requests,
            failures,
            current_delay: self.current_delay(),
            time_until_half_open,
        })
    }

    /// The delay currently inserted before each admitted request.
    pub fn current_delay(&self) -> Duration {
        self.lock_throttle().current_delay
    }

    fn lock_throttle(&self) -> std::sync::MutexGuard<'_, Throttle> {
        self.throttle.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned throttle mutex");
            poisoned.into_inner()
        })
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: applies the throttle delay, executes, records the result
    /// - Open: returns `CircuitBreakerError::Open` immediately, no I/O
    /// - HalfOpen: lets the probe through; success resets all counters,
    ///   failure re-arms the cooldown
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let (requests, failures, since) = self
            .snapshot()
            .await
            .map_err(CircuitBreakerError::Inner)?;
        let state = derive_state(requests, failures, since, &self.config);

        if state == CircuitState::Open {
            let retry_after = since
                .map(|elapsed| self.config.cooldown.saturating_sub(elapsed))
                .unwrap_or(self.config.cooldown);
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after,
            });
        }

        let delay = self.current_delay();
        if !delay.is_zero() {
            // Jitter up to +25% so a fleet of workers does not march in step.
            let jitter = crate::retry::random_jitter_ms(delay.as_millis() as u64 / 4 + 1);
            tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
        }

        self.record_request().await.map_err(CircuitBreakerError::Inner)?;

        let started = Instant::now();
        let result = operation().await;
        let latency = started.elapsed();

        match &result {
            Ok(_) => {
                self.record_success(state, latency)
                    .await
                    .map_err(CircuitBreakerError::Inner)?;
            }
            Err(e) => {
                if e.should_trip_circuit() {
                    self.record_failure(state, e)
                        .await
                        .map_err(CircuitBreakerError::Inner)?;
                }
            }
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    async fn record_request(&self) -> Result<(), AppError> {
        self.store.increment(&self.key("requests")).await?;
        self.store
            .expire(&self.key("requests"), self.config.window)
            .await
    }

    async fn record_success(&self, prior: CircuitState, latency: Duration) -> Result<(), AppError> {
        if prior == CircuitState::HalfOpen {
            tracing::info!(circuit = %self.name, "Probe succeeded, closing circuit");
            self.store.delete(&self.key("requests")).await?;
            self.store.delete(&self.key("failures")).await?;
            self.store.delete(&self.key("last_failure")).await?;
        }
        self.update_throttle(latency);
        Ok(())
    }

    async fn record_failure(&self, prior: CircuitState, error: &AppError) -> Result<(), AppError> {
        let failures = self.store.increment(&self.key("failures")).await?;
        self.store
            .expire(&self.key("failures"), self.config.window)
            .await?;
        self.store
            .put(&self.key("last_failure"), now_millis())
            .await?;
        self.store
            .expire(&self.key("last_failure"), self.config.window)
            .await?;

        match prior {
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Probe failed, circuit returns to open"
                );
            }
            _ => {
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures,
                        error = %error,
                        "Failure threshold reached inside window"
                    );
                }
            }
        }
        Ok(())
    }

    /// Nudge the throttle delay toward `avg_latency / target_concurrency`.
    fn update_throttle(&self, latency: Duration) {
        let mut throttle = self.lock_throttle();
        throttle.total_latency += latency;
        throttle.samples += 1;
        let avg = throttle.total_latency.as_secs_f64() / throttle.samples as f64;
        let target = avg / self.config.target_concurrency;
        let next = (throttle.current_delay.as_secs_f64() + target) / 2.0;
        throttle.current_delay = Duration::from_secs_f64(next.clamp(
            self.config.min_delay.as_secs_f64(),
            self.config.max_delay.as_secs_f64(),
        ));
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::store::MemoryCounterStore;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker<MemoryCounterStore> {
        CircuitBreaker::new("test", config, MemoryCounterStore::new())
    }

    async fn fail_once(cb: &CircuitBreaker<MemoryCounterStore>) {
        let _ = cb
            .call(|| async { Err::<(), _>(AppError::NetworkError("test".into())) })
            .await;
    }

    #[test]
    fn derive_state_is_closed_below_volume_threshold() {
        let config = CircuitBreakerConfig::default();
        // Massive failure count, but not enough requests to judge.
        let state = derive_state(4, 4, Some(Duration::from_secs(1)), &config);
        assert_eq!(state, CircuitState::Closed);
    }

    #[test]
    fn derive_state_opens_on_rate_and_count() {
        let config = CircuitBreakerConfig::default();
        let state = derive_state(8, 5, Some(Duration::from_secs(1)), &config);
        assert_eq!(state, CircuitState::Open);
    }

    #[test]
    fn derive_state_requires_majority_failure_rate() {
        let config = CircuitBreakerConfig::default();
        // 5 failures out of 20 requests: rate 0.25, stays closed.
        let state = derive_state(20, 5, Some(Duration::from_secs(1)), &config);
        assert_eq!(state, CircuitState::Closed);
    }

    #[test]
    fn derive_state_half_open_after_cooldown() {
        let config = CircuitBreakerConfig::default();
        let state = derive_state(8, 8, Some(config.cooldown + Duration::from_secs(1)), &config);
        assert_eq!(state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let cb = breaker(fast_config());
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let cb = breaker(fast_config());
        for _ in 0..5 {
            fail_once(&cb).await;
        }
        assert_eq!(cb.state().await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn sixth_call_fails_fast_without_executing() {
        let cb = breaker(fast_config());
        for _ in 0..5 {
            fail_once(&cb).await;
        }

        let executed = AtomicBool::new(false);
        let result = cb
            .call(|| async {
                executed.store(true, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stays_closed_below_failure_threshold() {
        let cb = breaker(fast_config());
        for _ in 0..4 {
            fail_once(&cb).await;
        }
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successful_probe_resets_to_closed() {
        let config = CircuitBreakerConfig {
            cooldown: Duration::from_millis(20),
            ..fast_config()
        };
        let cb = breaker(config);
        for _ in 0..5 {
            fail_once(&cb).await;
        }
        assert_eq!(cb.state().await.unwrap(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.state().await.unwrap(), CircuitState::HalfOpen);

        cb.call(|| async { Ok::<_, AppError>(()) }).await.unwrap();

        let stats = cb.stats().await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn failed_probe_rearms_the_cooldown() {
        let config = CircuitBreakerConfig {
            cooldown: Duration::from_millis(20),
            ..fast_config()
        };
        let cb = breaker(config);
        for _ in 0..5 {
            fail_once(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.state().await.unwrap(), CircuitState::HalfOpen);

        fail_once(&cb).await;
        assert_eq!(cb.state().await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn content_errors_do_not_trip_the_circuit() {
        let cb = breaker(fast_config());
        for _ in 0..10 {
            let _ = cb
                .call(|| async { Err::<(), _>(AppError::AiRefusal("declined".into())) })
                .await;
        }
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn call_returns_result_when_closed() {
        let cb = breaker(fast_config());
        let result = cb
            .call(|| async { Ok::<_, AppError>("success".to_string()) })
            .await;
        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn throttle_delay_tracks_latency_and_clamps() {
        let config = CircuitBreakerConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::from_millis(10),
            target_concurrency: 2.0,
            ..Default::default()
        };
        let cb = breaker(config);

        cb.call(|| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();

        let delay = cb.current_delay();
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn open_error_flattens_into_app_error() {
        let cb = breaker(fast_config());
        for _ in 0..5 {
            fail_once(&cb).await;
        }
        let err = cb
            .call(|| async { Ok::<_, AppError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err.into_app_error(),
            AppError::CircuitOpen { .. }
        ));
    }
}
