//! Circuit breaker: fail fast against a downstream that is already
//! failing, instead of piling up latency on every caller.
//!
//! The trip condition is a sliding failure-rate window: 50% failure rate
//! over a 10s window by default, evaluated once at least 10 requests have
//! landed in that window.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through normally.
    Closed,
    /// Requests fail immediately without being attempted.
    Open,
    /// A limited number of requests are allowed through to probe recovery.
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

/// Configuration for one circuit breaker instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Fraction of requests in `window` that must fail to open the circuit.
    pub failure_rate_threshold: f64,
    /// Sliding window over which the failure rate is computed.
    #[serde(with = "humantime_duration")]
    pub window: Duration,
    /// Minimum number of requests in `window` before the rate is evaluated;
    /// below this, the circuit never opens regardless of rate.
    pub min_requests_to_evaluate: u32,
    /// Consecutive successes in half-open required to close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing with a half-open
    /// request.
    #[serde(with = "humantime_duration")]
    pub open_duration: Duration,
    /// Maximum concurrent probe requests allowed while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(10),
            min_requests_to_evaluate: 10,
            success_threshold: 3,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

impl CircuitBreakerConfig {
    /// Set the failure rate threshold (0.0-1.0).
    pub fn with_failure_rate_threshold(mut self, rate: f64) -> Self {
        self.failure_rate_threshold = rate;
        self
    }

    /// Set the sliding window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the minimum sample size before the rate is evaluated.
    pub fn with_min_requests_to_evaluate(mut self, n: u32) -> Self {
        self.min_requests_to_evaluate = n;
        self
    }

    /// Set how long the circuit stays open before probing.
    pub fn with_open_duration(mut self, d: Duration) -> Self {
        self.open_duration = d;
        self
    }
}

/// Point-in-time statistics for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Lifetime successful calls.
    pub success_count: u64,
    /// Lifetime failed calls.
    pub failure_count: u64,
    /// Calls rejected outright because the circuit was open.
    pub rejected_count: u64,
    /// Requests currently counted in the sliding window.
    pub requests_in_window: u32,
    /// Failure rate over the current window, if evaluated.
    pub failure_rate: Option<f64>,
}

struct Sample {
    at: Instant,
    success: bool,
}

/// A circuit breaker guarding one downstream resource (a saga step target,
/// an outbox publish destination, ...).
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    state_changed_at: RwLock<Instant>,
    window: RwLock<Vec<Sample>>,
    half_open_successes: AtomicU32,
    half_open_in_flight: AtomicU32,
    success_count: std::sync::atomic::AtomicU64,
    failure_count: std::sync::atomic::AtomicU64,
    rejected_count: std::sync::atomic::AtomicU64,
}

/// Error surfaced by [`CircuitBreaker::call`]: either the circuit rejected
/// the call outright, or the call ran and the wrapped operation failed.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Rejected without attempting the call.
    Open {
        /// Circuit name.
        name: String,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// The call was attempted and the wrapped operation returned an error.
    Inner(E),
}

impl CircuitBreaker {
    /// Create a named circuit breaker with `config`.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            state_changed_at: RwLock::new(Instant::now()),
            window: RwLock::new(Vec::new()),
            half_open_successes: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            success_count: std::sync::atomic::AtomicU64::new(0),
            failure_count: std::sync::atomic::AtomicU64::new(0),
            rejected_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// The circuit's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn maybe_transition_to_half_open(&self) {
        let state = *self.state.read();
        if state == CircuitState::Open {
            let elapsed = self.state_changed_at.read().elapsed();
            if elapsed >= self.config.open_duration {
                self.transition_to(CircuitState::HalfOpen);
            }
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let mut state = self.state.write();
        let old_state = *state;
        if old_state == new_state {
            return;
        }
        *state = new_state;
        *self.state_changed_at.write() = Instant::now();
        if matches!(new_state, CircuitState::HalfOpen | CircuitState::Closed) {
            self.half_open_successes.store(0, Ordering::Relaxed);
            self.half_open_in_flight.store(0, Ordering::Relaxed);
        }
        if new_state == CircuitState::Closed {
            self.window.write().clear();
        }
        info!(circuit = %self.name, from = %old_state, to = %new_state, "circuit breaker transitioned");
    }

    /// Check whether a call is currently allowed, without executing it.
    pub fn check(&self) -> Result<(), (String, Duration)> {
        self.maybe_transition_to_half_open();
        let state = *self.state.read();
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                let elapsed = self.state_changed_at.read().elapsed();
                let retry_after = self.config.open_duration.saturating_sub(elapsed);
                Err((self.name.clone(), retry_after))
            }
            CircuitState::HalfOpen => {
                let in_flight = self.half_open_in_flight.load(Ordering::Acquire);
                if in_flight < self.config.half_open_max_requests {
                    self.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                } else {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    Err((self.name.clone(), Duration::from_millis(100)))
                }
            }
        }
    }

    fn prune(&self, window: &mut Vec<Sample>, now: Instant) {
        let cutoff = now - self.config.window;
        window.retain(|s| s.at > cutoff);
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let state = *self.state.read();
        if state == CircuitState::HalfOpen {
            self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition_to(CircuitState::Closed);
            }
        } else {
            let now = Instant::now();
            let mut window = self.window.write();
            window.push(Sample { at: now, success: true });
            self.prune(&mut window, now);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let now = Instant::now();
                let mut window = self.window.write();
                window.push(Sample { at: now, success: false });
                self.prune(&mut window, now);

                let total = window.len() as u32;
                if total >= self.config.min_requests_to_evaluate {
                    let failures = window.iter().filter(|s| !s.success).count() as f64;
                    let rate = failures / total as f64;
                    if rate >= self.config.failure_rate_threshold {
                        drop(window);
                        warn!(circuit = %self.name, failure_rate = rate, "failure rate threshold exceeded");
                        self.transition_to(CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Execute `f` through the circuit, recording the outcome.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check().map_err(|(name, retry_after)| CircuitBreakerError::Open { name, retry_after })?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Current state, transitioning Open -> HalfOpen first if due.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.read()
    }

    /// Snapshot of current statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        self.maybe_transition_to_half_open();
        let state = *self.state.read();
        let now = Instant::now();
        let mut window = self.window.write();
        self.prune(&mut window, now);
        let total = window.len() as u32;
        let failure_rate = if total >= self.config.min_requests_to_evaluate {
            Some(window.iter().filter(|s| !s.success).count() as f64 / total as f64)
        } else {
            None
        };
        CircuitBreakerStats {
            state,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            requests_in_window: total,
            failure_rate,
        }
    }

    /// Force the circuit back to closed, clearing its window.
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
    }
}

/// Registry of named circuit breakers, one per downstream resource, sharing
/// a default config unless created with an override.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    /// A manager using `default_config` for breakers created via
    /// [`CircuitBreakerManager::get_or_create`].
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get the breaker for `name`, creating it with the default config if
    /// absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Create (or replace) the breaker for `name` with a specific config.
    pub fn create_with_config(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Stats for every known circuit.
    pub fn all_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        self.breakers.iter().map(|e| (e.key().clone(), e.value().stats())).collect()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_rate_threshold_with_enough_samples() {
        let breaker = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig::default().with_min_requests_to_evaluate(4),
        );
        for _ in 0..2 {
            let _ = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        }
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn stays_closed_below_minimum_sample_size() {
        let breaker = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig::default().with_min_requests_to_evaluate(10),
        );
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_attempting_call() {
        let breaker = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig::default().with_min_requests_to_evaluate(1),
        );
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let mut attempted = false;
        let result = breaker
            .call(|| {
                attempted = true;
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert!(!attempted);
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig::default()
                .with_min_requests_to_evaluate(1)
                .with_open_duration(Duration::from_millis(10)),
        );
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        for _ in 0..3 {
            let _ = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn manager_reuses_breaker_for_same_name() {
        let manager = CircuitBreakerManager::default();
        let a = manager.get_or_create("svc-a");
        let b = manager.get_or_create("svc-a");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
