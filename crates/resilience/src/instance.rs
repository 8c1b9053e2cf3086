//! Named resilience instances: one retry-plus-circuit-breaker composition
//! per downstream purpose (`"inventory-stock-reservation"`,
//! `"payment-capture"`, ...), looked up from a registry that applies
//! per-name configuration overrides on top of shared defaults.
//!
//! The composition runs retries on the outside and the breaker on the
//! inside, so every individual attempt is sampled by the breaker's window
//! and a breaker that trips mid-retry stops the remaining attempts from
//! reaching the downstream at all. A circuit-open rejection is surfaced as
//! its own variant: callers record the owning saga step as pending-retry
//! rather than failed, because nothing was actually attempted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::future::Future;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::retry::RetryConfig;

/// Why a guarded call did not produce a value.
#[derive(Debug)]
pub enum InstanceCallError<E> {
    /// The circuit rejected the call without attempting it. The downstream
    /// was never contacted; retry later.
    CircuitOpen {
        /// The instance name.
        name: String,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// The call ran and failed with an error classified non-retryable (a
    /// business rejection); no retries were attempted beyond it.
    Rejected(E),
    /// Every attempt in the retry budget failed.
    Exhausted {
        /// The error from the final attempt.
        last_error: E,
        /// Total attempts made.
        attempts: u32,
    },
}

impl<E: std::fmt::Display> std::fmt::Display for InstanceCallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceCallError::CircuitOpen { name, retry_after } => {
                write!(f, "circuit '{}' is open, retry after {:?}", name, retry_after)
            }
            InstanceCallError::Rejected(e) => write!(f, "rejected without retry: {}", e),
            InstanceCallError::Exhausted { last_error, attempts } => {
                write!(f, "exhausted after {} attempt(s): {}", attempts, last_error)
            }
        }
    }
}

/// Configuration for one named instance.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Retry/backoff shape.
    pub retry: RetryConfig,
    /// Circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerConfig,
}

/// One named retry + circuit breaker composition.
pub struct ResilienceInstance {
    name: String,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl ResilienceInstance {
    /// Build an instance named `name` from `config`.
    pub fn new(name: impl Into<String>, config: InstanceConfig) -> Self {
        let name = name.into();
        Self {
            breaker: Arc::new(CircuitBreaker::new(name.clone(), config.circuit_breaker)),
            retry: config.retry,
            name,
        }
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying breaker, for inspecting state in tests and admin
    /// surfaces.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `f` under this instance: each attempt passes through the
    /// breaker, failures classified retryable by `is_retryable` are retried
    /// with backoff up to the configured budget, and non-retryable failures
    /// return immediately as [`InstanceCallError::Rejected`].
    pub async fn call<F, Fut, T, E>(&self, mut f: F, is_retryable: impl Fn(&E) -> bool) -> Result<T, InstanceCallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Err((name, retry_after)) = self.breaker.check() {
                warn!(instance = %self.name, "circuit open, call rejected without attempt");
                return Err(InstanceCallError::CircuitOpen { name, retry_after });
            }

            match f().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) => {
                    self.breaker.record_failure();
                    if !is_retryable(&error) {
                        debug!(instance = %self.name, error = %error, "non-retryable failure, not retrying");
                        return Err(InstanceCallError::Rejected(error));
                    }
                    let out_of_attempts = attempts > self.retry.max_retries
                        || self
                            .retry
                            .max_elapsed_time
                            .is_some_and(|max| start.elapsed() >= max);
                    if out_of_attempts {
                        return Err(InstanceCallError::Exhausted {
                            last_error: error,
                            attempts,
                        });
                    }
                    let interval = self.retry.calculate_interval(attempts - 1);
                    debug!(instance = %self.name, attempt = attempts, next_retry_in = ?interval, error = %error, "retrying after failure");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

/// Registry of named instances: shared defaults plus per-name overrides,
/// instances created lazily on first lookup.
pub struct ResilienceRegistry {
    instances: DashMap<String, Arc<ResilienceInstance>>,
    defaults: InstanceConfig,
    overrides: HashMap<String, InstanceConfig>,
}

impl ResilienceRegistry {
    /// A registry applying `defaults` to every instance not named in
    /// `overrides`.
    pub fn new(defaults: InstanceConfig, overrides: HashMap<String, InstanceConfig>) -> Self {
        Self {
            instances: DashMap::new(),
            defaults,
            overrides,
        }
    }

    /// The instance for `name`, created on first use from its override or
    /// the shared defaults.
    pub fn get_or_create(&self, name: &str) -> Arc<ResilienceInstance> {
        self.instances
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.overrides.get(name).cloned().unwrap_or_else(|| self.defaults.clone());
                Arc::new(ResilienceInstance::new(name, config))
            })
            .clone()
    }

    /// Names of every instance created so far.
    pub fn instance_names(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(InstanceConfig::default(), HashMap::new())
    }
}
