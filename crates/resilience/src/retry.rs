//! Retry with exponential backoff and jitter.
//!
//! Non-retryable errors (duplicate sequence, malformed saga definition, ...)
//! must short-circuit immediately rather than burn through the attempt
//! budget; the [`RetryClassifier`] trait lets each crate plug in its own
//! `is_retryable()` without this crate knowing about their error types.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

/// Retry configuration. Defaults: 3 retries, 500ms initial backoff, 2x
/// multiplier.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first (0 = no retries).
    pub max_retries: u32,
    /// Initial backoff interval.
    #[serde(with = "humantime_duration")]
    pub initial_interval: Duration,
    /// Ceiling on any single backoff interval.
    #[serde(with = "humantime_duration")]
    pub max_interval: Duration,
    /// Exponential backoff multiplier.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed interval (0.0 = none, 0.5 = +/-50%).
    pub randomization_factor: f64,
    /// Give up once this much total time has elapsed, regardless of
    /// `max_retries`.
    #[serde(with = "humantime_duration_opt")]
    pub max_elapsed_time: Option<Duration>,
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

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryConfig {
    /// A config with `max_retries` and otherwise-default backoff shape.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Override the initial backoff interval.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Override the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Override the jitter factor, clamped to `[0, 1]`.
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// The backoff interval before attempt `attempt` (0-indexed), with
    /// jitter applied.
    pub fn calculate_interval(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        let jitter_range = capped * self.randomization_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Reports whether a specific error is worth retrying. Each crate's error
/// enum implements this (e.g. `CoreError::is_retryable`) and passes a
/// closure or a small adapter to [`RetryExecutor::execute`].
pub trait RetryClassifier<E> {
    /// `true` if `error` represents a transient condition worth retrying.
    fn should_retry(&self, error: &E) -> bool;
}

/// Retries everything. The default when no classifier is supplied.
pub struct AlwaysRetry;

impl<E> RetryClassifier<E> for AlwaysRetry {
    fn should_retry(&self, _error: &E) -> bool {
        true
    }
}

/// Adapts a plain closure into a [`RetryClassifier`].
pub struct FnClassifier<F>(pub F);

impl<E, F: Fn(&E) -> bool> RetryClassifier<E> for FnClassifier<F> {
    fn should_retry(&self, error: &E) -> bool {
        (self.0)(error)
    }
}

/// All attempts for one operation failed.
#[derive(Debug, Clone)]
pub struct RetryExhausted<E> {
    /// The error from the final attempt.
    pub last_error: E,
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Wall-clock time spent across all attempts and backoff sleeps.
    pub elapsed: Duration,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retries exhausted after {} attempt(s) in {:?}: {}", self.attempts, self.elapsed, self.last_error)
    }
}

/// Drives an async operation through retries with exponential backoff.
pub struct RetryExecutor<E, C: RetryClassifier<E> = AlwaysRetry> {
    config: RetryConfig,
    classifier: C,
    _marker: std::marker::PhantomData<fn(&E)>,
}

impl<E> RetryExecutor<E, AlwaysRetry> {
    /// An executor that retries every error up to `config.max_retries`.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: AlwaysRetry,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E, C: RetryClassifier<E>> RetryExecutor<E, C> {
    /// An executor that consults `classifier` before retrying each failure.
    pub fn with_classifier(config: RetryConfig, classifier: C) -> Self {
        Self {
            config,
            classifier,
            _marker: std::marker::PhantomData,
        }
    }

    /// Run `f` until it succeeds, a non-retryable error is returned, the
    /// attempt budget is exhausted, or `max_elapsed_time` passes.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let exhausted = !self.classifier.should_retry(&error)
                        || attempts > self.config.max_retries
                        || self
                            .config
                            .max_elapsed_time
                            .is_some_and(|max| start.elapsed() >= max);

                    if exhausted {
                        return Err(RetryExhausted {
                            last_error: error,
                            attempts,
                            elapsed: start.elapsed(),
                        });
                    }

                    let interval = self.config.calculate_interval(attempts - 1);
                    debug!(operation, attempt = attempts, next_retry_in = ?interval, "retrying after failure");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// The configuration this executor was built with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let executor = RetryExecutor::<&str>::new(RetryConfig::default());
        let result = executor.execute("op", || async { Ok::<_, &str>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::<&str>::new(
            RetryConfig::default().with_initial_interval(Duration::from_millis(1)),
        );
        let result = executor
            .execute("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let executor = RetryExecutor::<&str>::new(
            RetryConfig::new(2).with_initial_interval(Duration::from_millis(1)),
        );
        let result = executor.execute("op", || async { Err::<(), _>("still broken") }).await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_classification_short_circuits_immediately() {
        let executor = RetryExecutor::with_classifier(
            RetryConfig::default(),
            FnClassifier(|e: &&str| *e != "fatal"),
        );
        let result = executor.execute("op", || async { Err::<(), _>("fatal") }).await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[test]
    fn backoff_grows_exponentially_up_to_cap() {
        let config = RetryConfig::default().with_randomization_factor(0.0);
        let first = config.calculate_interval(0);
        let second = config.calculate_interval(1);
        assert!(second > first);
    }
}
