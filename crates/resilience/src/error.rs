//! Error types for the event bus, idempotency guard, circuit breaker and
//! retry primitives.

/// Errors raised by [`crate::circuit_breaker::CircuitBreaker`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum ResilienceError {
    /// The circuit is open (or half-open with no capacity) and the call was
    /// rejected without being attempted.
    #[error("circuit '{name}' is open, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Name of the circuit.
        name: String,
        /// Suggested wait before retrying.
        retry_after_ms: u64,
    },

    /// A retry budget or max-attempts count was exhausted.
    #[error("retry attempts exhausted for '{operation}' after {attempts} attempt(s): {message}")]
    RetriesExhausted {
        /// The operation being retried.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying error.
        message: String,
    },

    /// The event bus had no subscribers for a topic that required at least
    /// one (configuration error, not a transient condition).
    #[error("no subscriber registered for topic '{0}'")]
    NoSubscriber(String),

    /// Envelope signature verification failed.
    #[error("envelope signature mismatch for topic '{topic}'")]
    SignatureMismatch {
        /// Topic the envelope was published to.
        topic: String,
    },

    /// Publishing to the bus failed at the transport layer.
    #[error("bus publish error on topic '{topic}': {message}")]
    Publish {
        /// Topic the envelope was published to.
        topic: String,
        /// Underlying error message.
        message: String,
    },
}

impl ResilienceError {
    /// `CircuitOpen` and `Publish` are transient conditions a caller should
    /// retry with backoff; `RetriesExhausted`, `NoSubscriber` and
    /// `SignatureMismatch` indicate either exhaustion already happened or a
    /// configuration mistake, neither of which a bare retry fixes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. } | ResilienceError::Publish { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type ResilienceResult<T> = Result<T, ResilienceError>;
