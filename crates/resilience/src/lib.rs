//! Event bus, idempotency guard, circuit breaker, retry, and named
//! resilience instance primitives.

pub mod bus;
pub mod circuit_breaker;
pub mod error;
pub mod idempotency;
pub mod instance;
pub mod retry;

pub use bus::{Envelope, EnvelopeSigner, EventBus, Subscriber, ENVELOPE_VERSION};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager, CircuitBreakerStats, CircuitState};
pub use error::{ResilienceError, ResilienceResult};
pub use idempotency::{BeginOutcome, IdempotencyGuard};
pub use instance::{InstanceCallError, InstanceConfig, ResilienceInstance, ResilienceRegistry};
pub use retry::{AlwaysRetry, FnClassifier, RetryClassifier, RetryConfig, RetryExecutor, RetryExhausted};
