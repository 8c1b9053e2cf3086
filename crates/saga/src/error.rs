//! Error types for the saga state store, choreography, orchestrator and
//! timeout detector.
//!
//! Step-level outcomes (failure, timeout, compensation results) are not
//! errors here — they are saga state, recorded on the instance and its
//! step records. This enum covers infrastructure faults only.

use sagaflow_core::CoreError;
use sagaflow_pipeline::PipelineError;
use sagaflow_resilience::ResilienceError;

/// Errors raised across this crate.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SagaEngineError {
    /// Propagated from the event/view/persistence layer.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Propagated from the pipeline/outbox/DLQ layer.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Propagated from the bus/circuit-breaker/retry layer.
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// A saga id was submitted for execution while already registered.
    #[error("saga {0} is already executing")]
    AlreadyExecuting(String),

    /// No saga instance exists with the given id.
    #[error("no saga instance found with id {0}")]
    NotFound(String),

    /// A non-terminal status was passed where only a terminal one is
    /// accepted.
    #[error("saga {saga_id} cannot be finalized with non-terminal status {status}")]
    InvalidTransition {
        /// The saga instance.
        saga_id: String,
        /// The rejected status.
        status: String,
    },

    /// A [`crate::compensation::CompensationRegistry`] failed build-time
    /// validation: every non-terminal forward event type must map to
    /// exactly one compensating event type and owning service.
    #[error("compensation registry invalid: forward event type '{0}' has no compensation mapping and is not marked terminal")]
    CompensationRegistryError(String),
}

impl SagaEngineError {
    /// `AlreadyExecuting`, `NotFound` and `InvalidTransition` indicate a
    /// logic error or a stale caller view, not a transient condition;
    /// everything else delegates to the underlying layer's classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaEngineError::Core(e) => e.is_retryable(),
            SagaEngineError::Pipeline(e) => e.is_retryable(),
            SagaEngineError::Resilience(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type SagaEngineResult<T> = Result<T, SagaEngineError>;
