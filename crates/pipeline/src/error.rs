//! Error types for the pipeline engine, controller, outbox and DLQ.

use sagaflow_core::CoreError;
use sagaflow_resilience::ResilienceError;

/// Errors raised by [`crate::engine`], [`crate::controller`],
/// [`crate::outbox`] and [`crate::dlq`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum PipelineError {
    /// Propagated from the event/view/persistence layer.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Propagated from the bus, circuit breaker or retry layer.
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// Submission failed before the event reached the pending-events map
    /// (sequence lease exhausted, workers shut down). The event never
    /// entered the pipeline.
    #[error("event submission failed: {message}")]
    Submission {
        /// Why submission failed.
        message: String,
    },

    /// A pipeline stage's handler returned an error.
    #[error("stage '{stage}' failed for event {event_id}: {message}")]
    Stage {
        /// Which stage failed (`enrich`, `persist`, `update_view`, `publish`).
        stage: String,
        /// The event being processed.
        event_id: String,
        /// Underlying error message.
        message: String,
    },

    /// The entry exhausted its in-place retries and was routed to the DLQ;
    /// this is what the submitting caller's completion handle resolves
    /// with.
    #[error("pipeline failed for entry {key} at stage '{stage}': {message}")]
    PipelineFailed {
        /// The entry's partitioned sequence key.
        key: String,
        /// The stage that ultimately failed.
        stage: String,
        /// Underlying error message.
        message: String,
    },

    /// An outbox claim was attempted against an entry that was already
    /// claimed or in a terminal state.
    #[error("outbox entry {entry_id} could not be claimed: {reason}")]
    OutboxClaimConflict {
        /// The entry id.
        entry_id: String,
        /// Why the claim failed.
        reason: String,
    },

    /// An outbox entry exceeded its retry budget and was moved to the DLQ.
    #[error("outbox entry {entry_id} exhausted {attempts} delivery attempts")]
    OutboxExhausted {
        /// The entry id.
        entry_id: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A DLQ replay was requested for an entry that already hit its replay
    /// cap.
    #[error("dlq entry {entry_id} has exhausted its replay attempt cap of {cap}")]
    ReplayCapExceeded {
        /// The entry id.
        entry_id: String,
        /// The configured cap.
        cap: u32,
    },

    /// No DLQ entry exists with the given id.
    #[error("no dlq entry found with id {0}")]
    DlqEntryNotFound(String),

    /// A pending completion waited past its timeout and was orphaned; the
    /// pipeline may still complete the event, but nobody is listening.
    #[error("entry {key} timed out waiting for pipeline completion")]
    PendingCompletionTimeout {
        /// The entry's partitioned sequence key.
        key: String,
    },
}

impl PipelineError {
    /// `Stage` failures and resilience/core errors delegate to their own
    /// classification; the pipeline-specific variants here are terminal
    /// conditions a bare retry cannot fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Core(e) => e.is_retryable(),
            PipelineError::Resilience(e) => e.is_retryable(),
            PipelineError::Stage { .. } => true,
            _ => false,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type PipelineResult<T> = Result<T, PipelineError>;
