//! Error types for the event and key model, event store, view store, and
//! persistence adapter.

/// Errors raised by [`crate::store::EventStore`], [`crate::view::ViewStore`]
/// and the persistence adapter.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CoreError {
    /// The backing store (hot cache or durable relational store) rejected
    /// the operation.
    #[error("store error during {operation}: {message}")]
    Store {
        /// Name of the operation that failed (`append`, `get_for_key`, ...).
        operation: String,
        /// Underlying error message.
        message: String,
    },

    /// A `(entity_key, sequence)` pair was appended twice. The journal is
    /// append-only and never reuses a key.
    #[error("duplicate event for entity key {entity_key} at sequence {sequence}")]
    DuplicateSequence {
        /// The entity key involved.
        entity_key: String,
        /// The sequence number that was already present.
        sequence: u64,
    },

    /// No value was found for a key that the caller expected to exist.
    #[error("no record found for key {0}")]
    NotFound(String),

    /// The view updater's apply function failed.
    #[error("view update failed for entity key {entity_key}: {message}")]
    ViewUpdate {
        /// The entity key being updated.
        entity_key: String,
        /// Underlying error message.
        message: String,
    },

    /// Serialization/deserialization of a payload or persisted record
    /// failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The durable backing store reported an error. The write-behind loop
    /// retries these forever with backoff; this variant surfaces only
    /// through the `persistence.errors{operation}` metric, not to callers.
    #[error("persistence backend error during {operation}: {message}")]
    Persistence {
        /// Name of the failed operation (`persist_batch`, `load_by_key`, ...).
        operation: String,
        /// Underlying error message.
        message: String,
    },
}

impl CoreError {
    /// Every error in this crate is retried at a higher layer (the
    /// write-behind loop retries forever, the pipeline sweeper retries up to
    /// a cap) except duplicate-sequence and not-found, which indicate a
    /// logic bug or a caller mistake rather than a transient condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoreError::DuplicateSequence { .. } | CoreError::NotFound(_)
        )
    }
}

/// Convenience alias used throughout this crate.
pub type CoreResult<T> = Result<T, CoreError>;
