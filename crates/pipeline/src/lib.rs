//! Pipeline engine, event sourcing controller, sequence generation,
//! completion tracking, transactional outbox, and dead letter queue.

pub mod completion;
pub mod config;
pub mod controller;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod outbox;
pub mod sequence;

pub use completion::{CompletionHandle, CompletionInfo, CompletionTracker};
pub use config::{DlqConfig, OutboxConfig, PipelineConfig};
pub use controller::EventSourcingController;
pub use dlq::{DeadLetterQueue, DlqEntry};
pub use engine::{Enricher, FailingEnricher, NoopEnricher, PipelineEngine};
pub use error::{PipelineError, PipelineResult};
pub use outbox::{Outbox, OutboxEntry, OutboxState};
pub use sequence::{FailingSequenceSource, InMemorySequenceSource, SequenceGenerator, SequenceLeaseSource, DEFAULT_LEASE_SIZE};
