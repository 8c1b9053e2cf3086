//! Event and key model, append-only event store, materialized view store,
//! write-behind persistence adapters, and the shared metrics registry.

pub mod error;
pub mod event;
pub mod metrics;
pub mod persistence;
pub mod store;
pub mod view;
pub mod write_behind;

pub use error::{CoreError, CoreResult};
pub use event::{EventRecord, PartitionKey, PartitionedSequenceKey, Payload, SagaMetadata};
pub use metrics::{HistogramSnapshot, Metrics, MetricsSnapshot};
pub use persistence::{InMemoryPersistenceBackend, PersistedEvent, PersistedView, PersistenceBackend};
pub use store::{BackendStats, EventStore, EventStoreBackend, InMemoryEventStoreBackend};
pub use view::{ViewRecord, ViewStore, ViewUpdateFn, ViewUpdater};
pub use write_behind::{EvictionConfig, InitialLoadMode, ViewWriteBehind, WriteBehindConfig, WriteBehindEventStoreBackend};

#[cfg(feature = "sqlite")]
pub use persistence::SqlitePersistenceBackend;
