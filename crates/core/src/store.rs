//! Append-only event store over a pluggable backend.
//!
//! The storage engine is abstracted behind [`EventStoreBackend`] so the
//! in-memory grid map and a durable write-behind store can share the same
//! append and query semantics. Sequence numbers are assigned upstream (by
//! the submitting controller's id generator) before an event reaches this
//! store; the backend only has to enforce uniqueness of already-assigned
//! keys and key-scoped ordering.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::{CoreError, CoreResult};
use crate::event::{EventRecord, PartitionedSequenceKey};

/// Point-in-time counters exposed by a backend.
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Total events stored across all entity keys.
    pub total_events: u64,
    /// Number of distinct entity keys with at least one event.
    pub entity_count: u64,
}

/// Storage contract the [`EventStore`] drives.
#[async_trait]
pub trait EventStoreBackend: Send + Sync {
    /// Append `event` at `key`. Must fail with
    /// [`CoreError::DuplicateSequence`] if `key` already has an event.
    async fn append(&self, key: PartitionedSequenceKey, event: EventRecord) -> CoreResult<()>;

    /// All events for one entity key, ordered by sequence ascending.
    async fn get_for_key(&self, entity_key: &str) -> CoreResult<Vec<EventRecord>>;

    /// All events of a given type across every entity key, ordered by
    /// timestamp ascending.
    async fn get_by_type(&self, event_type: &str) -> CoreResult<Vec<EventRecord>>;

    /// All events whose `timestamp` falls in `[from, to]`, ordered by
    /// timestamp ascending.
    async fn get_in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<EventRecord>>;

    /// The highest sequence number stored, 0 if empty. Used to reseed the
    /// sequence generator after a restart so used ids are never reissued.
    async fn max_sequence(&self) -> CoreResult<u64>;

    /// Current size/cardinality statistics.
    async fn stats(&self) -> CoreResult<BackendStats>;
}

/// In-memory backend: a `DashMap` keyed by entity key, each holding a
/// `BTreeMap<sequence, EventRecord>` so per-key replay stays ordered without
/// a separate sort pass.
#[derive(Default)]
pub struct InMemoryEventStoreBackend {
    by_key: DashMap<String, BTreeMap<u64, EventRecord>>,
}

impl InMemoryEventStoreBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStoreBackend for InMemoryEventStoreBackend {
    #[instrument(skip(self, event), fields(entity_key = %key.entity_key, sequence = key.sequence))]
    async fn append(&self, key: PartitionedSequenceKey, event: EventRecord) -> CoreResult<()> {
        let mut entry = self.by_key.entry(key.entity_key.clone()).or_default();
        if entry.contains_key(&key.sequence) {
            return Err(CoreError::DuplicateSequence {
                entity_key: key.entity_key,
                sequence: key.sequence,
            });
        }
        entry.insert(key.sequence, event);
        debug!(stored = entry.len(), "appended event");
        Ok(())
    }

    async fn get_for_key(&self, entity_key: &str) -> CoreResult<Vec<EventRecord>> {
        Ok(self
            .by_key
            .get(entity_key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_type(&self, event_type: &str) -> CoreResult<Vec<EventRecord>> {
        let mut matches: Vec<EventRecord> = self
            .by_key
            .iter()
            .flat_map(|m| m.value().values().cloned().collect::<Vec<_>>())
            .filter(|e| e.event_type == event_type)
            .collect();
        matches.sort_by_key(|e| e.timestamp);
        Ok(matches)
    }

    async fn get_in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<EventRecord>> {
        let mut matches: Vec<EventRecord> = self
            .by_key
            .iter()
            .flat_map(|m| m.value().values().cloned().collect::<Vec<_>>())
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .collect();
        matches.sort_by_key(|e| e.timestamp);
        Ok(matches)
    }

    async fn max_sequence(&self) -> CoreResult<u64> {
        Ok(self
            .by_key
            .iter()
            .filter_map(|m| m.value().keys().next_back().copied())
            .max()
            .unwrap_or(0))
    }

    async fn stats(&self) -> CoreResult<BackendStats> {
        let total_events = self.by_key.iter().map(|m| m.value().len() as u64).sum();
        Ok(BackendStats {
            total_events,
            entity_count: self.by_key.len() as u64,
        })
    }
}

/// The append-only event store. One immutable record per
/// `(sequence, entity_key)`; the journal for a key is its ordered history.
pub struct EventStore<B: EventStoreBackend = InMemoryEventStoreBackend> {
    backend: Arc<B>,
}

impl<B: EventStoreBackend> EventStore<B> {
    /// Wrap a backend in a new store.
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Wrap an already-shared backend handle.
    pub fn from_shared(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Append `event` at `key`, stamping the key's sequence onto the record.
    #[instrument(skip(self, event), fields(entity_key = %key.entity_key, sequence = key.sequence))]
    pub async fn append(&self, key: PartitionedSequenceKey, mut event: EventRecord) -> CoreResult<()> {
        event.sequence = Some(key.sequence);
        self.backend.append(key, event).await
    }

    /// Full ordered history for one entity key.
    pub async fn get_for_key(&self, entity_key: &str) -> CoreResult<Vec<EventRecord>> {
        self.backend.get_for_key(entity_key).await
    }

    /// All events of a given type, across entity keys, time-ordered.
    pub async fn get_by_type(&self, event_type: &str) -> CoreResult<Vec<EventRecord>> {
        self.backend.get_by_type(event_type).await
    }

    /// All events in a closed time range, time-ordered.
    pub async fn get_in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<EventRecord>> {
        self.backend.get_in_time_range(from, to).await
    }

    /// The highest sequence number stored, 0 if the store is empty.
    pub async fn max_sequence(&self) -> CoreResult<u64> {
        self.backend.max_sequence().await
    }

    /// Current size/cardinality statistics.
    pub async fn stats(&self) -> CoreResult<BackendStats> {
        self.backend.stats().await
    }

    /// A clone of the shared backend handle, for components that need
    /// direct access.
    pub fn backend(&self) -> Arc<B> {
        self.backend.clone()
    }
}
