//! Domain event and partitioned sequence key model.
//!
//! A [`Payload`] is the self-describing, schematized body produced by a
//! command handler. It is wrapped in an [`EventRecord`] that carries the
//! envelope metadata (ids, timestamps, saga linkage) the rest of the
//! pipeline needs without inspecting the body. The payload stays a tagged
//! field-map so that consumers which do not share code with the producer
//! can still discover its shape.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::view::ViewRecord;

/// A self-describing, schema-tagged payload. The `schema` field lets a
/// consumer with no shared code discover the shape of `fields` before
/// deserializing it into a concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Schema identifier, e.g. `"OrderCreated.v1"`.
    pub schema: String,
    /// The actual field map.
    pub fields: serde_json::Value,
}

impl Payload {
    /// Build a payload by serializing `value` under the given schema tag.
    pub fn new(schema: impl Into<String>, value: &impl Serialize) -> Result<Self, String> {
        Ok(Self {
            schema: schema.into(),
            fields: serde_json::to_value(value).map_err(|e| e.to_string())?,
        })
    }

    /// Deserialize the field map into a concrete type.
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, String> {
        serde_json::from_value(self.fields.clone()).map_err(|e| e.to_string())
    }
}

/// Saga linkage carried by an event that participates in a saga.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaMetadata {
    /// The saga instance this event belongs to.
    pub saga_id: Option<String>,
    /// The saga type (definition name).
    pub saga_type: Option<String>,
    /// The step number within the saga this event represents.
    pub step_number: Option<u32>,
    /// Whether this event is part of a compensation flow rather than the
    /// forward flow.
    pub is_compensating: bool,
}

/// The immutable domain event envelope.
///
/// Constructed once by the submitting service and never mutated after the
/// pipeline completes it; lifecycle timestamps are filled in as the event
/// moves through submission and the pipeline's source stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Globally unique event id. Never reused.
    pub event_id: String,
    /// Short tag identifying the kind of event, e.g. `"OrderCreated"`.
    pub event_type: String,
    /// Schema/version of the event shape.
    pub event_version: u32,
    /// The service that produced this event.
    pub source: String,
    /// Creation timestamp.
    pub timestamp: DateTime<Utc>,
    /// The aggregate this event affects. `(entity_key, sequence)` is unique
    /// within a service.
    pub entity_key: String,
    /// Links together all events produced by one business request.
    pub correlation_id: String,
    /// Saga linkage, if this event participates in a saga.
    pub saga: SagaMetadata,
    /// Set by the controller at submission time.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Set by the pipeline's source stage when the entry is dequeued.
    pub pipeline_entry_time: Option<DateTime<Utc>>,
    /// The monotonic sequence number assigned at submission. `None` until
    /// assigned.
    pub sequence: Option<u64>,
    /// The schema-tagged payload.
    pub payload: Payload,
}

impl EventRecord {
    /// Start building a new event record with a freshly generated event id
    /// and the current timestamp. `sequence` and `submitted_at` are filled
    /// in at submission.
    pub fn new(event_type: impl Into<String>, entity_key: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            event_version: 1,
            source: String::new(),
            timestamp: Utc::now(),
            entity_key: entity_key.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            saga: SagaMetadata::default(),
            submitted_at: None,
            pipeline_entry_time: None,
            sequence: None,
            payload,
        }
    }

    /// The wait the event spent between submission and pipeline entry.
    pub fn queue_wait(&self) -> Option<chrono::Duration> {
        match (self.submitted_at, self.pipeline_entry_time) {
            (Some(submitted), Some(entered)) => Some(entered - submitted),
            _ => None,
        }
    }

    /// Apply this event to a view record via an update function. Callers
    /// typically go through [`crate::view::ViewUpdater`] rather than calling
    /// this directly.
    pub fn apply_with(&self, updater: &dyn Fn(&Self, Option<&ViewRecord>) -> ViewRecord, current: Option<&ViewRecord>) -> ViewRecord {
        updater(self, current)
    }
}

/// Trait for types whose hash (not full equality) determines grid partition
/// placement.
pub trait PartitionKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    /// The partition hash. All keys with equal `partition_hash` are
    /// co-located, which is what gives ordered per-aggregate replay.
    fn partition_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl PartitionKey for String {}

/// Composite key `(sequence, entity_key)` whose partition hash uses only
/// `entity_key`. This is what co-locates every event for one aggregate on a
/// single pipeline worker and gives ordered replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedSequenceKey<K: PartitionKey = String> {
    /// Monotonically increasing sequence number, unique within a service.
    pub sequence: u64,
    /// The aggregate this sequence belongs to.
    pub entity_key: K,
}

impl<K: PartitionKey> PartitionedSequenceKey<K> {
    /// Build a new partitioned sequence key.
    pub fn new(sequence: u64, entity_key: K) -> Self {
        Self {
            sequence,
            entity_key,
        }
    }

    /// The partition hash used for co-location. Only `entity_key`
    /// contributes, never `sequence`.
    pub fn partition_hash(&self) -> u64 {
        self.entity_key.partition_hash()
    }
}

impl<K: PartitionKey> Hash for PartitionedSequenceKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Partition placement must depend only on entity_key; the sequence
        // still participates in equality/hash-map lookup correctness, but
        // callers that need the partition hash use `partition_hash()`.
        self.sequence.hash(state);
        self.entity_key.hash(state);
    }
}

impl<K: PartitionKey> fmt::Display for PartitionedSequenceKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_key, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_hash_depends_only_on_entity_key() {
        let a = PartitionedSequenceKey::new(1, "order-1".to_string());
        let b = PartitionedSequenceKey::new(42, "order-1".to_string());
        assert_eq!(a.partition_hash(), b.partition_hash());

        let c = PartitionedSequenceKey::new(1, "order-2".to_string());
        assert_ne!(a.partition_hash(), c.partition_hash());
    }

    #[test]
    fn payload_round_trips_through_schema_tag() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct OrderCreated {
            customer: String,
            total_cents: u64,
        }

        let original = OrderCreated {
            customer: "C1".into(),
            total_cents: 1998,
        };
        let payload = Payload::new("OrderCreated.v1", &original).unwrap();
        assert_eq!(payload.schema, "OrderCreated.v1");

        let decoded: OrderCreated = payload.deserialize().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn queue_wait_is_none_until_both_timestamps_present() {
        let mut event = EventRecord::new(
            "Test",
            "k1",
            Payload::new("Test.v1", &serde_json::json!({})).unwrap(),
        );
        assert!(event.queue_wait().is_none());
        event.submitted_at = Some(Utc::now());
        assert!(event.queue_wait().is_none());
        event.pipeline_entry_time = Some(Utc::now());
        assert!(event.queue_wait().is_some());
    }
}
