//! Dead letter queue: terminal store for events that exhausted their
//! delivery or processing retries, with a capped manual replay path.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sagaflow_core::EventRecord;
use tracing::{info, instrument};

use crate::config::DlqConfig;
use crate::error::{PipelineError, PipelineResult};

/// One dead-lettered event.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    /// Unique id for this entry.
    pub id: String,
    /// The id of the event that could not be delivered.
    pub original_event_id: String,
    /// The event's type tag.
    pub event_type: String,
    /// The topic it was destined for.
    pub topic: String,
    /// The full event, kept for replay.
    pub event: EventRecord,
    /// Why it landed here.
    pub failure_reason: String,
    /// The service that produced the event.
    pub source_service: String,
    /// The saga the event belonged to, if any.
    pub saga_id: Option<String>,
    /// When the entry was first dead-lettered.
    pub first_failure_at: DateTime<Utc>,
    /// How many times this entry has been replayed.
    pub replay_attempts: u32,
}

/// Dead letter queue: list/count/fetch/replay/discard over entries that
/// exhausted their retries.
pub struct DeadLetterQueue {
    entries: DashMap<String, RwLock<DlqEntry>>,
    config: DlqConfig,
}

impl DeadLetterQueue {
    /// A DLQ enforcing `config.max_replay_attempts`.
    pub fn new(config: DlqConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Record a new dead-lettered entry, returning its id. With the DLQ
    /// disabled the entry is dropped (logged only) and an empty id
    /// returned.
    #[instrument(skip(self, event), fields(topic = %topic, reason = %reason))]
    pub fn add(&self, event: EventRecord, topic: String, reason: String) -> String {
        if !self.config.enabled {
            info!(event_id = %event.event_id, "dlq disabled, dropping exhausted event");
            return String::new();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.insert(
            id.clone(),
            RwLock::new(DlqEntry {
                id: id.clone(),
                original_event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                topic,
                failure_reason: reason,
                source_service: event.source.clone(),
                saga_id: event.saga.saga_id.clone(),
                first_failure_at: Utc::now(),
                replay_attempts: 0,
                event,
            }),
        );
        id
    }

    /// All current entries.
    pub fn list(&self) -> Vec<DlqEntry> {
        self.entries.iter().map(|e| e.read().clone()).collect()
    }

    /// Number of entries currently held.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Fetch one entry by id.
    pub fn fetch(&self, id: &str) -> Option<DlqEntry> {
        self.entries.get(id).map(|e| e.read().clone())
    }

    /// Replay an entry: returns the event and its original topic for the
    /// caller to re-enqueue onto the outbox, incrementing the replay
    /// counter. Fails once `max_replay_attempts` is reached so a
    /// permanently poisoned message cannot loop forever.
    #[instrument(skip(self))]
    pub fn replay(&self, id: &str) -> PipelineResult<(EventRecord, String)> {
        let entry_ref = self
            .entries
            .get(id)
            .ok_or_else(|| PipelineError::DlqEntryNotFound(id.to_string()))?;
        let mut entry = entry_ref.write();
        if entry.replay_attempts >= self.config.max_replay_attempts {
            return Err(PipelineError::ReplayCapExceeded {
                entry_id: id.to_string(),
                cap: self.config.max_replay_attempts,
            });
        }
        entry.replay_attempts += 1;
        info!(entry_id = %id, replay_attempts = entry.replay_attempts, "replaying dlq entry");
        Ok((entry.event.clone(), entry.topic.clone()))
    }

    /// Permanently remove an entry without replaying it.
    pub fn discard(&self, id: &str) -> PipelineResult<()> {
        self.entries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PipelineError::DlqEntryNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::Payload;

    fn sample_event() -> EventRecord {
        let mut e = EventRecord::new("OrderCreated", "order-1", Payload::new("OrderCreated.v1", &serde_json::json!({})).unwrap());
        e.source = "order-service".into();
        e.saga.saga_id = Some("saga-1".into());
        e
    }

    #[test]
    fn add_captures_the_event_envelope_fields() {
        let dlq = DeadLetterQueue::new(DlqConfig::default());
        let id = dlq.add(sample_event(), "OrderCreated".into(), "boom".into());
        let entry = dlq.fetch(&id).unwrap();
        assert_eq!(entry.event_type, "OrderCreated");
        assert_eq!(entry.source_service, "order-service");
        assert_eq!(entry.saga_id.as_deref(), Some("saga-1"));
        assert_eq!(entry.failure_reason, "boom");
        assert_eq!(dlq.count(), 1);
        assert_eq!(dlq.list().len(), 1);
    }

    #[test]
    fn replay_increments_counter_and_stops_at_cap() {
        let dlq = DeadLetterQueue::new(DlqConfig {
            enabled: true,
            max_replay_attempts: 2,
        });
        let id = dlq.add(sample_event(), "OrderCreated".into(), "boom".into());

        dlq.replay(&id).unwrap();
        dlq.replay(&id).unwrap();
        let err = dlq.replay(&id).unwrap_err();
        assert!(matches!(err, PipelineError::ReplayCapExceeded { .. }));
    }

    #[test]
    fn discard_removes_entry() {
        let dlq = DeadLetterQueue::new(DlqConfig::default());
        let id = dlq.add(sample_event(), "OrderCreated".into(), "boom".into());
        dlq.discard(&id).unwrap();
        assert_eq!(dlq.count(), 0);
        assert!(matches!(dlq.discard(&id), Err(PipelineError::DlqEntryNotFound(_))));
    }

    #[test]
    fn disabled_dlq_drops_entries() {
        let dlq = DeadLetterQueue::new(DlqConfig {
            enabled: false,
            max_replay_attempts: 3,
        });
        let id = dlq.add(sample_event(), "OrderCreated".into(), "boom".into());
        assert!(id.is_empty());
        assert_eq!(dlq.count(), 0);
    }
}
