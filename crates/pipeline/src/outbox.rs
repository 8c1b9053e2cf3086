//! Transactional outbox: bridges pipeline completion and bus publication
//! so a cluster-level bus outage never drops an event that was already
//! durably persisted.
//!
//! Entries move `Pending -> InFlight -> Delivered` (or `Failed` after the
//! retry budget). A claim takes the oldest pending entries first and stamps
//! them with a token; only the holder of a matching token may advance an
//! entry, so a publisher that stalls after claiming cannot race the sweeper
//! that eventually re-queues its stale claims. The contract downstream is
//! at-least-once, unordered.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sagaflow_core::{EventRecord, Metrics};
use sagaflow_resilience::{Envelope, EnvelopeSigner, EventBus};
use tracing::{info, instrument, warn};

use crate::config::OutboxConfig;
use crate::dlq::DeadLetterQueue;
use crate::error::{PipelineError, PipelineResult};

/// Lifecycle state of one outbox entry. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    /// Recorded, not yet claimed for delivery.
    Pending,
    /// Claimed by a publisher; the claim goes stale after
    /// `stale_claim_after`.
    InFlight,
    /// Successfully published.
    Delivered,
    /// Exhausted its retry budget; handed to the DLQ.
    Failed,
}

/// One outbox entry: an event destined for one bus topic.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Unique id for this entry, independent of the wrapped event's id.
    pub id: String,
    /// The event to publish.
    pub event: EventRecord,
    /// Destination topic.
    pub topic: String,
    /// Current lifecycle state.
    pub state: OutboxState,
    /// When this entry was written. Claims take oldest first.
    pub created_at: DateTime<Utc>,
    /// The token the current claim holder must present to transition this
    /// entry; `None` when not claimed.
    pub claim_token: Option<String>,
    /// When the current claim was taken, for stale-claim detection.
    pub claimed_at: Option<Instant>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
}

/// The outbox store plus publisher loop for one service.
pub struct Outbox {
    entries: DashMap<String, RwLock<OutboxEntry>>,
    config: OutboxConfig,
    service_name: String,
    bus: Arc<EventBus>,
    dlq: Arc<DeadLetterQueue>,
    signer: Option<Arc<EnvelopeSigner>>,
    metrics: Arc<Metrics>,
}

impl Outbox {
    /// An outbox publishing on behalf of `service_name` through `bus`,
    /// moving exhausted entries to `dlq`.
    pub fn new(
        config: OutboxConfig,
        service_name: impl Into<String>,
        bus: Arc<EventBus>,
        dlq: Arc<DeadLetterQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            service_name: service_name.into(),
            bus,
            dlq,
            signer: None,
            metrics,
        }
    }

    /// Sign every published envelope with `signer`.
    pub fn with_signer(mut self, signer: Arc<EnvelopeSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Record `event` for publication to `topic`. Returns the new entry's
    /// id. With the outbox disabled the event is published straight to the
    /// bus, fire-and-forget — no durable decoupling from bus outages.
    #[instrument(skip(self, event), fields(topic = %topic))]
    pub fn write(&self, event: EventRecord, topic: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = OutboxEntry {
            id: id.clone(),
            event,
            topic: topic.to_string(),
            state: OutboxState::Pending,
            created_at: Utc::now(),
            claim_token: None,
            claimed_at: None,
            retry_count: 0,
        };

        if !self.config.enabled {
            let envelope = self.envelope_for(&entry);
            let bus = self.bus.clone();
            tokio::spawn(async move {
                if let Err(err) = bus.publish(envelope).await {
                    warn!(error = %err, "direct publish failed with outbox disabled");
                }
            });
            return id;
        }

        self.entries.insert(id.clone(), RwLock::new(entry));
        self.update_pending_gauge();
        id
    }

    fn update_pending_gauge(&self) {
        let pending = self
            .entries
            .iter()
            .filter(|e| e.read().state == OutboxState::Pending)
            .count();
        self.metrics.set_gauge("outbox.pending", pending as i64);
    }

    /// Claim up to `limit` of the oldest pending entries for delivery,
    /// marking them `InFlight` with a fresh claim token.
    pub fn claim_batch(&self, limit: usize) -> Vec<OutboxEntry> {
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .filter(|e| e.read().state == OutboxState::Pending)
            .map(|e| (e.read().created_at, e.key().clone()))
            .collect();
        candidates.sort_by_key(|(created_at, _)| *created_at);

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, id) in candidates.into_iter().take(limit) {
            let Some(entry_ref) = self.entries.get(&id) else { continue };
            let mut entry = entry_ref.write();
            // Re-check under the write lock; a concurrent claimer may have
            // taken it between the scan and here.
            if entry.state == OutboxState::Pending {
                entry.state = OutboxState::InFlight;
                entry.claim_token = Some(uuid::Uuid::new_v4().to_string());
                entry.claimed_at = Some(Instant::now());
                claimed.push(entry.clone());
            }
        }
        claimed
    }

    fn verify_claim(&self, id: &str, token: &str) -> PipelineResult<()> {
        match self.entries.get(id) {
            Some(entry) => {
                let entry = entry.read();
                if entry.state != OutboxState::InFlight || entry.claim_token.as_deref() != Some(token) {
                    return Err(PipelineError::OutboxClaimConflict {
                        entry_id: id.to_string(),
                        reason: "claim token mismatch or entry not in flight".into(),
                    });
                }
                Ok(())
            }
            None => Err(PipelineError::OutboxClaimConflict {
                entry_id: id.to_string(),
                reason: "no such entry".into(),
            }),
        }
    }

    /// Mark a successfully delivered entry. The caller must present the
    /// token it was given by [`Outbox::claim_batch`].
    #[instrument(skip(self))]
    pub fn mark_delivered(&self, id: &str, token: &str) -> PipelineResult<()> {
        self.verify_claim(id, token)?;
        let entry_ref = self.entries.get(id).expect("checked by verify_claim");
        let mut entry = entry_ref.write();
        entry.state = OutboxState::Delivered;
        entry.claim_token = None;
        drop(entry);
        self.metrics.incr("outbox.delivered");
        self.update_pending_gauge();
        Ok(())
    }

    /// Mark a failed delivery attempt. Re-queues for another attempt unless
    /// `max_retries` has been reached, in which case the entry moves to the
    /// DLQ and is marked `Failed`.
    #[instrument(skip(self))]
    pub fn mark_failed(&self, id: &str, token: &str) -> PipelineResult<()> {
        self.verify_claim(id, token)?;
        let exhausted;
        let snapshot;
        {
            let entry_ref = self.entries.get(id).expect("checked by verify_claim");
            let mut entry = entry_ref.write();
            entry.retry_count += 1;
            exhausted = entry.retry_count >= self.config.max_retries;
            if exhausted {
                entry.state = OutboxState::Failed;
            } else {
                entry.state = OutboxState::Pending;
                entry.claim_token = None;
                entry.claimed_at = None;
            }
            snapshot = entry.clone();
        }

        if exhausted {
            warn!(entry_id = %id, retry_count = snapshot.retry_count, "outbox entry exhausted delivery attempts, moving to dlq");
            self.dlq.add(snapshot.event.clone(), snapshot.topic.clone(), "delivery attempts exhausted".to_string());
            self.entries.remove(id);
            self.metrics.incr("outbox.failed");
        }
        self.update_pending_gauge();
        Ok(())
    }

    /// Re-queue entries whose `InFlight` claim has outlived
    /// `stale_claim_after`, so a publisher that crashed after claiming
    /// cannot leave entries stuck forever.
    pub fn sweep_stale_claims(&self) -> usize {
        let now = Instant::now();
        let mut reclaimed = 0;
        for entry_ref in self.entries.iter() {
            let mut entry = entry_ref.write();
            if entry.state == OutboxState::InFlight {
                if let Some(claimed_at) = entry.claimed_at {
                    if now.duration_since(claimed_at) > self.config.stale_claim_after {
                        entry.state = OutboxState::Pending;
                        entry.claim_token = None;
                        entry.claimed_at = None;
                        reclaimed += 1;
                    }
                }
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale outbox claims");
        }
        reclaimed
    }

    fn envelope_for(&self, entry: &OutboxEntry) -> Envelope {
        let body = serde_json::to_value(&entry.event).unwrap_or_else(|_| serde_json::json!({}));
        let mut envelope = Envelope::new(&entry.topic, &self.service_name, &entry.event.event_type, body);
        if let Some(signer) = &self.signer {
            signer.sign(&mut envelope);
        }
        envelope
    }

    /// Run one claim-publish-settle cycle against up to `limit` pending
    /// entries.
    pub async fn run_once(&self, limit: usize) {
        self.sweep_stale_claims();
        let batch = self.claim_batch(limit);
        if batch.is_empty() {
            self.metrics.incr("outbox.poll.empty");
            return;
        }
        for entry in batch {
            let token = entry.claim_token.clone().expect("just claimed");
            let result = self.bus.publish(self.envelope_for(&entry)).await;
            match result {
                Ok(()) => {
                    let _ = self.mark_delivered(&entry.id, &token);
                }
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "outbox publish failed");
                    let _ = self.mark_failed(&entry.id, &token);
                }
            }
        }
    }

    /// Number of entries not yet delivered or failed.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.read().state != OutboxState::Delivered).count()
    }

    /// Spawn the publisher loop, polling every `poll_interval` for up to
    /// `max_batch_size` entries.
    pub fn spawn_publisher_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.poll_interval;
        let batch_size = self.config.max_batch_size;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_once(batch_size).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DlqConfig;
    use sagaflow_core::Payload;
    use sagaflow_resilience::{Envelope, ResilienceResult, Subscriber};
    use std::time::Duration;

    fn sample_event(event_type: &str) -> EventRecord {
        EventRecord::new(event_type, "order-1", Payload::new(format!("{event_type}.v1"), &serde_json::json!({})).unwrap())
    }

    fn fixture() -> (Outbox, Arc<EventBus>, Arc<DeadLetterQueue>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new());
        let dlq = Arc::new(DeadLetterQueue::new(DlqConfig::default()));
        let outbox = Outbox::new(OutboxConfig::default(), "order-service", bus.clone(), dlq.clone(), metrics.clone());
        (outbox, bus, dlq, metrics)
    }

    #[test]
    fn write_then_claim_marks_in_flight() {
        let (outbox, _bus, _dlq, _metrics) = fixture();
        let id = outbox.write(sample_event("OrderCreated"), "OrderCreated");
        let claimed = outbox.claim_batch(10);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].state, OutboxState::InFlight);

        let second_claim = outbox.claim_batch(10);
        assert!(second_claim.is_empty());
    }

    #[test]
    fn claims_take_the_oldest_entries_first() {
        let (outbox, _bus, _dlq, _metrics) = fixture();
        let first = outbox.write(sample_event("OrderCreated"), "OrderCreated");
        // Force distinct created_at ordering without sleeping.
        for entry in outbox.entries.iter() {
            if entry.key() != &first {
                continue;
            }
            entry.write().created_at = Utc::now() - chrono::Duration::seconds(60);
        }
        let _second = outbox.write(sample_event("OrderPaid"), "OrderPaid");

        let claimed = outbox.claim_batch(1);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first);
    }

    #[test]
    fn mark_delivered_requires_matching_token() {
        let (outbox, _bus, _dlq, _metrics) = fixture();
        let id = outbox.write(sample_event("OrderCreated"), "OrderCreated");
        let claimed = outbox.claim_batch(10);
        let token = claimed[0].claim_token.clone().unwrap();

        let err = outbox.mark_delivered(&id, "wrong-token").unwrap_err();
        assert!(matches!(err, PipelineError::OutboxClaimConflict { .. }));

        outbox.mark_delivered(&id, &token).unwrap();
        assert_eq!(outbox.pending_count(), 0);
    }

    #[test]
    fn mark_failed_requeues_until_retries_exhausted_then_moves_to_dlq() {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new());
        let dlq = Arc::new(DeadLetterQueue::new(DlqConfig::default()));
        let config = OutboxConfig { max_retries: 2, ..Default::default() };
        let outbox = Outbox::new(config, "order-service", bus, dlq.clone(), metrics);

        let id = outbox.write(sample_event("OrderCreated"), "OrderCreated");
        for _ in 0..2 {
            let claimed = outbox.claim_batch(10);
            let token = claimed[0].claim_token.clone().unwrap();
            outbox.mark_failed(&id, &token).unwrap();
        }
        assert_eq!(dlq.count(), 1);
        assert!(outbox.claim_batch(10).is_empty());
    }

    #[test]
    fn stale_claims_are_reclaimed() {
        let (outbox, _bus, _dlq, _metrics) = fixture();
        outbox.write(sample_event("OrderCreated"), "OrderCreated");
        outbox.claim_batch(10);

        // Force the claim to look stale without waiting out a real ttl.
        for entry_ref in outbox.entries.iter() {
            entry_ref.write().claimed_at = Some(Instant::now() - Duration::from_secs(3600));
        }
        let reclaimed = outbox.sweep_stale_claims();
        assert_eq!(reclaimed, 1);
        assert_eq!(outbox.claim_batch(10).len(), 1);
    }

    #[tokio::test]
    async fn run_once_delivers_an_enveloped_event_to_the_topic() {
        let (outbox, bus, _dlq, _metrics) = fixture();
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Recorder(Arc<std::sync::Mutex<Vec<Envelope>>>);
        #[async_trait::async_trait]
        impl Subscriber for Recorder {
            async fn handle(&self, e: &Envelope) -> ResilienceResult<()> {
                self.0.lock().unwrap().push(e.clone());
                Ok(())
            }
        }
        bus.subscribe("OrderCreated", Arc::new(Recorder(received.clone())));

        outbox.write(sample_event("OrderCreated"), "OrderCreated");
        outbox.run_once(10).await;
        assert_eq!(outbox.pending_count(), 0);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].source_service, "order-service");
        assert_eq!(received[0].event_type, "OrderCreated");
    }

    #[tokio::test]
    async fn disabled_outbox_publishes_directly_to_the_bus() {
        struct Recorder(Arc<std::sync::Mutex<Vec<Envelope>>>);
        #[async_trait::async_trait]
        impl Subscriber for Recorder {
            async fn handle(&self, e: &Envelope) -> ResilienceResult<()> {
                self.0.lock().unwrap().push(e.clone());
                Ok(())
            }
        }

        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new());
        let dlq = Arc::new(DeadLetterQueue::new(DlqConfig::default()));
        let outbox = Outbox::new(
            OutboxConfig {
                enabled: false,
                ..Default::default()
            },
            "order-service",
            bus.clone(),
            dlq,
            metrics,
        );

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        bus.subscribe("OrderCreated", Arc::new(Recorder(received.clone())));

        outbox.write(sample_event("OrderCreated"), "OrderCreated");
        // The direct path publishes on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(outbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn empty_poll_is_counted() {
        let (outbox, _bus, _dlq, metrics) = fixture();
        outbox.run_once(10).await;
        assert_eq!(metrics.counter("outbox.poll.empty"), 1);
    }
}
