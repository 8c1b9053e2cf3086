//! Choreographed sagas: the decentralized alternative to the central
//! [`crate::orchestrator::SagaOrchestrator`]. Each service owns a
//! [`ChoreographyListener`] subscribed to the event types it reacts to; a
//! handler drives that service's one step and publishes the next forward
//! event, so the saga advances event by event with no coordinator.
//!
//! Every delivery is deduplicated through the idempotency guard first, and
//! every step executes under the resilience instance named for it. On
//! retry exhaustion the failing listener dead-letters the event and
//! publishes compensating events for the preceding completed steps,
//! consulting the compensation registry for what undoes what and which
//! service owns it. Compensation here rides the bus (unlike the
//! orchestrator's synchronous calls): the failing service cannot reach
//! into its peers, it can only ask them to undo their own work.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sagaflow_core::{EventRecord, Metrics, Payload};
use sagaflow_pipeline::DeadLetterQueue;
use sagaflow_resilience::{BeginOutcome, Envelope, EventBus, IdempotencyGuard, InstanceCallError, ResilienceRegistry, ResilienceResult, Subscriber};
use tracing::{error, info, instrument, warn};

use crate::compensation::CompensationRegistry;
use crate::definition::StepError;
use crate::state_store::{SagaStateStore, SagaStatus, SagaStepRecord, StepStatus};

/// The forward event a step hands back for the listener to publish next.
pub struct NextEvent {
    /// Event type, which is also the destination topic.
    pub event_type: String,
    /// Event body; the listener stamps `event_id` and `saga_id` in.
    pub body: serde_json::Value,
}

/// One service's local step in a choreographed saga, driven by an incoming
/// forward event.
#[async_trait]
pub trait ChoreographyStep: Send + Sync {
    /// Position of this step within the saga, 0-based.
    fn step_number(&self) -> u32;

    /// Step name, used for the resilience instance and state records.
    fn step_name(&self) -> &str;

    /// Execute the local step. `Ok(Some(next))` publishes the next forward
    /// event; `Ok(None)` means this was the saga's last step.
    async fn execute(&self, saga_id: &str, envelope: &Envelope) -> Result<Option<NextEvent>, StepError>;
}

/// Applies a compensating event this service owns (undoing its own earlier
/// forward step).
#[async_trait]
pub trait CompensationApplier: Send + Sync {
    /// Undo the local effect the compensating event describes.
    async fn apply(&self, saga_id: &str, envelope: &Envelope) -> Result<(), StepError>;
}

/// Per-service choreography listener. Register it on the bus against every
/// event type it has a step or a compensation applier for.
pub struct ChoreographyListener {
    service_name: String,
    registry: Arc<CompensationRegistry>,
    bus: Arc<EventBus>,
    state_store: Arc<SagaStateStore>,
    dlq: Arc<DeadLetterQueue>,
    resilience: Arc<ResilienceRegistry>,
    guard: IdempotencyGuard,
    metrics: Arc<Metrics>,
    steps: DashMap<String, Arc<dyn ChoreographyStep>>,
    compensations: DashMap<String, Arc<dyn CompensationApplier>>,
}

impl ChoreographyListener {
    /// A listener for `service_name` with no steps registered yet.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_name: impl Into<String>,
        registry: Arc<CompensationRegistry>,
        bus: Arc<EventBus>,
        state_store: Arc<SagaStateStore>,
        dlq: Arc<DeadLetterQueue>,
        resilience: Arc<ResilienceRegistry>,
        idempotency_ttl: std::time::Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            registry,
            bus,
            state_store,
            dlq,
            resilience,
            guard: IdempotencyGuard::new(idempotency_ttl),
            metrics,
            steps: DashMap::new(),
            compensations: DashMap::new(),
        }
    }

    /// React to `event_type` by driving `step`.
    pub fn on_event(&self, event_type: impl Into<String>, step: Arc<dyn ChoreographyStep>) {
        self.steps.insert(event_type.into(), step);
    }

    /// Apply `compensating_event_type` through `applier`.
    pub fn on_compensation(&self, compensating_event_type: impl Into<String>, applier: Arc<dyn CompensationApplier>) {
        self.compensations.insert(compensating_event_type.into(), applier);
    }

    /// Number of duplicate deliveries this listener has skipped.
    pub fn duplicate_count(&self) -> u64 {
        self.guard.duplicate_count()
    }

    fn stamped_body(saga_id: &str, mut body: serde_json::Value) -> serde_json::Value {
        if let Some(obj) = body.as_object_mut() {
            obj.entry("event_id".to_string())
                .or_insert_with(|| serde_json::Value::String(uuid::Uuid::new_v4().to_string()));
            obj.insert("saga_id".to_string(), serde_json::Value::String(saga_id.to_string()));
        }
        body
    }

    fn dead_letter_event(&self, saga_id: &str, envelope: &Envelope) -> EventRecord {
        // An envelope produced by an outbox carries a full event record;
        // fall back to a synthetic one for hand-built bodies.
        if let Ok(event) = serde_json::from_value::<EventRecord>(envelope.body.clone()) {
            return event;
        }
        let payload = Payload {
            schema: format!("{}.v1", envelope.event_type),
            fields: envelope.body.clone(),
        };
        let mut event = EventRecord::new(&envelope.event_type, saga_id, payload);
        event.source = envelope.source_service.clone();
        event.saga.saga_id = Some(saga_id.to_string());
        event
    }

    #[instrument(skip(self, step, envelope), fields(service = %self.service_name, saga_id = %saga_id, step = %step.step_name()))]
    async fn run_forward_step(&self, saga_id: &str, step: &Arc<dyn ChoreographyStep>, envelope: &Envelope) {
        let instance = self
            .resilience
            .get_or_create(&format!("{}-{}", self.service_name, step.step_name()));
        let record = SagaStepRecord::new(step.step_number(), step.step_name(), &self.service_name, &envelope.event_type);

        let result = instance
            .call(|| step.execute(saga_id, envelope), |e: &StepError| e.is_retryable())
            .await;

        match result {
            Ok(next) => {
                let _ = self
                    .state_store
                    .update_or_add_step(saga_id, record.with_status(StepStatus::Completed));
                let _ = self.state_store.set_current_step(saga_id, step.step_number());
                let _ = self.state_store.set_status(saga_id, SagaStatus::InProgress);
                match next {
                    Some(next) => {
                        let body = Self::stamped_body(saga_id, next.body);
                        let out = Envelope::new(&next.event_type, &self.service_name, &next.event_type, body);
                        if let Err(err) = self.bus.publish(out).await {
                            warn!(error = %err, next_event = %next.event_type, "failed to publish next forward event");
                        }
                    }
                    None => {
                        let _ = self.state_store.complete_saga(saga_id, SagaStatus::Completed);
                        self.metrics.incr("saga.completed");
                        info!(saga_id = %saga_id, "choreographed saga completed");
                    }
                }
            }
            Err(InstanceCallError::CircuitOpen { .. }) => {
                // Nothing was attempted; leave the step pending-retry and
                // let redelivery try again once the breaker settles.
                let _ = self.state_store.update_or_add_step(
                    saga_id,
                    record.with_failure(StepStatus::PendingRetry, "circuit open"),
                );
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(reason = %reason, "choreography step failed, triggering compensation");
                let _ = self
                    .state_store
                    .update_or_add_step(saga_id, record.with_failure(StepStatus::Failed, reason.clone()));
                self.dlq
                    .add(self.dead_letter_event(saga_id, envelope), envelope.event_type.clone(), reason);
                self.publish_compensations(saga_id, step.step_number()).await;
            }
        }
    }

    /// Publish a compensating event for every completed step below
    /// `failed_step`, newest first, per the registry's mapping. Steps whose
    /// forward event type is terminal or unmapped are skipped.
    async fn publish_compensations(&self, saga_id: &str, failed_step: u32) {
        let _ = self.state_store.set_status(saga_id, SagaStatus::Compensating);
        let Some(instance) = self.state_store.get(saga_id) else {
            return;
        };

        let mut completed: Vec<&SagaStepRecord> = instance
            .steps
            .iter()
            .filter(|s| s.step_number < failed_step && s.status == StepStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.step_number.cmp(&a.step_number));

        for record in completed {
            let Some(mapping) = self.registry.compensation_for(&record.event_type) else {
                continue;
            };
            info!(
                saga_id = %saga_id,
                forward = %record.event_type,
                compensating = %mapping.compensating_event_type,
                owner = %mapping.owning_service,
                "requesting compensation"
            );
            let body = Self::stamped_body(
                saga_id,
                serde_json::json!({
                    "forward_event_type": record.event_type,
                    "owning_service": mapping.owning_service,
                    "step_number": record.step_number,
                }),
            );
            let envelope = Envelope::new(
                &mapping.compensating_event_type,
                &self.service_name,
                &mapping.compensating_event_type,
                body,
            );
            if let Err(err) = self.bus.publish(envelope).await {
                warn!(saga_id = %saga_id, error = %err, "failed to publish compensating event");
            }
        }
    }

    async fn run_compensation(&self, saga_id: &str, applier: &Arc<dyn CompensationApplier>, envelope: &Envelope) {
        match applier.apply(saga_id, envelope).await {
            Ok(()) => {
                // Mark the forward step this event undoes as compensated.
                if let Some(forward) = self.registry.forward_for(&envelope.event_type) {
                    if let Some(instance) = self.state_store.get(saga_id) {
                        if let Some(record) = instance.steps.iter().find(|s| s.event_type == forward) {
                            let _ = self
                                .state_store
                                .update_or_add_step(saga_id, record.clone().with_status(StepStatus::Compensated));
                        }
                    }
                }
                // The last applier to finish closes the saga out.
                if let Some(instance) = self.state_store.get(saga_id) {
                    let any_completed = instance.steps.iter().any(|s| s.status == StepStatus::Completed);
                    if !any_completed && instance.status == SagaStatus::Compensating {
                        if let Ok(outcome) = self.state_store.complete_saga(saga_id, SagaStatus::Compensated) {
                            if outcome.transitioned {
                                self.metrics.incr("saga.compensated");
                                info!(saga_id = %saga_id, "choreographed saga compensated");
                            }
                        }
                    }
                }
            }
            Err(e) => {
                // Compensation is never retried; operators triage via DLQ.
                error!(saga_id = %saga_id, event_type = %envelope.event_type, error = %e, "compensation failed");
                self.metrics.incr("saga.compensations_failed");
                self.dlq.add(
                    self.dead_letter_event(saga_id, envelope),
                    envelope.event_type.clone(),
                    format!("compensation failed: {}", e.message),
                );
                let _ = self.state_store.complete_saga(saga_id, SagaStatus::Failed);
            }
        }
    }
}

#[async_trait]
impl Subscriber for ChoreographyListener {
    async fn handle(&self, envelope: &Envelope) -> ResilienceResult<()> {
        let saga_id = envelope
            .body
            .get("saga_id")
            .and_then(|v| v.as_str())
            .or_else(|| {
                envelope
                    .body
                    .get("saga")
                    .and_then(|s| s.get("saga_id"))
                    .and_then(|v| v.as_str())
            })
            .map(str::to_string);
        let Some(saga_id) = saga_id else {
            // Not a saga-linked event; nothing for this listener to drive.
            return Ok(());
        };

        let event_id = envelope
            .body
            .get("event_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if !event_id.is_empty() {
            match self.guard.begin(&event_id) {
                BeginOutcome::Proceed => {}
                BeginOutcome::AlreadyCompleted(()) | BeginOutcome::InFlight => {
                    self.metrics.incr("idempotency.duplicates");
                    return Ok(());
                }
            }
        }

        if let Some(step) = self.steps.get(&envelope.event_type).map(|s| s.value().clone()) {
            self.run_forward_step(&saga_id, &step, envelope).await;
            // A circuit-open rejection releases the claim so redelivery
            // can retry; everything else stays claimed.
            if !event_id.is_empty() {
                let pending_retry = self
                    .state_store
                    .get(&saga_id)
                    .and_then(|i| i.step(step.step_number()).map(|r| r.status == StepStatus::PendingRetry))
                    .unwrap_or(false);
                if pending_retry {
                    self.guard.abandon(&event_id);
                } else {
                    self.guard.complete(&event_id, ());
                }
            }
        } else if let Some(applier) = self.compensations.get(&envelope.event_type).map(|a| a.value().clone()) {
            self.run_compensation(&saga_id, &applier, envelope).await;
            if !event_id.is_empty() {
                self.guard.complete(&event_id, ());
            }
        } else if !event_id.is_empty() {
            // Neither a step nor a compensation for this service; release
            // the claim in case a later registration wants it.
            self.guard.abandon(&event_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::SagaInstance;
    use chrono::Utc;
    use sagaflow_pipeline::DlqConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn registry() -> Arc<CompensationRegistry> {
        Arc::new(
            CompensationRegistry::builder()
                .map("OrderCreated", "OrderCancelled", "order-service")
                .map("InventoryReserved", "InventoryReleased", "inventory-service")
                .terminal("PaymentCaptured")
                .build()
                .unwrap(),
        )
    }

    struct Wiring {
        bus: Arc<EventBus>,
        state_store: Arc<SagaStateStore>,
        dlq: Arc<DeadLetterQueue>,
        resilience: Arc<ResilienceRegistry>,
        metrics: Arc<Metrics>,
    }

    fn wiring() -> Wiring {
        Wiring {
            bus: Arc::new(EventBus::new()),
            state_store: Arc::new(SagaStateStore::new()),
            dlq: Arc::new(DeadLetterQueue::new(DlqConfig::default())),
            resilience: Arc::new(ResilienceRegistry::default()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn listener(w: &Wiring, service: &str) -> Arc<ChoreographyListener> {
        Arc::new(ChoreographyListener::new(
            service,
            registry(),
            w.bus.clone(),
            w.state_store.clone(),
            w.dlq.clone(),
            w.resilience.clone(),
            Duration::from_secs(3600),
            w.metrics.clone(),
        ))
    }

    fn seeded_saga(w: &Wiring, saga_id: &str) {
        w.state_store
            .create(SagaInstance::new(
                saga_id,
                "OrderFulfillment",
                "corr-1",
                3,
                Utc::now() + chrono::Duration::seconds(60),
            ))
            .unwrap();
    }

    struct CountingStep {
        number: u32,
        name: &'static str,
        executions: Arc<AtomicU32>,
        next: Option<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl ChoreographyStep for CountingStep {
        fn step_number(&self) -> u32 {
            self.number
        }
        fn step_name(&self) -> &str {
            self.name
        }
        async fn execute(&self, _saga_id: &str, _envelope: &Envelope) -> Result<Option<NextEvent>, StepError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StepError::business(format!("{} rejected", self.name)));
            }
            Ok(self.next.map(|event_type| NextEvent {
                event_type: event_type.to_string(),
                body: serde_json::json!({}),
            }))
        }
    }

    struct CountingApplier(Arc<AtomicU32>);

    #[async_trait]
    impl CompensationApplier for CountingApplier {
        async fn apply(&self, _saga_id: &str, _envelope: &Envelope) -> Result<(), StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn forward_envelope(event_type: &str, saga_id: &str, event_id: &str) -> Envelope {
        Envelope::new(
            event_type,
            "upstream-service",
            event_type,
            serde_json::json!({"event_id": event_id, "saga_id": saga_id}),
        )
    }

    #[tokio::test]
    async fn forward_step_advances_the_saga_and_publishes_the_next_event() {
        let w = wiring();
        seeded_saga(&w, "saga-1");

        let executions = Arc::new(AtomicU32::new(0));
        let inventory = listener(&w, "inventory-service");
        inventory.on_event(
            "OrderCreated",
            Arc::new(CountingStep {
                number: 1,
                name: "reserve-stock",
                executions: executions.clone(),
                next: Some("InventoryReserved"),
                fail: false,
            }),
        );
        w.bus.subscribe("OrderCreated", inventory.clone());

        let downstream = Arc::new(AtomicU32::new(0));
        let payment = listener(&w, "payment-service");
        payment.on_event(
            "InventoryReserved",
            Arc::new(CountingStep {
                number: 2,
                name: "capture-payment",
                executions: downstream.clone(),
                next: None,
                fail: false,
            }),
        );
        w.bus.subscribe("InventoryReserved", payment.clone());

        w.bus.publish(forward_envelope("OrderCreated", "saga-1", "evt-1")).await.unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(downstream.load(Ordering::SeqCst), 1);
        let instance = w.state_store.get("saga-1").unwrap();
        assert_eq!(instance.status, SagaStatus::Completed);
        assert_eq!(instance.step(1).unwrap().status, StepStatus::Completed);
        assert_eq!(instance.step(2).unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped_and_counted() {
        let w = wiring();
        seeded_saga(&w, "saga-1");

        let executions = Arc::new(AtomicU32::new(0));
        let inventory = listener(&w, "inventory-service");
        inventory.on_event(
            "OrderCreated",
            Arc::new(CountingStep {
                number: 1,
                name: "reserve-stock",
                executions: executions.clone(),
                next: None,
                fail: false,
            }),
        );
        w.bus.subscribe("OrderCreated", inventory.clone());

        w.bus.publish(forward_envelope("OrderCreated", "saga-1", "evt-dup")).await.unwrap();
        w.bus.publish(forward_envelope("OrderCreated", "saga-1", "evt-dup")).await.unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(inventory.duplicate_count(), 1);
        assert_eq!(w.metrics.counter("idempotency.duplicates"), 1);
    }

    #[tokio::test]
    async fn failing_step_dead_letters_and_compensates_preceding_steps() {
        let w = wiring();
        seeded_saga(&w, "saga-1");

        // Step 0 already completed by the order service.
        w.state_store
            .update_or_add_step(
                "saga-1",
                SagaStepRecord::new(0, "create-order", "order-service", "OrderCreated").with_status(StepStatus::Completed),
            )
            .unwrap();

        // The order service can undo its own step.
        let cancels = Arc::new(AtomicU32::new(0));
        let order = listener(&w, "order-service");
        order.on_compensation("OrderCancelled", Arc::new(CountingApplier(cancels.clone())));
        w.bus.subscribe("OrderCancelled", order.clone());

        // The inventory step fails with a business rejection.
        let executions = Arc::new(AtomicU32::new(0));
        let inventory = listener(&w, "inventory-service");
        inventory.on_event(
            "OrderCreated",
            Arc::new(CountingStep {
                number: 1,
                name: "reserve-stock",
                executions,
                next: None,
                fail: true,
            }),
        );
        w.bus.subscribe("OrderCreated", inventory.clone());

        w.bus.publish(forward_envelope("OrderCreated", "saga-1", "evt-1")).await.unwrap();

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(w.dlq.count(), 1);
        let instance = w.state_store.get("saga-1").unwrap();
        assert_eq!(instance.status, SagaStatus::Compensated);
        assert_eq!(instance.step(0).unwrap().status, StepStatus::Compensated);
        assert_eq!(instance.step(1).unwrap().status, StepStatus::Failed);
    }
}
