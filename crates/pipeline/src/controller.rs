//! The event sourcing controller: the public entry point that accepts a
//! domain event, assigns its sequence, registers a completion future, and
//! hands the entry to the pipeline.
//!
//! Anything that fails before the entry reaches the pending-events map is a
//! submission error surfaced synchronously to the caller; from that point
//! on, the caller learns the outcome only through its
//! [`CompletionHandle`].

use std::sync::Arc;

use chrono::Utc;
use sagaflow_core::{EventRecord, EventStoreBackend, Metrics, PartitionedSequenceKey, SagaMetadata};
use tracing::instrument;

use crate::completion::{CompletionHandle, CompletionTracker};
use crate::engine::PipelineEngine;
use crate::error::PipelineResult;
use crate::sequence::SequenceGenerator;

/// Accepts events and dispatches them into the pipeline, returning a
/// completion future per submission.
pub struct EventSourcingController<B: EventStoreBackend + 'static> {
    engine: Arc<PipelineEngine<B>>,
    sequences: Arc<SequenceGenerator>,
    completions: Arc<CompletionTracker>,
    service_name: String,
    metrics: Arc<Metrics>,
}

impl<B: EventStoreBackend + 'static> EventSourcingController<B> {
    /// A controller submitting on behalf of `service_name`.
    pub fn new(
        service_name: impl Into<String>,
        engine: Arc<PipelineEngine<B>>,
        sequences: Arc<SequenceGenerator>,
        completions: Arc<CompletionTracker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            sequences,
            completions,
            service_name: service_name.into(),
            metrics,
        }
    }

    /// Accept `event` into the pipeline:
    ///
    /// 1. stamp `submitted_at`, `source`, the correlation id and any saga
    ///    linkage,
    /// 2. assign the next sequence id,
    /// 3. register a pending completion keyed by the resulting
    ///    `(sequence, entity_key)`,
    /// 4. write the entry into the pending-events map, which is what
    ///    triggers pipeline advancement.
    ///
    /// Failures in steps 2-4 are returned synchronously; the event never
    /// entered the pipeline. After that, the returned handle is the only
    /// way to observe the outcome.
    #[instrument(skip(self, event, saga), fields(event_type = %event.event_type, entity_key = %event.entity_key))]
    pub async fn handle_event(
        &self,
        mut event: EventRecord,
        correlation_id: Option<String>,
        saga: Option<SagaMetadata>,
    ) -> PipelineResult<CompletionHandle> {
        event.submitted_at = Some(Utc::now());
        event.source = self.service_name.clone();
        if let Some(correlation_id) = correlation_id {
            event.correlation_id = correlation_id;
        }
        if let Some(saga) = saga {
            event.saga = saga;
        }

        let sequence = self.sequences.next().await?;
        let key = PartitionedSequenceKey::new(sequence, event.entity_key.clone());
        let event_type = event.event_type.clone();

        let handle = self.completions.register(&key);
        if let Err(err) = self.engine.submit(key, event) {
            // The entry never reached the pending-events map; clean up the
            // registration so the sweep doesn't count it as orphaned.
            handle.cancel();
            return Err(err);
        }

        self.metrics
            .incr_tagged("events.submitted", &[("eventType", &event_type), ("domain", &self.service_name)]);
        Ok(handle)
    }

    /// Number of entries accepted but not yet completed.
    pub fn pending_events(&self) -> usize {
        self.engine.pending_count()
    }

    /// Number of completion futures still outstanding.
    pub fn pending_completions(&self) -> usize {
        self.completions.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionTracker;
    use crate::config::{DlqConfig, OutboxConfig, PipelineConfig};
    use crate::dlq::DeadLetterQueue;
    use crate::outbox::Outbox;
    use crate::sequence::{FailingSequenceSource, InMemorySequenceSource};
    use sagaflow_core::{EventStore, InMemoryEventStoreBackend, Payload, ViewStore, ViewUpdater};
    use sagaflow_resilience::EventBus;
    use std::time::Duration;

    struct Fixture {
        controller: EventSourcingController<InMemoryEventStoreBackend>,
        metrics: Arc<Metrics>,
    }

    fn fixture(sequences: Arc<SequenceGenerator>) -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let event_store = Arc::new(EventStore::new(InMemoryEventStoreBackend::new()));
        let view_store = Arc::new(ViewStore::new(ViewUpdater::new()));
        let bus = Arc::new(EventBus::new());
        let dlq = Arc::new(DeadLetterQueue::new(DlqConfig::default()));
        let outbox = Arc::new(Outbox::new(OutboxConfig::default(), "order-service", bus, dlq.clone(), metrics.clone()));
        let completions = Arc::new(CompletionTracker::new(Duration::from_secs(30), metrics.clone()));
        let engine = PipelineEngine::start(
            event_store,
            view_store,
            outbox,
            dlq,
            completions.clone(),
            metrics.clone(),
            &PipelineConfig::default(),
            Vec::new(),
        );
        Fixture {
            controller: EventSourcingController::new("order-service", engine, sequences, completions, metrics.clone()),
            metrics,
        }
    }

    fn sample_event() -> EventRecord {
        EventRecord::new("OrderCreated", "order-1", Payload::new("OrderCreated.v1", &serde_json::json!({})).unwrap())
    }

    #[tokio::test]
    async fn handle_event_stamps_metadata_and_completes() {
        let f = fixture(Arc::new(SequenceGenerator::new(Arc::new(InMemorySequenceSource::new()))));
        let handle = f
            .controller
            .handle_event(sample_event(), Some("corr-1".into()), None)
            .await
            .unwrap();

        let info = handle.wait().await.unwrap();
        assert_eq!(info.key.sequence, 1);
        assert_eq!(f.controller.pending_events(), 0);
        assert_eq!(f.controller.pending_completions(), 0);
        assert_eq!(f.metrics.counter("events.submitted{eventType=OrderCreated,domain=order-service}"), 1);
    }

    #[tokio::test]
    async fn saga_metadata_rides_along_on_the_event() {
        let f = fixture(Arc::new(SequenceGenerator::new(Arc::new(InMemorySequenceSource::new()))));
        let saga = SagaMetadata {
            saga_id: Some("saga-1".into()),
            saga_type: Some("OrderFulfillment".into()),
            step_number: Some(2),
            is_compensating: false,
        };
        let handle = f
            .controller
            .handle_event(sample_event(), None, Some(saga))
            .await
            .unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn sequence_exhaustion_fails_synchronously_before_the_pipeline() {
        let f = fixture(Arc::new(SequenceGenerator::new(Arc::new(FailingSequenceSource))));
        let result = f.controller.handle_event(sample_event(), None, None).await;
        assert!(result.is_err());
        assert_eq!(f.controller.pending_events(), 0);
        assert_eq!(f.controller.pending_completions(), 0);
        assert_eq!(f.metrics.counter("events.submitted{eventType=OrderCreated,domain=order-service}"), 0);
    }
}
