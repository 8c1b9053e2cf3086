//! The staged pipeline worker pool: turns a submitted event into a
//! persisted, view-folded, published, completed fact.
//!
//! Stages per entry: source -> enrich -> persist -> update_view -> publish
//! -> complete, each timed into `pipeline.stage.duration{stage}`. Entries
//! are routed to a worker by the partition hash of their entity key, so all
//! events for one aggregate flow through one worker in submission order
//! while distinct aggregates process in parallel. A failed stage is retried
//! in place up to a cap, then the entry goes to the DLQ and its completion
//! handle fails.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sagaflow_core::{EventRecord, EventStore, EventStoreBackend, Metrics, PartitionedSequenceKey};
use sagaflow_core::ViewStore;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::completion::{CompletionInfo, CompletionTracker};
use crate::config::PipelineConfig;
use crate::dlq::DeadLetterQueue;
use crate::error::{PipelineError, PipelineResult};
use crate::outbox::Outbox;

/// A pipeline-stage hook that mutates an event before it is persisted, e.g.
/// to stamp derived metadata or look up reference data. Enrichment failures
/// are stage failures, not silently-ignored no-ops.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Mutate `event` in place.
    async fn enrich(&self, event: &mut EventRecord) -> PipelineResult<()>;
}

struct PipelineEntry {
    key: PartitionedSequenceKey,
    event: EventRecord,
}

struct EngineInner<B: EventStoreBackend> {
    event_store: Arc<EventStore<B>>,
    view_store: Arc<ViewStore>,
    outbox: Arc<Outbox>,
    enrichers: Vec<Arc<dyn Enricher>>,
    dlq: Arc<DeadLetterQueue>,
    completions: Arc<CompletionTracker>,
    pending: DashMap<String, EventRecord>,
    metrics: Arc<Metrics>,
    max_stage_retries: u32,
}

impl<B: EventStoreBackend> EngineInner<B> {
    fn update_pending_gauge(&self) {
        self.metrics.set_gauge("pending.events", self.pending.len() as i64);
    }

    async fn run_stages(&self, key: &PartitionedSequenceKey, event: &mut EventRecord) -> PipelineResult<CompletionInfo> {
        // Stage: enrich.
        let started = Instant::now();
        for enricher in &self.enrichers {
            enricher.enrich(event).await.map_err(|e| PipelineError::Stage {
                stage: "enrich".into(),
                event_id: event.event_id.clone(),
                message: e.to_string(),
            })?;
        }
        self.metrics.record_duration("pipeline.stage.duration", &[("stage", "enrich")], started.elapsed());

        // Stage: persist. A duplicate-sequence rejection means an earlier
        // attempt of this same entry already got the append through, so a
        // retry can proceed to the remaining stages.
        let started = Instant::now();
        match self.event_store.append(key.clone(), event.clone()).await {
            Ok(()) => {}
            Err(sagaflow_core::CoreError::DuplicateSequence { .. }) => {
                debug!(key = %key, "event already persisted by an earlier attempt");
            }
            Err(e) => {
                return Err(PipelineError::Stage {
                    stage: "persist".into(),
                    event_id: event.event_id.clone(),
                    message: e.to_string(),
                });
            }
        }
        event.sequence = Some(key.sequence);
        self.metrics.record_duration("pipeline.stage.duration", &[("stage", "persist")], started.elapsed());

        // Stage: update_view.
        let started = Instant::now();
        let view = self.view_store.apply_event(event).await.map_err(|e| PipelineError::Stage {
            stage: "update_view".into(),
            event_id: event.event_id.clone(),
            message: e.to_string(),
        })?;
        self.metrics.record_duration("pipeline.stage.duration", &[("stage", "update_view")], started.elapsed());

        // Stage: publish. Topic-per-event-type; the outbox decouples the
        // pipeline from bus availability.
        let started = Instant::now();
        self.outbox.write(event.clone(), &event.event_type);
        self.metrics.record_duration("pipeline.stage.duration", &[("stage", "publish")], started.elapsed());

        Ok(CompletionInfo {
            key: key.clone(),
            event_id: event.event_id.clone(),
            view,
            completed_at: Utc::now(),
        })
    }

    #[instrument(skip(self, entry), fields(key = %entry.key, event_type = %entry.event.event_type))]
    async fn process(&self, entry: PipelineEntry) {
        let PipelineEntry { key, mut event } = entry;

        // Stage: source.
        event.pipeline_entry_time = Some(Utc::now());
        if let Some(wait) = event.queue_wait() {
            self.metrics.record_duration(
                "pipeline.latency.queue_wait",
                &[],
                wait.to_std().unwrap_or_default(),
            );
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.run_stages(&key, &mut event).await {
                Ok(info) => {
                    // Stage: complete.
                    self.pending.remove(&key.to_string());
                    self.update_pending_gauge();
                    if let Some(submitted) = event.submitted_at {
                        let end_to_end = (Utc::now() - submitted).to_std().unwrap_or_default();
                        self.metrics.record_duration("pipeline.latency.end_to_end", &[], end_to_end);
                    }
                    self.metrics.incr("events.processed");
                    self.completions.resolve_ok(&key, info);
                    return;
                }
                Err(err) => {
                    let stage = match &err {
                        PipelineError::Stage { stage, .. } => stage.clone(),
                        _ => "unknown".to_string(),
                    };
                    self.metrics.incr_tagged("events.failed", &[("stage", &stage)]);
                    if attempt <= self.max_stage_retries && err.is_retryable() {
                        warn!(key = %key, stage = %stage, attempt, error = %err, "pipeline stage failed, retrying entry");
                        continue;
                    }
                    warn!(key = %key, stage = %stage, error = %err, "pipeline entry exhausted retries, routing to dlq");
                    self.pending.remove(&key.to_string());
                    self.update_pending_gauge();
                    self.dlq.add(event.clone(), event.event_type.clone(), format!("pipeline stage '{stage}' failed: {err}"));
                    self.completions.resolve_err(
                        &key,
                        PipelineError::PipelineFailed {
                            key: key.to_string(),
                            stage,
                            message: err.to_string(),
                        },
                    );
                    return;
                }
            }
        }
    }
}

/// The staged pipeline worker pool for one service.
pub struct PipelineEngine<B: EventStoreBackend + 'static> {
    inner: Arc<EngineInner<B>>,
    workers: Vec<mpsc::UnboundedSender<PipelineEntry>>,
}

impl<B: EventStoreBackend + 'static> PipelineEngine<B> {
    /// Start the engine's worker tasks over the given collaborators.
    pub fn start(
        event_store: Arc<EventStore<B>>,
        view_store: Arc<ViewStore>,
        outbox: Arc<Outbox>,
        dlq: Arc<DeadLetterQueue>,
        completions: Arc<CompletionTracker>,
        metrics: Arc<Metrics>,
        config: &PipelineConfig,
        enrichers: Vec<Arc<dyn Enricher>>,
    ) -> Arc<Self> {
        let inner = Arc::new(EngineInner {
            event_store,
            view_store,
            outbox,
            enrichers,
            dlq,
            completions,
            pending: DashMap::new(),
            metrics,
            max_stage_retries: config.max_stage_retries,
        });

        let worker_count = config.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEntry>();
            let inner = inner.clone();
            tokio::spawn(async move {
                debug!(worker_index, "pipeline worker started");
                while let Some(entry) = rx.recv().await {
                    inner.process(entry).await;
                }
                debug!(worker_index, "pipeline worker stopped");
            });
            workers.push(tx);
        }

        Arc::new(Self { inner, workers })
    }

    /// Accept an entry into the pending-events map and hand it to the
    /// worker owning its partition. This write is the sole trigger for
    /// pipeline advancement; entries for one entity key land on one worker
    /// and therefore process in submission order.
    pub fn submit(&self, key: PartitionedSequenceKey, event: EventRecord) -> PipelineResult<()> {
        self.inner.pending.insert(key.to_string(), event.clone());
        self.inner.update_pending_gauge();

        let worker = (key.partition_hash() % self.workers.len() as u64) as usize;
        self.workers[worker]
            .send(PipelineEntry { key: key.clone(), event })
            .map_err(|_| {
                self.inner.pending.remove(&key.to_string());
                self.inner.update_pending_gauge();
                PipelineError::Submission {
                    message: "pipeline workers are shut down".into(),
                }
            })
    }

    /// Number of entries accepted but not yet completed. This is the
    /// backpressure signal: producers outpacing the pipeline show up here
    /// before anywhere else.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

/// No-op enricher, for wiring the stage explicitly in tests.
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, _event: &mut EventRecord) -> PipelineResult<()> {
        Ok(())
    }
}

/// An enricher that always fails, used in tests to exercise stage-failure
/// propagation.
pub struct FailingEnricher {
    /// The stage failure message to report.
    pub message: String,
}

#[async_trait]
impl Enricher for FailingEnricher {
    async fn enrich(&self, event: &mut EventRecord) -> PipelineResult<()> {
        warn!(event_id = %event.event_id, "enricher rejected event");
        Err(PipelineError::Stage {
            stage: "enrich".into(),
            event_id: event.event_id.clone(),
            message: self.message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DlqConfig, OutboxConfig};
    use sagaflow_core::{InMemoryEventStoreBackend, Payload, ViewUpdater};
    use sagaflow_resilience::EventBus;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<PipelineEngine<InMemoryEventStoreBackend>>,
        event_store: Arc<EventStore<InMemoryEventStoreBackend>>,
        completions: Arc<CompletionTracker>,
        dlq: Arc<DeadLetterQueue>,
        metrics: Arc<Metrics>,
    }

    fn fixture(enrichers: Vec<Arc<dyn Enricher>>) -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let event_store = Arc::new(EventStore::new(InMemoryEventStoreBackend::new()));
        let view_store = Arc::new(ViewStore::new(ViewUpdater::new()));
        let bus = Arc::new(EventBus::new());
        let dlq = Arc::new(DeadLetterQueue::new(DlqConfig::default()));
        let outbox = Arc::new(Outbox::new(OutboxConfig::default(), "order-service", bus, dlq.clone(), metrics.clone()));
        let completions = Arc::new(CompletionTracker::new(Duration::from_secs(30), metrics.clone()));
        let engine = PipelineEngine::start(
            event_store.clone(),
            view_store,
            outbox,
            dlq.clone(),
            completions.clone(),
            metrics.clone(),
            &PipelineConfig::default(),
            enrichers,
        );
        Fixture {
            engine,
            event_store,
            completions,
            dlq,
            metrics,
        }
    }

    fn sample_event(entity_key: &str) -> EventRecord {
        let mut event = EventRecord::new(
            "OrderCreated",
            entity_key,
            Payload::new("OrderCreated.v1", &serde_json::json!({"status": "created"})).unwrap(),
        );
        event.submitted_at = Some(Utc::now());
        event
    }

    #[tokio::test]
    async fn submitted_entry_runs_every_stage_and_resolves_its_completion() {
        let f = fixture(Vec::new());
        let key = PartitionedSequenceKey::new(1, "order-1".to_string());
        let handle = f.completions.register(&key);
        f.engine.submit(key.clone(), sample_event("order-1")).unwrap();

        let info = handle.wait().await.unwrap();
        assert_eq!(info.view.fields["status"], "created");
        assert_eq!(f.engine.pending_count(), 0);
        assert_eq!(f.metrics.counter("events.processed"), 1);

        let history = f.event_store.get_for_key("order-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sequence, Some(1));
    }

    #[tokio::test]
    async fn same_key_entries_complete_in_sequence_order() {
        let f = fixture(Vec::new());
        let mut handles = Vec::new();
        for sequence in 1..=5u64 {
            let key = PartitionedSequenceKey::new(sequence, "order-1".to_string());
            handles.push(f.completions.register(&key));
            f.engine.submit(key, sample_event("order-1")).unwrap();
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let history = f.event_store.get_for_key("order-1").await.unwrap();
        let sequences: Vec<u64> = history.iter().filter_map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failing_stage_routes_to_dlq_and_fails_the_completion() {
        let f = fixture(vec![Arc::new(FailingEnricher { message: "rejected".into() })]);
        let key = PartitionedSequenceKey::new(1, "order-1".to_string());
        let handle = f.completions.register(&key);
        f.engine.submit(key, sample_event("order-1")).unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, PipelineError::PipelineFailed { .. }));
        assert_eq!(f.dlq.count(), 1);
        assert!(f.metrics.counter("events.failed{stage=enrich}") >= 1);

        let history = f.event_store.get_for_key("order-1").await.unwrap();
        assert!(history.is_empty());
    }
}
