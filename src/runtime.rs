//! Per-service runtime assembly: one service's event store, view store,
//! outbox, DLQ, completion tracker, sequence generator and controller,
//! wired together against the shared bus.
//!
//! This is the composition root for a single service. The demo family in
//! [`crate::domain`] builds four of these against one bus; a real
//! deployment would build one per process.

use std::sync::Arc;

use sagaflow_core::{
    EventRecord, EventStore, EventStoreBackend, InMemoryEventStoreBackend, Metrics, PersistenceBackend, SagaMetadata,
    ViewStore, ViewUpdater, ViewWriteBehind, WriteBehindEventStoreBackend,
};
use sagaflow_pipeline::{
    CompletionInfo, CompletionTracker, DeadLetterQueue, EventSourcingController, InMemorySequenceSource, Outbox,
    PipelineEngine, PipelineResult, SequenceGenerator,
};
use sagaflow_resilience::EventBus;
use tracing::info;

use crate::SagaflowConfig;

/// One service's fully wired pipeline stack.
pub struct ServiceRuntime<B: EventStoreBackend + 'static> {
    /// The service's name, stamped onto every event it submits.
    pub service_name: String,
    /// The append-only journal.
    pub event_store: Arc<EventStore<B>>,
    /// The materialized views.
    pub view_store: Arc<ViewStore>,
    /// The transactional outbox.
    pub outbox: Arc<Outbox>,
    /// The dead letter queue.
    pub dlq: Arc<DeadLetterQueue>,
    /// Pending/completed submission tracking.
    pub completions: Arc<CompletionTracker>,
    /// The submission entry point.
    pub controller: EventSourcingController<B>,
    /// The shared metrics registry.
    pub metrics: Arc<Metrics>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl ServiceRuntime<InMemoryEventStoreBackend> {
    /// Assemble a purely in-memory runtime for `service_name` against the
    /// shared `bus`.
    pub fn in_memory(
        service_name: &str,
        bus: Arc<EventBus>,
        updater: ViewUpdater,
        config: &SagaflowConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let event_store = Arc::new(EventStore::new(InMemoryEventStoreBackend::new()));
        let view_store = Arc::new(ViewStore::new(updater));
        let sequences = Arc::new(SequenceGenerator::new(Arc::new(InMemorySequenceSource::new())));
        Self::assemble(service_name, bus, event_store, view_store, sequences, config, metrics)
    }
}

impl ServiceRuntime<WriteBehindEventStoreBackend> {
    /// Assemble a runtime whose journal and views front `durable` through
    /// write-behind caches. The sequence generator resumes above the
    /// highest persisted id, and views warm eagerly when configured to.
    pub async fn with_persistence(
        service_name: &str,
        bus: Arc<EventBus>,
        updater: ViewUpdater,
        durable: Arc<dyn PersistenceBackend>,
        config: &SagaflowConfig,
        metrics: Arc<Metrics>,
    ) -> sagaflow_core::CoreResult<Self> {
        let backend = Arc::new(WriteBehindEventStoreBackend::new(
            durable.clone(),
            config.persistence.write_behind.clone(),
            config.event_store_eviction.clone(),
            metrics.clone(),
        ));
        let flush_handle = backend.spawn_flush_loop();
        let event_store = Arc::new(EventStore::from_shared(backend));

        let view_wb = Arc::new(ViewWriteBehind::new(
            format!("{service_name}_VIEW"),
            durable.clone(),
            config.persistence.write_behind.clone(),
            metrics.clone(),
        ));
        let view_flush_handle = view_wb.spawn_flush_loop();
        let view_store = Arc::new(
            ViewStore::with_write_behind(updater, view_wb).with_eviction(config.view_store_eviction.clone()),
        );
        let view_sweep_handle = view_store.spawn_idle_sweep(config.persistence.write_behind.write_delay);
        if config.persistence.initial_load_mode == sagaflow_core::InitialLoadMode::Eager {
            let warmed = view_store.warm().await?;
            info!(service = %service_name, warmed, "eagerly hydrated view store from durable backing");
        }

        let last_used = event_store.max_sequence().await?;
        let sequences = Arc::new(SequenceGenerator::new(Arc::new(InMemorySequenceSource::starting_after(last_used))));

        let mut runtime = Self::assemble(service_name, bus, event_store, view_store, sequences, config, metrics);
        runtime.background.push(flush_handle);
        runtime.background.push(view_flush_handle);
        runtime.background.push(view_sweep_handle);
        Ok(runtime)
    }
}

impl<B: EventStoreBackend + 'static> ServiceRuntime<B> {
    fn assemble(
        service_name: &str,
        bus: Arc<EventBus>,
        event_store: Arc<EventStore<B>>,
        view_store: Arc<ViewStore>,
        sequences: Arc<SequenceGenerator>,
        config: &SagaflowConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq.clone()));
        let outbox = Arc::new(Outbox::new(
            config.outbox.clone(),
            service_name,
            bus,
            dlq.clone(),
            metrics.clone(),
        ));
        let completions = Arc::new(CompletionTracker::new(
            config.pipeline.pending_completion_timeout,
            metrics.clone(),
        ));
        let engine = PipelineEngine::start(
            event_store.clone(),
            view_store.clone(),
            outbox.clone(),
            dlq.clone(),
            completions.clone(),
            metrics.clone(),
            &config.pipeline,
            Vec::new(),
        );
        let controller = EventSourcingController::new(
            service_name,
            engine,
            sequences,
            completions.clone(),
            metrics.clone(),
        );
        Self {
            service_name: service_name.to_string(),
            event_store,
            view_store,
            outbox,
            dlq,
            completions,
            controller,
            metrics,
            background: Vec::new(),
        }
    }

    /// Start the outbox publisher and completion sweep loops.
    pub fn spawn_background_loops(&mut self) {
        info!(service = %self.service_name, "starting outbox publisher and completion sweep");
        self.background.push(self.outbox.clone().spawn_publisher_loop());
        self.background.push(self.completions.spawn_sweep_loop());
    }

    /// Submit `event` and wait for the pipeline to complete it.
    pub async fn submit(
        &self,
        event: EventRecord,
        correlation_id: Option<String>,
        saga: Option<SagaMetadata>,
    ) -> PipelineResult<CompletionInfo> {
        let handle = self.controller.handle_event(event, correlation_id, saga).await?;
        handle.wait().await
    }

    /// Drain the outbox once, for deterministic tests and demos that do
    /// not run the publisher loop.
    pub async fn drain_outbox(&self) {
        let batch = self.outbox.pending_count().max(1);
        self.outbox.run_once(batch).await;
    }
}

impl<B: EventStoreBackend + 'static> Drop for ServiceRuntime<B> {
    fn drop(&mut self) {
        for handle in &self.background {
            handle.abort();
        }
    }
}
