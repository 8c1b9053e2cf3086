//! Saga timeout detector: a periodic sweep that finds sagas past their
//! absolute deadline and forces them to `TimedOut`, so a crashed or wedged
//! orchestrator node cannot leave a saga running forever.
//!
//! One node never runs two sweeps at once (a local atomic flag guards
//! overlap); across nodes, safety rests entirely on `complete_saga` being
//! idempotent — whichever finalizer gets there first wins, and everyone
//! else observes `transitioned = false` and stands down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sagaflow_core::Metrics;
use sagaflow_resilience::{Envelope, EventBus};
use tracing::{info, instrument, warn};

use crate::state_store::{SagaInstance, SagaStateStore, SagaStatus};

/// Topic the detector publishes timeout notifications on.
pub const SAGA_TIMED_OUT_TOPIC: &str = "saga.timed-out";

/// Sweep cadence and scope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TimeoutDetectorConfig {
    /// Whether the sweep runs at all.
    pub enabled: bool,
    /// How often the sweep runs.
    #[serde(with = "humantime_duration")]
    pub check_interval: Duration,
    /// Most sagas acted on per sweep cycle.
    pub max_batch_size: usize,
    /// Whether a timed-out saga's compensation is launched by the
    /// detector (through the registered handler) or left to an operator.
    pub auto_compensate: bool,
}

impl Default for TimeoutDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(5),
            max_batch_size: 100,
            auto_compensate: false,
        }
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Launches compensation for a saga the detector just timed out. The
/// detector itself has no access to step implementations; whoever owns the
/// definitions registers a handler.
#[async_trait]
pub trait TimedOutSagaHandler: Send + Sync {
    /// Compensate the (already terminal) `instance`.
    async fn compensate(&self, instance: &SagaInstance);
}

/// Periodically forces overdue sagas to `TimedOut`.
pub struct TimeoutDetector {
    state_store: Arc<SagaStateStore>,
    config: TimeoutDetectorConfig,
    sweeping: AtomicBool,
    bus: Option<Arc<EventBus>>,
    handler: Option<Arc<dyn TimedOutSagaHandler>>,
    metrics: Arc<Metrics>,
}

impl TimeoutDetector {
    /// A detector sweeping `state_store` on `config`'s schedule.
    pub fn new(state_store: Arc<SagaStateStore>, config: TimeoutDetectorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            state_store,
            config,
            sweeping: AtomicBool::new(false),
            bus: None,
            handler: None,
            metrics,
        }
    }

    /// Publish a notification for every timed-out saga on `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Launch compensation through `handler` when `auto_compensate` is
    /// enabled.
    pub fn with_handler(mut self, handler: Arc<dyn TimedOutSagaHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Run one sweep cycle, returning the ids of sagas this cycle timed
    /// out. A cycle already running on this node makes this a no-op.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Vec<String> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let timed_out = self.sweep_inner().await;
        self.sweeping.store(false, Ordering::Release);
        timed_out
    }

    async fn sweep_inner(&self) -> Vec<String> {
        let overdue = self.state_store.find_timed_out(self.config.max_batch_size);
        let mut acted = Vec::new();

        for instance in overdue {
            let outcome = match self.state_store.complete_saga(&instance.saga_id, SagaStatus::TimedOut) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(saga_id = %instance.saga_id, error = %err, "failed to finalize timed-out saga");
                    continue;
                }
            };
            if !outcome.transitioned {
                // Another finalizer (the orchestrator, or a detector on a
                // different node) got there first.
                continue;
            }

            warn!(saga_id = %instance.saga_id, saga_type = %instance.saga_type, "saga exceeded its deadline, marked timed out");
            self.metrics.incr("saga.timedout");
            acted.push(instance.saga_id.clone());

            if let Some(bus) = &self.bus {
                let envelope = Envelope::new(
                    SAGA_TIMED_OUT_TOPIC,
                    "saga-timeout-detector",
                    "SagaTimedOut",
                    serde_json::json!({
                        "saga_id": outcome.instance.saga_id,
                        "saga_type": outcome.instance.saga_type,
                        "correlation_id": outcome.instance.correlation_id,
                        "deadline": outcome.instance.deadline,
                    }),
                );
                if let Err(err) = bus.publish(envelope).await {
                    warn!(saga_id = %outcome.instance.saga_id, error = %err, "failed to publish saga timeout notification");
                }
            }

            if self.config.auto_compensate {
                if let Some(handler) = &self.handler {
                    handler.compensate(&outcome.instance).await;
                }
            }
        }

        self.metrics.set_gauge("sagas.active.count", self.state_store.active_count() as i64);
        if !acted.is_empty() {
            info!(count = acted.len(), "timeout sweep finalized overdue sagas");
        }
        acted
    }

    /// Spawn the background sweep loop. Returns `None` with the detector
    /// disabled.
    pub fn spawn_sweep_loop(detector: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !detector.config.enabled {
            return None;
        }
        let interval = detector.config.check_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                detector.sweep_once().await;
            }
        }))
    }
}
