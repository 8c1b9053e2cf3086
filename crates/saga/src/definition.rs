//! Saga step and definition types, plus the context bag carrying data
//! between steps.
//!
//! A step's failure carries a classification tag rather than being a bare
//! message: business rejections (insufficient stock, payment declined) must
//! never burn retry budget, and a circuit-open rejection is its own case
//! because nothing was actually attempted. The orchestrator branches on the
//! tag, not on string matching.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Thread-safe key/value bag carrying data between saga steps. Each step
/// may read what earlier steps published and publish results of its own.
#[derive(Clone, Default)]
pub struct SagaContext {
    values: Arc<DashMap<String, serde_json::Value>>,
}

impl SagaContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any earlier value.
    pub fn put(&self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(json) = serde_json::to_value(value) {
            self.values.insert(key.into(), json);
        }
    }

    /// The raw JSON value under `key`.
    pub fn get_raw(&self, key: &str) -> Option<serde_json::Value> {
        self.values.get(key).map(|v| v.clone())
    }

    /// The value under `key`, deserialized into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_raw(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Merge every field of a JSON object into the context. Non-object
    /// values are ignored.
    pub fn merge(&self, data: serde_json::Value) {
        if let serde_json::Value::Object(map) = data {
            for (k, v) in map {
                self.values.insert(k, v);
            }
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How a step failure should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    /// A transient fault; retrying may succeed.
    Transient,
    /// A business rejection; retrying can never succeed.
    Business,
    /// The guarding circuit rejected the call without attempting it; the
    /// step is pending-retry, not failed.
    CircuitOpen,
}

/// A classified step failure.
#[derive(Debug, Clone)]
pub struct StepError {
    /// Retry classification.
    pub kind: StepErrorKind,
    /// Human-readable reason.
    pub message: String,
}

impl StepError {
    /// A transient, retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A business rejection: fails the step immediately, no retry.
    pub fn business(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Business,
            message: message.into(),
        }
    }

    /// A circuit-open rejection: the downstream was never contacted.
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::CircuitOpen,
            message: message.into(),
        }
    }

    /// Whether the retry machinery should re-attempt after this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind == StepErrorKind::Transient
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// One forward/compensating unit of work within a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name, used for logging and state-store bookkeeping.
    fn name(&self) -> &str;

    /// The service this step executes against.
    fn service(&self) -> &str {
        ""
    }

    /// The event type this step's forward action produces.
    fn event_type(&self) -> &str {
        ""
    }

    /// Run the forward action. Returned JSON object fields are merged into
    /// the saga context for later steps.
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value, StepError>;

    /// Whether this step declares a compensation at all. Steps without one
    /// are skipped during rollback, without fault.
    fn has_compensation(&self) -> bool {
        true
    }

    /// Undo this step's effect.
    async fn compensate(&self, _ctx: &SagaContext) -> Result<(), StepError> {
        Ok(())
    }

    /// How long one execution attempt may run before it is treated as
    /// timed out.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Retry attempts allowed after the first failure.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Wait between retry attempts.
    fn retry_delay(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// An ordered saga: a name, the steps to run forward (compensated in
/// reverse on failure), and an overall deadline. Built fluently at startup
/// and immutable afterwards.
pub struct SagaDefinition {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
    saga_timeout: Duration,
}

impl SagaDefinition {
    /// A saga definition named `name` with a 60-second overall timeout and
    /// no steps yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            saga_timeout: Duration::from_secs(60),
        }
    }

    /// Override the overall saga timeout.
    pub fn with_timeout(mut self, saga_timeout: Duration) -> Self {
        self.saga_timeout = saga_timeout;
        self
    }

    /// Append a step, executed after every step already added.
    pub fn add_step<S: SagaStep + 'static>(mut self, step: S) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Append an already-shared step.
    pub fn add_step_arc(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// The saga's name (its `saga_type`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The overall saga timeout.
    pub fn saga_timeout(&self) -> Duration {
        self.saga_timeout
    }

    /// The steps, in execution order.
    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }
}
