//! Saga state store: durable bookkeeping for running and completed sagas,
//! queryable by status or correlation id, and able to find sagas past
//! their deadline.
//!
//! Terminal statuses are sticky: once a saga is completed, compensated,
//! failed or timed out, no further transition is accepted, and
//! `completed_at` is set exactly once on first entry to a terminal state.
//! That stickiness is what makes the orchestrator and the timeout detector
//! safe to race each other on the same saga.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::instrument;

use crate::error::{SagaEngineError, SagaEngineResult};

/// Lifecycle status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SagaStatus {
    /// Persisted, first step not yet running.
    Started,
    /// Forward steps are executing.
    InProgress,
    /// All forward steps completed.
    Completed,
    /// A step failed; compensation is running in reverse order.
    Compensating,
    /// Compensation finished successfully.
    Compensated,
    /// A step or its compensation failed unrecoverably.
    Failed,
    /// The saga's deadline passed before it reached another terminal
    /// state.
    TimedOut,
}

impl SagaStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed | SagaStatus::TimedOut
        )
    }
}

/// Status of one step within a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StepStatus {
    /// Not yet executed.
    Pending,
    /// Rejected by an open circuit; will be re-attempted.
    PendingRetry,
    /// Forward action succeeded.
    Completed,
    /// Forward action failed (or timed out) past its retry budget.
    Failed,
    /// Skipped during compensation because the step declares none.
    Skipped,
    /// Compensation for this step ran successfully.
    Compensated,
}

/// Per-step bookkeeping within a saga instance. Owned by value inside
/// [`SagaInstance`]; never shared across instances.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SagaStepRecord {
    /// Position within the definition, 0-based.
    pub step_number: u32,
    /// Step name, matching the definition's step name.
    pub step_name: String,
    /// The service the step executes against.
    pub service: String,
    /// The event type the step's forward action produces.
    pub event_type: String,
    /// Current status.
    pub status: StepStatus,
    /// When this record was last updated.
    pub timestamp: DateTime<Utc>,
    /// Most recent failure message, if any.
    pub failure_reason: Option<String>,
}

impl SagaStepRecord {
    /// A fresh, pending step record.
    pub fn new(step_number: u32, step_name: impl Into<String>, service: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            step_number,
            step_name: step_name.into(),
            service: service.into(),
            event_type: event_type.into(),
            status: StepStatus::Pending,
            timestamp: Utc::now(),
            failure_reason: None,
        }
    }

    /// This record with `status` and a refreshed timestamp.
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self.timestamp = Utc::now();
        self
    }

    /// This record with `status`, a failure reason, and a refreshed
    /// timestamp.
    pub fn with_failure(mut self, status: StepStatus, reason: impl Into<String>) -> Self {
        self.status = status;
        self.failure_reason = Some(reason.into());
        self.timestamp = Utc::now();
        self
    }
}

/// One saga's durable state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SagaInstance {
    /// Unique saga id.
    pub saga_id: String,
    /// Name of the saga definition this instance runs.
    pub saga_type: String,
    /// Current status.
    pub status: SagaStatus,
    /// When this instance was persisted.
    pub started_at: DateTime<Utc>,
    /// Set exactly once, on first entry to a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Correlates this saga to the business request that triggered it.
    pub correlation_id: String,
    /// Index of the step currently executing (or last touched).
    pub current_step: u32,
    /// Number of steps in the definition.
    pub total_steps: u32,
    /// Absolute wall-clock deadline; past it the timeout detector acts.
    pub deadline: DateTime<Utc>,
    /// Per-step bookkeeping, in definition order.
    pub steps: Vec<SagaStepRecord>,
}

impl SagaInstance {
    /// A new instance in `Started`, with no step records yet.
    pub fn new(
        saga_id: impl Into<String>,
        saga_type: impl Into<String>,
        correlation_id: impl Into<String>,
        total_steps: u32,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id: saga_id.into(),
            saga_type: saga_type.into(),
            status: SagaStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            correlation_id: correlation_id.into(),
            current_step: 0,
            total_steps,
            deadline,
            steps: Vec::new(),
        }
    }

    /// The record for step `step_number`, if one has been written.
    pub fn step(&self, step_number: u32) -> Option<&SagaStepRecord> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }
}

/// Outcome of [`SagaStateStore::complete_saga`].
#[derive(Debug, Clone)]
pub struct CompleteOutcome {
    /// Whether this call performed the terminal transition. `false` means
    /// the saga was already terminal and `instance` is the pre-existing
    /// state, unchanged.
    pub transitioned: bool,
    /// The saga's state after the call.
    pub instance: SagaInstance,
}

/// Durable, query-capable saga instance store. Every mutation goes through
/// a per-saga lock, so concurrent writers to the same saga serialize and
/// writers to different sagas never contend.
pub struct SagaStateStore {
    instances: DashMap<String, RwLock<SagaInstance>>,
}

impl SagaStateStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Register a new saga instance. Errors if the id is already in use.
    pub fn create(&self, instance: SagaInstance) -> SagaEngineResult<()> {
        if self.instances.contains_key(&instance.saga_id) {
            return Err(SagaEngineError::AlreadyExecuting(instance.saga_id));
        }
        self.instances.insert(instance.saga_id.clone(), RwLock::new(instance));
        Ok(())
    }

    /// Current state of a saga instance.
    pub fn get(&self, saga_id: &str) -> Option<SagaInstance> {
        self.instances.get(saga_id).map(|i| i.read().clone())
    }

    /// Replace the step record matching `step.step_number` (or append it if
    /// new).
    #[instrument(skip(self, step), fields(saga_id = %saga_id, step_number = step.step_number, status = ?step.status))]
    pub fn update_or_add_step(&self, saga_id: &str, step: SagaStepRecord) -> SagaEngineResult<()> {
        let entry = self
            .instances
            .get(saga_id)
            .ok_or_else(|| SagaEngineError::NotFound(saga_id.to_string()))?;
        let mut instance = entry.write();
        match instance.steps.iter_mut().find(|s| s.step_number == step.step_number) {
            Some(existing) => *existing = step,
            None => {
                instance.steps.push(step);
                instance.steps.sort_by_key(|s| s.step_number);
            }
        }
        Ok(())
    }

    /// Record which step is currently executing.
    pub fn set_current_step(&self, saga_id: &str, step_number: u32) -> SagaEngineResult<()> {
        let entry = self
            .instances
            .get(saga_id)
            .ok_or_else(|| SagaEngineError::NotFound(saga_id.to_string()))?;
        entry.write().current_step = step_number;
        Ok(())
    }

    /// Transition a saga to a non-terminal `status`. A saga already in a
    /// terminal state is left untouched (duplicate signals are expected
    /// under at-least-once delivery).
    #[instrument(skip(self), fields(saga_id = %saga_id, status = ?status))]
    pub fn set_status(&self, saga_id: &str, status: SagaStatus) -> SagaEngineResult<()> {
        debug_assert!(!status.is_terminal(), "terminal transitions go through complete_saga");
        let entry = self
            .instances
            .get(saga_id)
            .ok_or_else(|| SagaEngineError::NotFound(saga_id.to_string()))?;
        let mut instance = entry.write();
        if instance.status.is_terminal() {
            return Ok(());
        }
        instance.status = status;
        Ok(())
    }

    /// Idempotently finalize a saga: the transition (and the one-time
    /// `completed_at` stamp) happens only if the saga is still
    /// non-terminal. If it is already terminal, the existing state is
    /// returned unchanged with `transitioned = false` — concurrent
    /// finalizers (orchestrator, timeout detector, duplicate deliveries)
    /// all converge on exactly one observed transition.
    #[instrument(skip(self), fields(saga_id = %saga_id, status = ?terminal_status))]
    pub fn complete_saga(&self, saga_id: &str, terminal_status: SagaStatus) -> SagaEngineResult<CompleteOutcome> {
        if !terminal_status.is_terminal() {
            return Err(SagaEngineError::InvalidTransition {
                saga_id: saga_id.to_string(),
                status: format!("{terminal_status:?}"),
            });
        }
        let entry = self
            .instances
            .get(saga_id)
            .ok_or_else(|| SagaEngineError::NotFound(saga_id.to_string()))?;
        let mut instance = entry.write();
        if instance.status.is_terminal() {
            return Ok(CompleteOutcome {
                transitioned: false,
                instance: instance.clone(),
            });
        }
        instance.status = terminal_status;
        instance.completed_at = Some(Utc::now());
        Ok(CompleteOutcome {
            transitioned: true,
            instance: instance.clone(),
        })
    }

    /// Up to `limit` instances currently in `status`.
    pub fn get_by_status(&self, status: SagaStatus, limit: usize) -> Vec<SagaInstance> {
        self.instances
            .iter()
            .map(|e| e.read().clone())
            .filter(|i| i.status == status)
            .take(limit)
            .collect()
    }

    /// All instances sharing `correlation_id`.
    pub fn get_by_correlation_id(&self, correlation_id: &str) -> Vec<SagaInstance> {
        self.instances
            .iter()
            .map(|e| e.read().clone())
            .filter(|i| i.correlation_id == correlation_id)
            .collect()
    }

    /// Up to `limit` non-terminal instances whose deadline has passed, for
    /// the timeout detector to act on. Only `Started`, `InProgress` and
    /// `Compensating` sagas qualify.
    pub fn find_timed_out(&self, limit: usize) -> Vec<SagaInstance> {
        let now = Utc::now();
        self.instances
            .iter()
            .map(|e| e.read().clone())
            .filter(|i| {
                matches!(i.status, SagaStatus::Started | SagaStatus::InProgress | SagaStatus::Compensating)
                    && i.deadline < now
            })
            .take(limit)
            .collect()
    }

    /// Number of sagas not yet in a terminal state, the
    /// `sagas.active.count` gauge.
    pub fn active_count(&self) -> usize {
        self.instances.iter().filter(|e| !e.read().status.is_terminal()).count()
    }
}

impl Default for SagaStateStore {
    fn default() -> Self {
        Self::new()
    }
}
