//! Saga orchestrator: centralized state-machine execution of a
//! [`SagaDefinition`], with per-step timeout and retry, reverse-order
//! compensation on failure, an overall saga deadline, and listener
//! lifecycle callbacks.
//!
//! The orchestrator drives steps synchronously (each step's result decides
//! the next transition), persists every transition through the
//! [`SagaStateStore`], and finalizes through the idempotent
//! `complete_saga`, so a timeout detector racing it on the same saga can
//! never produce a second terminal transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sagaflow_core::{EventRecord, Metrics, Payload};
use sagaflow_pipeline::DeadLetterQueue;
use sagaflow_resilience::IdempotencyGuard;
use tracing::{error, info, instrument, warn};

use crate::definition::{SagaContext, SagaDefinition, StepErrorKind};
use crate::error::SagaEngineResult;
use crate::state_store::{SagaInstance, SagaStateStore, SagaStatus, SagaStepRecord, StepStatus};

/// Lifecycle callbacks fired as a saga progresses. All methods have no-op
/// defaults so a listener can implement only what it needs.
#[async_trait]
pub trait SagaListener: Send + Sync {
    /// The saga was persisted and is about to execute.
    async fn on_saga_started(&self, _saga: &SagaInstance) {}
    /// A forward step is about to execute.
    async fn on_step_started(&self, _saga_id: &str, _step_name: &str) {}
    /// A forward step completed.
    async fn on_step_completed(&self, _saga_id: &str, _step_name: &str) {}
    /// A forward step failed past its retry budget.
    async fn on_step_failed(&self, _saga_id: &str, _step_name: &str, _reason: &str) {}
    /// All forward steps completed.
    async fn on_saga_completed(&self, _saga_id: &str) {}
    /// Compensation finished successfully.
    async fn on_saga_compensated(&self, _saga_id: &str) {}
    /// The saga ended `Failed` (a compensation itself failed).
    async fn on_saga_failed(&self, _saga_id: &str, _reason: &str) {}
    /// The saga's overall deadline fired.
    async fn on_saga_timed_out(&self, _saga_id: &str) {}
}

/// What [`SagaOrchestrator::start`] resolves with once the saga reaches a
/// terminal state.
#[derive(Clone)]
pub struct OrchestratorResult {
    /// The saga instance id.
    pub saga_id: String,
    /// The terminal status the saga ended in.
    pub status: SagaStatus,
    /// The context as the saga left it.
    pub context: SagaContext,
}

struct StepFailure {
    index: usize,
    reason: String,
}

/// Orchestrates [`SagaDefinition`] executions against a [`SagaStateStore`].
pub struct SagaOrchestrator {
    state_store: Arc<SagaStateStore>,
    listeners: Vec<Arc<dyn SagaListener>>,
    dlq: Option<Arc<DeadLetterQueue>>,
    metrics: Arc<Metrics>,
    start_guard: IdempotencyGuard,
    fail_fast_on_circuit_open: bool,
}

impl SagaOrchestrator {
    /// An orchestrator persisting to `state_store`.
    pub fn new(state_store: Arc<SagaStateStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            state_store,
            listeners: Vec::new(),
            dlq: None,
            metrics,
            start_guard: IdempotencyGuard::new(Duration::from_secs(3600)),
            fail_fast_on_circuit_open: false,
        }
    }

    /// Register a listener, notified of every saga this orchestrator runs.
    pub fn add_listener(&mut self, listener: Arc<dyn SagaListener>) {
        self.listeners.push(listener);
    }

    /// Write failed compensations to `dlq` for operator triage.
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Treat a circuit-open rejection as a step failure (compensating
    /// immediately) instead of waiting out the breaker under the saga
    /// deadline.
    pub fn with_fail_fast_on_circuit_open(mut self, fail_fast: bool) -> Self {
        self.fail_fast_on_circuit_open = fail_fast;
        self
    }

    /// Execute `definition` under a fresh saga id.
    pub async fn start(
        &self,
        definition: &SagaDefinition,
        context: SagaContext,
        correlation_id: &str,
    ) -> SagaEngineResult<OrchestratorResult> {
        let saga_id = uuid::Uuid::new_v4().to_string();
        self.start_with_id(&saga_id, definition, context, correlation_id).await
    }

    /// Execute `definition` under a caller-supplied saga id. A duplicate
    /// delivery of the same start request (same id, within the dedup TTL)
    /// is rejected without executing anything.
    #[instrument(skip(self, definition, context), fields(saga_id = %saga_id, saga_type = %definition.name()))]
    pub async fn start_with_id(
        &self,
        saga_id: &str,
        definition: &SagaDefinition,
        context: SagaContext,
        correlation_id: &str,
    ) -> SagaEngineResult<OrchestratorResult> {
        if !self.start_guard.try_process(&format!("saga-start:{saga_id}")) {
            return Err(crate::error::SagaEngineError::AlreadyExecuting(saga_id.to_string()));
        }
        context.put("saga_id", saga_id);
        context.put("correlation_id", correlation_id);

        let deadline = Utc::now()
            + chrono::Duration::from_std(definition.saga_timeout()).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let instance = SagaInstance::new(
            saga_id,
            definition.name(),
            correlation_id,
            definition.steps().len() as u32,
            deadline,
        );
        self.state_store.create(instance.clone())?;
        for (index, step) in definition.steps().iter().enumerate() {
            self.state_store.update_or_add_step(
                saga_id,
                SagaStepRecord::new(index as u32, step.name(), step.service(), step.event_type()),
            )?;
        }
        self.metrics.incr("saga.started");
        self.update_active_gauge();
        for listener in &self.listeners {
            listener.on_saga_started(&instance).await;
        }

        let saga_started = Instant::now();
        let outcome = tokio::time::timeout(
            definition.saga_timeout(),
            self.run_forward(saga_id, definition, &context),
        )
        .await;

        let status = match outcome {
            Ok(Ok(())) => {
                self.state_store.complete_saga(saga_id, SagaStatus::Completed)?;
                self.metrics.incr("saga.completed");
                for listener in &self.listeners {
                    listener.on_saga_completed(saga_id).await;
                }
                info!(saga_id = %saga_id, "saga completed");
                SagaStatus::Completed
            }
            Ok(Err(failure)) => {
                let all_compensated = self
                    .compensate_completed_steps(saga_id, definition, failure.index, &context, true)
                    .await;
                let terminal = if all_compensated {
                    SagaStatus::Compensated
                } else {
                    SagaStatus::Failed
                };
                self.state_store.complete_saga(saga_id, terminal)?;
                match terminal {
                    SagaStatus::Compensated => {
                        self.metrics.incr("saga.compensated");
                        for listener in &self.listeners {
                            listener.on_saga_compensated(saga_id).await;
                        }
                    }
                    _ => {
                        self.metrics.incr("saga.failed");
                        for listener in &self.listeners {
                            listener.on_saga_failed(saga_id, &failure.reason).await;
                        }
                    }
                }
                terminal
            }
            Err(_) => {
                // The overall deadline fired while a step was still
                // running; that step's late result is discarded. Finalize
                // first so a racing timeout detector no-ops, then unwind
                // what had completed.
                let completed = self.state_store.complete_saga(saga_id, SagaStatus::TimedOut)?;
                if completed.transitioned {
                    warn!(saga_id = %saga_id, "saga exceeded its overall deadline");
                    self.metrics.incr("saga.timedout");
                    for listener in &self.listeners {
                        listener.on_saga_timed_out(saga_id).await;
                    }
                }
                self.compensate_completed_steps(saga_id, definition, definition.steps().len(), &context, false)
                    .await;
                SagaStatus::TimedOut
            }
        };

        self.metrics
            .record_duration("saga.duration", &[("sagaType", definition.name())], saga_started.elapsed());
        self.update_active_gauge();
        Ok(OrchestratorResult {
            saga_id: saga_id.to_string(),
            status,
            context,
        })
    }

    fn update_active_gauge(&self) {
        self.metrics.set_gauge("sagas.active.count", self.state_store.active_count() as i64);
    }

    async fn run_forward(
        &self,
        saga_id: &str,
        definition: &SagaDefinition,
        context: &SagaContext,
    ) -> Result<(), StepFailure> {
        let record_for = |index: usize, step: &Arc<dyn crate::definition::SagaStep>| {
            SagaStepRecord::new(index as u32, step.name(), step.service(), step.event_type())
        };

        for (index, step) in definition.steps().iter().enumerate() {
            let _ = self.state_store.set_current_step(saga_id, index as u32);
            let _ = self.state_store.set_status(saga_id, SagaStatus::InProgress);
            for listener in &self.listeners {
                listener.on_step_started(saga_id, step.name()).await;
            }

            let step_started = Instant::now();
            let mut attempts = 0u32;
            loop {
                match tokio::time::timeout(step.timeout(), step.execute(context)).await {
                    Ok(Ok(data)) => {
                        context.merge(data);
                        let _ = self
                            .state_store
                            .update_or_add_step(saga_id, record_for(index, step).with_status(StepStatus::Completed));
                        self.metrics.record_duration(
                            "saga.step.duration",
                            &[("sagaType", definition.name()), ("stepName", step.name())],
                            step_started.elapsed(),
                        );
                        for listener in &self.listeners {
                            listener.on_step_completed(saga_id, step.name()).await;
                        }
                        break;
                    }
                    Ok(Err(e)) if e.kind == StepErrorKind::CircuitOpen && !self.fail_fast_on_circuit_open => {
                        // Nothing was attempted downstream. Wait out the
                        // breaker under the saga deadline rather than
                        // compensating a healthy saga.
                        warn!(saga_id = %saga_id, step = %step.name(), "step rejected by open circuit, pending retry");
                        let _ = self.state_store.update_or_add_step(
                            saga_id,
                            record_for(index, step).with_failure(StepStatus::PendingRetry, e.message.clone()),
                        );
                        tokio::time::sleep(step.retry_delay()).await;
                    }
                    Ok(Err(e)) if e.is_retryable() && attempts < step.max_retries() => {
                        attempts += 1;
                        warn!(saga_id = %saga_id, step = %step.name(), attempt = attempts, error = %e, "step failed, retrying");
                        tokio::time::sleep(step.retry_delay()).await;
                    }
                    Ok(Err(e)) => {
                        warn!(saga_id = %saga_id, step = %step.name(), error = %e, "step failed, entering compensation");
                        let _ = self.state_store.update_or_add_step(
                            saga_id,
                            record_for(index, step).with_failure(StepStatus::Failed, e.message.clone()),
                        );
                        for listener in &self.listeners {
                            listener.on_step_failed(saga_id, step.name(), &e.message).await;
                        }
                        return Err(StepFailure {
                            index,
                            reason: e.message,
                        });
                    }
                    Err(_) if attempts < step.max_retries() => {
                        attempts += 1;
                        warn!(saga_id = %saga_id, step = %step.name(), attempt = attempts, "step timed out, retrying");
                    }
                    Err(_) => {
                        let reason = format!("step timed out after {:?}", step.timeout());
                        warn!(saga_id = %saga_id, step = %step.name(), "step timed out, entering compensation");
                        let _ = self
                            .state_store
                            .update_or_add_step(saga_id, record_for(index, step).with_failure(StepStatus::Failed, reason.clone()));
                        for listener in &self.listeners {
                            listener.on_step_failed(saga_id, step.name(), &reason).await;
                        }
                        return Err(StepFailure { index, reason });
                    }
                }
            }
        }
        Ok(())
    }

    /// Compensate completed steps below `upto_index`, in reverse order.
    /// Steps without a declared compensation are marked skipped without
    /// fault. A failing compensation is logged, counted and dead-lettered,
    /// and the unwind continues; compensation is never itself compensated
    /// or retried. Returns whether every attempted compensation succeeded.
    async fn compensate_completed_steps(
        &self,
        saga_id: &str,
        definition: &SagaDefinition,
        upto_index: usize,
        context: &SagaContext,
        mark_compensating: bool,
    ) -> bool {
        if mark_compensating {
            let _ = self.state_store.set_status(saga_id, SagaStatus::Compensating);
        }
        let Some(instance) = self.state_store.get(saga_id) else {
            return false;
        };

        let mut all_ok = true;
        for index in (0..upto_index.min(definition.steps().len())).rev() {
            let completed = instance
                .step(index as u32)
                .map(|r| r.status == StepStatus::Completed)
                .unwrap_or(false);
            if !completed {
                continue;
            }
            let step = &definition.steps()[index];
            let record = SagaStepRecord::new(index as u32, step.name(), step.service(), step.event_type());

            if !step.has_compensation() {
                let _ = self
                    .state_store
                    .update_or_add_step(saga_id, record.with_status(StepStatus::Skipped));
                continue;
            }

            match tokio::time::timeout(step.timeout(), step.compensate(context)).await {
                Ok(Ok(())) => {
                    info!(saga_id = %saga_id, step = %step.name(), "compensated step");
                    let _ = self
                        .state_store
                        .update_or_add_step(saga_id, record.with_status(StepStatus::Compensated));
                }
                outcome => {
                    all_ok = false;
                    let reason = match outcome {
                        Ok(Err(e)) => format!("compensation failed: {}", e.message),
                        _ => format!("compensation failed: timed out after {:?}", step.timeout()),
                    };
                    error!(saga_id = %saga_id, step = %step.name(), reason = %reason, "compensation failed");
                    self.metrics.incr("saga.compensations_failed");
                    let _ = self
                        .state_store
                        .update_or_add_step(saga_id, record.with_failure(StepStatus::Failed, reason.clone()));
                    if let Some(dlq) = &self.dlq {
                        dlq.add(self.compensation_failure_event(saga_id, definition, step.as_ref()), step.event_type().to_string(), reason);
                    }
                }
            }
        }
        all_ok
    }

    fn compensation_failure_event(
        &self,
        saga_id: &str,
        definition: &SagaDefinition,
        step: &dyn crate::definition::SagaStep,
    ) -> EventRecord {
        let payload = Payload {
            schema: "SagaCompensationFailed.v1".into(),
            fields: serde_json::json!({
                "saga_id": saga_id,
                "saga_type": definition.name(),
                "step_name": step.name(),
            }),
        };
        let mut event = EventRecord::new("SagaCompensationFailed", saga_id, payload);
        event.source = step.service().to_string();
        event.saga.saga_id = Some(saga_id.to_string());
        event.saga.saga_type = Some(definition.name().to_string());
        event.saga.is_compensating = true;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{SagaStep, StepError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingStep {
        name: &'static str,
        behavior: Behavior,
        compensated: Arc<Mutex<Vec<String>>>,
        executions: Arc<AtomicU32>,
    }

    enum Behavior {
        Succeed,
        FailBusiness,
        Hang,
    }

    impl RecordingStep {
        fn new(name: &'static str, behavior: Behavior, compensated: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                behavior,
                compensated,
                executions: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl SagaStep for RecordingStep {
        fn name(&self) -> &str {
            self.name
        }
        fn service(&self) -> &str {
            "test-service"
        }
        async fn execute(&self, _ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(serde_json::json!({ self.name: "done" })),
                Behavior::FailBusiness => Err(StepError::business(format!("{} rejected", self.name))),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(serde_json::Value::Null)
                }
            }
        }
        async fn compensate(&self, _ctx: &SagaContext) -> Result<(), StepError> {
            self.compensated.lock().unwrap().push(self.name.to_string());
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
        fn retry_delay(&self) -> Duration {
            Duration::from_millis(1)
        }
    }

    fn orchestrator() -> (SagaOrchestrator, Arc<SagaStateStore>, Arc<Metrics>) {
        let store = Arc::new(SagaStateStore::new());
        let metrics = Arc::new(Metrics::new());
        (SagaOrchestrator::new(store.clone(), metrics.clone()), store, metrics)
    }

    #[tokio::test]
    async fn happy_path_completes_every_step_and_fills_context() {
        let (orch, store, metrics) = orchestrator();
        let compensated = Arc::new(Mutex::new(Vec::new()));
        let definition = SagaDefinition::new("OrderFulfillment")
            .add_step(RecordingStep::new("reserve", Behavior::Succeed, compensated.clone()))
            .add_step(RecordingStep::new("charge", Behavior::Succeed, compensated.clone()));

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert_eq!(result.context.get::<String>("reserve").unwrap(), "done");

        let instance = store.get(&result.saga_id).unwrap();
        assert_eq!(instance.status, SagaStatus::Completed);
        assert!(instance.completed_at.is_some());
        assert!(instance.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(compensated.lock().unwrap().is_empty());
        assert_eq!(metrics.counter("saga.completed"), 1);
    }

    #[tokio::test]
    async fn empty_definition_completes_immediately() {
        let (orch, store, _metrics) = orchestrator();
        let definition = SagaDefinition::new("Noop");
        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert_eq!(store.get(&result.saga_id).unwrap().total_steps, 0);
    }

    #[tokio::test]
    async fn failed_step_compensates_prior_steps_in_reverse_order() {
        let (orch, store, metrics) = orchestrator();
        let compensated = Arc::new(Mutex::new(Vec::new()));
        let definition = SagaDefinition::new("OrderFulfillment")
            .add_step(RecordingStep::new("reserve", Behavior::Succeed, compensated.clone()))
            .add_step(RecordingStep::new("charge", Behavior::Succeed, compensated.clone()))
            .add_step(RecordingStep::new("ship", Behavior::FailBusiness, compensated.clone()));

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(*compensated.lock().unwrap(), vec!["charge".to_string(), "reserve".to_string()]);

        let instance = store.get(&result.saga_id).unwrap();
        assert_eq!(instance.step(2).unwrap().status, StepStatus::Failed);
        assert_eq!(instance.step(1).unwrap().status, StepStatus::Compensated);
        assert_eq!(instance.step(0).unwrap().status, StepStatus::Compensated);
        assert_eq!(metrics.counter("saga.compensated"), 1);
    }

    #[tokio::test]
    async fn business_rejection_is_not_retried() {
        let (orch, _store, _metrics) = orchestrator();
        let compensated = Arc::new(Mutex::new(Vec::new()));
        let failing = RecordingStep::new("reserve", Behavior::FailBusiness, compensated);
        let executions = failing.executions.clone();
        let definition = SagaDefinition::new("OrderFulfillment").add_step(failing);

        orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_up_to_the_step_budget() {
        struct RetriedStep {
            executions: Arc<AtomicU32>,
        }
        #[async_trait]
        impl SagaStep for RetriedStep {
            fn name(&self) -> &str {
                "flaky"
            }
            async fn execute(&self, _ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
                if self.executions.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StepError::transient("flake"))
                } else {
                    Ok(serde_json::Value::Null)
                }
            }
            fn max_retries(&self) -> u32 {
                3
            }
            fn retry_delay(&self) -> Duration {
                Duration::from_millis(1)
            }
        }

        let (orch, _store, _metrics) = orchestrator();
        let executions = Arc::new(AtomicU32::new(0));
        let definition = SagaDefinition::new("OrderFulfillment").add_step(RetriedStep {
            executions: executions.clone(),
        });

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hung_step_times_out_and_the_saga_compensates() {
        let (orch, store, _metrics) = orchestrator();
        let compensated = Arc::new(Mutex::new(Vec::new()));
        let definition = SagaDefinition::new("OrderFulfillment")
            .add_step(RecordingStep::new("reserve", Behavior::Succeed, compensated.clone()))
            .add_step(RecordingStep::new("charge", Behavior::Hang, compensated.clone()));

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(*compensated.lock().unwrap(), vec!["reserve".to_string()]);

        let charge = store.get(&result.saga_id).unwrap();
        assert!(charge.step(1).unwrap().failure_reason.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn saga_deadline_beats_a_generous_step_timeout() {
        struct SlowStep;
        #[async_trait]
        impl SagaStep for SlowStep {
            fn name(&self) -> &str {
                "slow"
            }
            async fn execute(&self, _ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(serde_json::Value::Null)
            }
            fn timeout(&self) -> Duration {
                // Step-level timeout equal to the saga-level one: the
                // saga-level termination must win.
                Duration::from_millis(100)
            }
        }

        let (orch, store, metrics) = orchestrator();
        let definition = SagaDefinition::new("OrderFulfillment")
            .with_timeout(Duration::from_millis(100))
            .add_step(SlowStep);

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::TimedOut);
        assert_eq!(store.get(&result.saga_id).unwrap().status, SagaStatus::TimedOut);
        assert_eq!(metrics.counter("saga.timedout"), 1);
    }

    #[tokio::test]
    async fn steps_without_compensation_are_skipped_without_fault() {
        struct NoCompStep;
        #[async_trait]
        impl SagaStep for NoCompStep {
            fn name(&self) -> &str {
                "notify"
            }
            async fn execute(&self, _ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
                Ok(serde_json::Value::Null)
            }
            fn has_compensation(&self) -> bool {
                false
            }
        }

        let (orch, store, _metrics) = orchestrator();
        let compensated = Arc::new(Mutex::new(Vec::new()));
        let definition = SagaDefinition::new("OrderFulfillment")
            .add_step(NoCompStep)
            .add_step(RecordingStep::new("charge", Behavior::FailBusiness, compensated));

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(store.get(&result.saga_id).unwrap().step(0).unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn failing_compensation_marks_the_saga_failed_and_keeps_unwinding() {
        struct BadCompStep {
            compensated: Arc<Mutex<Vec<String>>>,
        }
        #[async_trait]
        impl SagaStep for BadCompStep {
            fn name(&self) -> &str {
                "reserve"
            }
            async fn execute(&self, _ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
                Ok(serde_json::Value::Null)
            }
            async fn compensate(&self, _ctx: &SagaContext) -> Result<(), StepError> {
                self.compensated.lock().unwrap().push("reserve(failed)".into());
                Err(StepError::transient("release failed"))
            }
        }

        let (orch, _store, metrics) = orchestrator();
        let compensated = Arc::new(Mutex::new(Vec::new()));
        let definition = SagaDefinition::new("OrderFulfillment")
            .add_step(RecordingStep::new("create", Behavior::Succeed, compensated.clone()))
            .add_step(BadCompStep {
                compensated: compensated.clone(),
            })
            .add_step(RecordingStep::new("charge", Behavior::FailBusiness, compensated.clone()));

        let result = orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();
        assert_eq!(result.status, SagaStatus::Failed);
        // The unwind continued past the failing compensation down to step 0.
        assert_eq!(
            *compensated.lock().unwrap(),
            vec!["reserve(failed)".to_string(), "create".to_string()]
        );
        assert_eq!(metrics.counter("saga.compensations_failed"), 1);
    }

    #[tokio::test]
    async fn duplicate_start_with_the_same_id_is_rejected() {
        let (orch, _store, _metrics) = orchestrator();
        let definition = SagaDefinition::new("OrderFulfillment");
        orch.start_with_id("saga-1", &definition, SagaContext::new(), "corr-1").await.unwrap();
        let dup = orch.start_with_id("saga-1", &definition, SagaContext::new(), "corr-1").await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn listeners_observe_the_full_lifecycle() {
        #[derive(Default)]
        struct Recording {
            events: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl SagaListener for Recording {
            async fn on_saga_started(&self, saga: &SagaInstance) {
                self.events.lock().unwrap().push(format!("started:{}", saga.saga_type));
            }
            async fn on_step_completed(&self, _saga_id: &str, step_name: &str) {
                self.events.lock().unwrap().push(format!("step:{step_name}"));
            }
            async fn on_saga_completed(&self, _saga_id: &str) {
                self.events.lock().unwrap().push("completed".into());
            }
        }

        let store = Arc::new(SagaStateStore::new());
        let mut orch = SagaOrchestrator::new(store, Arc::new(Metrics::new()));
        let listener = Arc::new(Recording::default());
        orch.add_listener(listener.clone());

        let compensated = Arc::new(Mutex::new(Vec::new()));
        let definition =
            SagaDefinition::new("OrderFulfillment").add_step(RecordingStep::new("reserve", Behavior::Succeed, compensated));
        orch.start(&definition, SagaContext::new(), "corr-1").await.unwrap();

        let events = listener.events.lock().unwrap();
        assert_eq!(*events, vec!["started:OrderFulfillment", "step:reserve", "completed"]);
    }
}
