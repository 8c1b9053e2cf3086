//! Distributed saga orchestration and choreography on top of
//! `sagaflow-pipeline`'s event processing and `sagaflow-resilience`'s
//! circuit breaker, retry, and event bus primitives.

mod choreography;
mod compensation;
mod definition;
mod error;
mod orchestrator;
mod state_store;
mod timeout_detector;

pub use choreography::{ChoreographyListener, ChoreographyStep, CompensationApplier, NextEvent};
pub use compensation::{CompensationMapping, CompensationRegistry, CompensationRegistryBuilder};
pub use definition::{SagaContext, SagaDefinition, SagaStep, StepError, StepErrorKind};
pub use error::{SagaEngineError, SagaEngineResult};
pub use orchestrator::{OrchestratorResult, SagaListener, SagaOrchestrator};
pub use state_store::{CompleteOutcome, SagaInstance, SagaStateStore, SagaStatus, SagaStepRecord, StepStatus};
pub use timeout_detector::{TimedOutSagaHandler, TimeoutDetector, TimeoutDetectorConfig, SAGA_TIMED_OUT_TOPIC};
