//! Integration tests combining the resilience instance, circuit breaker,
//! retry executor, idempotency guard and event bus, the way a service
//! calling an unreliable downstream would compose them rather than using
//! any one in isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sagaflow_resilience::{
    BeginOutcome, CircuitBreakerConfig, Envelope, EventBus, IdempotencyGuard, InstanceCallError, InstanceConfig,
    ResilienceRegistry, RetryConfig, Subscriber,
};
use serde_json::json;

fn tight_instance(max_retries: u32) -> InstanceConfig {
    InstanceConfig {
        retry: RetryConfig::new(max_retries)
            .with_initial_interval(Duration::from_millis(1))
            .with_randomization_factor(0.0),
        circuit_breaker: CircuitBreakerConfig::default()
            .with_min_requests_to_evaluate(2)
            .with_failure_rate_threshold(0.5)
            .with_window(Duration::from_secs(60))
            .with_open_duration(Duration::from_secs(60)),
    }
}

#[tokio::test]
async fn breaker_opening_mid_retry_stops_the_remaining_attempts() {
    let registry = ResilienceRegistry::new(tight_instance(5), HashMap::new());
    let instance = registry.get_or_create("payment-capture");
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = instance
        .call(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("downstream unavailable".to_string())
                }
            },
            |_| true,
        )
        .await;

    // After the second failure the window trips, so the third attempt is
    // rejected at the breaker and never reaches the downstream.
    assert!(matches!(result, Err(InstanceCallError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn idempotency_guard_lets_only_the_first_attempt_execute() {
    let guard: IdempotencyGuard<u32> = IdempotencyGuard::new(Duration::from_secs(60));
    let executions = Arc::new(AtomicU32::new(0));

    let mut results = Vec::new();
    for _ in 0..3 {
        match guard.begin("order-1:charge") {
            BeginOutcome::Proceed => {
                let n = executions.fetch_add(1, Ordering::SeqCst) + 1;
                guard.complete("order-1:charge", n);
                results.push(n);
            }
            BeginOutcome::AlreadyCompleted(value) => results.push(value),
            BeginOutcome::InFlight => panic!("sequential calls should never race"),
        }
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(results, vec![1, 1, 1]);
}

struct Recorder {
    received: Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
}

#[async_trait]
impl Subscriber for Recorder {
    async fn handle(&self, envelope: &Envelope) -> sagaflow_resilience::ResilienceResult<()> {
        self.received.lock().unwrap().push(envelope.body.clone());
        Ok(())
    }
}

#[tokio::test]
async fn bus_fans_a_published_event_out_to_every_subscriber_on_the_topic() {
    let bus = EventBus::new();
    let received_a = Arc::new(std::sync::Mutex::new(Vec::new()));
    let received_b = Arc::new(std::sync::Mutex::new(Vec::new()));

    bus.subscribe("orders", Arc::new(Recorder { received: received_a.clone() }));
    bus.subscribe("orders", Arc::new(Recorder { received: received_b.clone() }));

    bus.publish_json("orders", "order-service", "OrderCreated", json!({ "order_id": "order-1" }))
        .await
        .unwrap();

    assert_eq!(received_a.lock().unwrap().len(), 1);
    assert_eq!(received_b.lock().unwrap().len(), 1);
}
