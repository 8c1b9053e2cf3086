//! Runs the order-fulfillment scenarios end-to-end against the in-process
//! service family, reporting outcomes to stdout: a happy path, a declined
//! payment compensating back out, a stock-out that never reaches payment,
//! and a hung payment provider forcing a deadline-driven rollback.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sagaflow::domain::{
    fulfillment_definition, CustomerService, InventoryService, OrderLine, OrderService, PaymentService,
};
use sagaflow::runtime::ServiceRuntime;
use sagaflow::{init_observability, SagaflowConfig};
use async_trait::async_trait;
use sagaflow_core::{Metrics, ViewUpdater};
use sagaflow_resilience::{Envelope, EventBus, ResilienceResult, Subscriber};
use sagaflow_saga::{SagaContext, SagaOrchestrator, SagaStateStore};

/// Prints every envelope that crosses the bus, standing in for the
/// downstream consumers a real deployment would attach.
struct TopicLogger;

#[async_trait]
impl Subscriber for TopicLogger {
    async fn handle(&self, envelope: &Envelope) -> ResilienceResult<()> {
        println!(
            "  bus: {:<18} from {:<18} seq={}",
            envelope.event_type,
            envelope.source_service,
            envelope.body.get("sequence").and_then(|v| v.as_u64()).unwrap_or(0),
        );
        Ok(())
    }
}

fn lines(sku: &str, quantity: u32, unit_price_cents: u64) -> Vec<OrderLine> {
    vec![OrderLine {
        sku: sku.to_string(),
        quantity,
        unit_price_cents,
    }]
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_observability("info");
    let config = SagaflowConfig::default();
    let metrics = Arc::new(Metrics::new());
    let bus = Arc::new(EventBus::new().with_metrics(metrics.clone()));

    let customer_rt = Arc::new(ServiceRuntime::in_memory("customer-service", bus.clone(), ViewUpdater::new(), &config, metrics.clone()));
    let order_rt = Arc::new(ServiceRuntime::in_memory("order-service", bus.clone(), ViewUpdater::new(), &config, metrics.clone()));
    let inventory_rt = Arc::new(ServiceRuntime::in_memory("inventory-service", bus.clone(), ViewUpdater::new(), &config, metrics.clone()));
    let payment_rt = Arc::new(ServiceRuntime::in_memory("payment-service", bus.clone(), ViewUpdater::new(), &config, metrics.clone()));

    for topic in [
        "CustomerRegistered", "OrderCreated", "OrderConfirmed", "OrderCancelled",
        "InventoryReserved", "InventoryReleased", "PaymentCaptured", "PaymentRefunded",
    ] {
        bus.subscribe(topic, Arc::new(TopicLogger));
    }

    let customers = Arc::new(CustomerService::new(customer_rt.clone()));
    let orders = Arc::new(OrderService::new(order_rt.clone()));
    let inventory = Arc::new(InventoryService::new(
        inventory_rt.clone(),
        [("widget".to_string(), 100u32), ("gadget".to_string(), 1u32)],
    ));
    let payments = Arc::new(PaymentService::new(payment_rt.clone()));

    customers.register("C1", "Demo Customer").await.ok();

    let state_store = Arc::new(SagaStateStore::new());
    let orchestrator = SagaOrchestrator::new(state_store.clone(), metrics.clone());

    // 1. Happy fulfillment: every step succeeds.
    let definition = fulfillment_definition(
        &orders, &inventory, &payments,
        "order-happy", "C1", lines("widget", 2, 999),
        Duration::from_millis(500), Duration::from_secs(30),
    );
    let result = orchestrator.start(&definition, SagaContext::new(), "corr-happy").await?;
    println!("happy fulfillment            -> {:?} (reserved widget: {})", result.status, inventory.reserved("widget"));

    // 2. Payment decline: the total busts the provider limit; the
    // reservation and the order roll back.
    let definition = fulfillment_definition(
        &orders, &inventory, &payments,
        "order-declined", "C1", lines("widget", 2, 600_000),
        Duration::from_millis(500), Duration::from_secs(30),
    );
    let result = orchestrator.start(&definition, SagaContext::new(), "corr-declined").await?;
    println!(
        "payment declined             -> {:?} (reserved widget: {}, order: {:?})",
        result.status,
        inventory.reserved("widget"),
        orders.status("order-declined")
    );

    // 3. Stock-out: the reservation itself is rejected; payment never runs.
    let definition = fulfillment_definition(
        &orders, &inventory, &payments,
        "order-stockout", "C1", lines("gadget", 5, 4_999),
        Duration::from_millis(500), Duration::from_secs(30),
    );
    let result = orchestrator.start(&definition, SagaContext::new(), "corr-stockout").await?;
    println!(
        "stock-out short-circuit      -> {:?} (payment record: {:?})",
        result.status,
        payments.record("order-stockout").map(|r| r.status)
    );

    // 4. Provider outage: the charge never answers, the saga deadline
    // fires, and everything compensates.
    payments.set_unreachable(true);
    let definition = fulfillment_definition(
        &orders, &inventory, &payments,
        "order-hung", "C1", lines("widget", 1, 1_499),
        Duration::from_secs(10), Duration::from_millis(750),
    );
    let result = orchestrator.start(&definition, SagaContext::new(), "corr-hung").await?;
    payments.set_unreachable(false);
    println!(
        "provider outage              -> {:?} (reserved widget: {}, order: {:?})",
        result.status,
        inventory.reserved("widget"),
        orders.status("order-hung")
    );

    // Drain each outbox once so the per-service journals show up on the bus
    // before the snapshot below.
    for rt in [&customer_rt, &order_rt, &inventory_rt, &payment_rt] {
        rt.drain_outbox().await;
    }

    let snapshot = metrics.snapshot();
    println!("sagas: started={} completed={} compensated={} timedout={}",
        snapshot.counters.get("saga.started").copied().unwrap_or(0),
        snapshot.counters.get("saga.completed").copied().unwrap_or(0),
        snapshot.counters.get("saga.compensated").copied().unwrap_or(0),
        snapshot.counters.get("saga.timedout").copied().unwrap_or(0),
    );
    Ok(())
}
