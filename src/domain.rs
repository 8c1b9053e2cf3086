//! Demo service family: customer, order, inventory and payment services
//! wired against per-service runtimes, plus the saga steps composing them
//! into an order-fulfillment flow.
//!
//! Every state change goes through the owning service's pipeline (journal,
//! view, outbox) — the in-memory ledgers these services keep are their
//! materialized working state, not a side channel around the framework.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sagaflow_core::{EventRecord, EventStoreBackend, Payload, SagaMetadata};
use sagaflow_saga::{SagaContext, SagaDefinition, SagaStep, StepError};
use serde_json::json;

use crate::runtime::ServiceRuntime;

/// One order line: an item and how much of it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrderLine {
    /// Item identifier.
    pub sku: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit, in cents.
    pub unit_price_cents: u64,
}

impl OrderLine {
    /// Line total in cents.
    pub fn total_cents(&self) -> u64 {
        self.quantity as u64 * self.unit_price_cents
    }
}

/// Order lifecycle as the order service tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Accepted, fulfillment in progress.
    Created,
    /// Fulfillment finished successfully.
    Confirmed,
    /// Rolled back by compensation.
    Cancelled,
}

/// Payment lifecycle as the payment service tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Funds captured.
    Captured,
    /// A captured payment returned by compensation.
    Refunded,
}

/// One captured-or-refunded payment.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    /// Current status.
    pub status: PaymentStatus,
    /// Amount in cents.
    pub amount_cents: u64,
}

/// Orders above this total are declined by the payment provider.
pub const PAYMENT_DECLINE_THRESHOLD_CENTS: u64 = 1_000_000;

fn saga_metadata(ctx_saga_id: Option<String>, is_compensating: bool) -> Option<SagaMetadata> {
    ctx_saga_id.map(|saga_id| SagaMetadata {
        saga_id: Some(saga_id),
        saga_type: Some("OrderFulfillment".into()),
        step_number: None,
        is_compensating,
    })
}

/// Customer registry.
pub struct CustomerService<B: EventStoreBackend + 'static> {
    runtime: Arc<ServiceRuntime<B>>,
    customers: DashMap<String, String>,
}

impl<B: EventStoreBackend + 'static> CustomerService<B> {
    /// A customer service over `runtime`.
    pub fn new(runtime: Arc<ServiceRuntime<B>>) -> Self {
        Self {
            runtime,
            customers: DashMap::new(),
        }
    }

    /// Register a customer.
    pub async fn register(&self, customer_id: &str, name: &str) -> Result<(), StepError> {
        self.customers.insert(customer_id.to_string(), name.to_string());
        let payload = Payload::new("CustomerRegistered.v1", &json!({ "customer_id": customer_id, "name": name }))
            .map_err(StepError::transient)?;
        let event = EventRecord::new("CustomerRegistered", format!("customer-{customer_id}"), payload);
        self.runtime
            .submit(event, None, None)
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// Whether `customer_id` is registered.
    pub fn exists(&self, customer_id: &str) -> bool {
        self.customers.contains_key(customer_id)
    }
}

/// Order lifecycle owner.
pub struct OrderService<B: EventStoreBackend + 'static> {
    runtime: Arc<ServiceRuntime<B>>,
    orders: DashMap<String, OrderStatus>,
}

impl<B: EventStoreBackend + 'static> OrderService<B> {
    /// An order service over `runtime`.
    pub fn new(runtime: Arc<ServiceRuntime<B>>) -> Self {
        Self {
            runtime,
            orders: DashMap::new(),
        }
    }

    /// Accept a new order, returning its total in cents.
    pub async fn create(
        &self,
        order_id: &str,
        customer_id: &str,
        lines: &[OrderLine],
        saga_id: Option<String>,
    ) -> Result<u64, StepError> {
        let total: u64 = lines.iter().map(OrderLine::total_cents).sum();
        self.orders.insert(order_id.to_string(), OrderStatus::Created);
        let payload = Payload::new(
            "OrderCreated.v1",
            &json!({ "customer_id": customer_id, "lines": lines, "total_cents": total, "status": "created" }),
        )
        .map_err(StepError::transient)?;
        let event = EventRecord::new("OrderCreated", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, false))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(total)
    }

    /// Mark an order fulfilled.
    pub async fn confirm(&self, order_id: &str, saga_id: Option<String>) -> Result<(), StepError> {
        self.orders.insert(order_id.to_string(), OrderStatus::Confirmed);
        let payload = Payload::new("OrderConfirmed.v1", &json!({ "status": "confirmed" })).map_err(StepError::transient)?;
        let event = EventRecord::new("OrderConfirmed", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, false))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// Cancel an order (compensation for [`Self::create`]).
    pub async fn cancel(&self, order_id: &str, saga_id: Option<String>) -> Result<(), StepError> {
        self.orders.insert(order_id.to_string(), OrderStatus::Cancelled);
        let payload = Payload::new("OrderCancelled.v1", &json!({ "status": "cancelled" })).map_err(StepError::transient)?;
        let event = EventRecord::new("OrderCancelled", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, true))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// Current status of `order_id`.
    pub fn status(&self, order_id: &str) -> Option<OrderStatus> {
        self.orders.get(order_id).map(|s| *s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StockLevel {
    available: u32,
    reserved: u32,
}

/// Stock ledger owner.
pub struct InventoryService<B: EventStoreBackend + 'static> {
    runtime: Arc<ServiceRuntime<B>>,
    stock: DashMap<String, StockLevel>,
}

impl<B: EventStoreBackend + 'static> InventoryService<B> {
    /// An inventory service over `runtime`, seeded with `(sku, on-hand)`
    /// levels.
    pub fn new(runtime: Arc<ServiceRuntime<B>>, seed: impl IntoIterator<Item = (String, u32)>) -> Self {
        let stock = DashMap::new();
        for (sku, available) in seed {
            stock.insert(sku, StockLevel { available, reserved: 0 });
        }
        Self { runtime, stock }
    }

    /// Reserve `quantity` units of `sku` for `order_id`. A shortfall is a
    /// business rejection: nothing is taken and no retry will help.
    pub async fn reserve(&self, order_id: &str, sku: &str, quantity: u32, saga_id: Option<String>) -> Result<(), StepError> {
        {
            let mut level = self.stock.entry(sku.to_string()).or_default();
            if level.available - level.reserved < quantity {
                return Err(StepError::business(format!(
                    "insufficient stock for {sku}: {} available, {} requested",
                    level.available - level.reserved,
                    quantity
                )));
            }
            level.reserved += quantity;
        }
        let payload = Payload::new("InventoryReserved.v1", &json!({ "sku": sku, "quantity": quantity }))
            .map_err(StepError::transient)?;
        let event = EventRecord::new("InventoryReserved", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, false))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// Return a reservation to the pool (compensation for
    /// [`Self::reserve`]).
    pub async fn release(&self, order_id: &str, sku: &str, quantity: u32, saga_id: Option<String>) -> Result<(), StepError> {
        if let Some(mut level) = self.stock.get_mut(sku) {
            level.reserved = level.reserved.saturating_sub(quantity);
        }
        let payload = Payload::new("InventoryReleased.v1", &json!({ "sku": sku, "quantity": quantity }))
            .map_err(StepError::transient)?;
        let event = EventRecord::new("InventoryReleased", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, true))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// Units of `sku` currently reserved.
    pub fn reserved(&self, sku: &str) -> u32 {
        self.stock.get(sku).map(|l| l.reserved).unwrap_or(0)
    }

    /// Units of `sku` still reservable.
    pub fn available(&self, sku: &str) -> u32 {
        self.stock.get(sku).map(|l| l.available - l.reserved).unwrap_or(0)
    }
}

/// Payment capture/refund owner. `unreachable` simulates a provider outage:
/// charge calls never return, forcing the caller's timeout to fire.
pub struct PaymentService<B: EventStoreBackend + 'static> {
    runtime: Arc<ServiceRuntime<B>>,
    payments: DashMap<String, PaymentRecord>,
    unreachable: std::sync::atomic::AtomicBool,
}

impl<B: EventStoreBackend + 'static> PaymentService<B> {
    /// A payment service over `runtime`.
    pub fn new(runtime: Arc<ServiceRuntime<B>>) -> Self {
        Self {
            runtime,
            payments: DashMap::new(),
            unreachable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Simulate (or clear) a provider outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Capture `amount_cents` for `order_id`. Totals above
    /// [`PAYMENT_DECLINE_THRESHOLD_CENTS`] are declined outright.
    pub async fn charge(&self, order_id: &str, amount_cents: u64, saga_id: Option<String>) -> Result<(), StepError> {
        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            // An unresponsive provider: never answer; the step timeout
            // decides how long the saga waits.
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        }
        if amount_cents > PAYMENT_DECLINE_THRESHOLD_CENTS {
            return Err(StepError::business(format!(
                "payment declined for order {order_id}: amount {amount_cents} exceeds limit"
            )));
        }
        self.payments.insert(
            order_id.to_string(),
            PaymentRecord {
                status: PaymentStatus::Captured,
                amount_cents,
            },
        );
        let payload = Payload::new("PaymentCaptured.v1", &json!({ "amount_cents": amount_cents }))
            .map_err(StepError::transient)?;
        let event = EventRecord::new("PaymentCaptured", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, false))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// Return a captured payment (compensation for [`Self::charge`]).
    pub async fn refund(&self, order_id: &str, saga_id: Option<String>) -> Result<(), StepError> {
        let Some(mut record) = self.payments.get_mut(order_id) else {
            // Nothing was captured; a refund of nothing is complete.
            return Ok(());
        };
        record.status = PaymentStatus::Refunded;
        let amount = record.amount_cents;
        drop(record);
        let payload = Payload::new("PaymentRefunded.v1", &json!({ "amount_cents": amount })).map_err(StepError::transient)?;
        let event = EventRecord::new("PaymentRefunded", order_id, payload);
        self.runtime
            .submit(event, None, saga_metadata(saga_id, true))
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }

    /// The payment record for `order_id`, if a capture happened.
    pub fn record(&self, order_id: &str) -> Option<PaymentRecord> {
        self.payments.get(order_id).map(|r| r.clone())
    }
}

/// Step 0: accept the order. Compensation cancels it.
pub struct CreateOrderStep<B: EventStoreBackend + 'static> {
    /// The owning order service.
    pub orders: Arc<OrderService<B>>,
    /// The order to create.
    pub order_id: String,
    /// The ordering customer.
    pub customer_id: String,
    /// The order's lines.
    pub lines: Vec<OrderLine>,
}

#[async_trait]
impl<B: EventStoreBackend + 'static> SagaStep for CreateOrderStep<B> {
    fn name(&self) -> &str {
        "create-order"
    }
    fn service(&self) -> &str {
        "order-service"
    }
    fn event_type(&self) -> &str {
        "OrderCreated"
    }
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
        let saga_id = ctx.get::<String>("saga_id");
        let total = self.orders.create(&self.order_id, &self.customer_id, &self.lines, saga_id).await?;
        Ok(json!({ "order_total_cents": total }))
    }
    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        self.orders.cancel(&self.order_id, ctx.get::<String>("saga_id")).await
    }
}

/// Step 1: reserve stock for every line. Compensation releases it.
pub struct ReserveInventoryStep<B: EventStoreBackend + 'static> {
    /// The owning inventory service.
    pub inventory: Arc<InventoryService<B>>,
    /// The order the reservation belongs to.
    pub order_id: String,
    /// The lines to reserve.
    pub lines: Vec<OrderLine>,
}

#[async_trait]
impl<B: EventStoreBackend + 'static> SagaStep for ReserveInventoryStep<B> {
    fn name(&self) -> &str {
        "reserve-inventory"
    }
    fn service(&self) -> &str {
        "inventory-service"
    }
    fn event_type(&self) -> &str {
        "InventoryReserved"
    }
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
        let saga_id = ctx.get::<String>("saga_id");
        let mut reserved: Vec<&OrderLine> = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            if let Err(err) = self
                .inventory
                .reserve(&self.order_id, &line.sku, line.quantity, saga_id.clone())
                .await
            {
                // Undo the lines already taken so a partially reservable
                // order leaves the ledger untouched.
                for taken in reserved {
                    let _ = self
                        .inventory
                        .release(&self.order_id, &taken.sku, taken.quantity, saga_id.clone())
                        .await;
                }
                return Err(err);
            }
            reserved.push(line);
        }
        Ok(serde_json::Value::Null)
    }
    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        let saga_id = ctx.get::<String>("saga_id");
        for line in &self.lines {
            self.inventory
                .release(&self.order_id, &line.sku, line.quantity, saga_id.clone())
                .await?;
        }
        Ok(())
    }
}

/// Step 2: capture payment for the total the create step computed.
/// Compensation refunds it.
pub struct ProcessPaymentStep<B: EventStoreBackend + 'static> {
    /// The owning payment service.
    pub payments: Arc<PaymentService<B>>,
    /// The order being paid.
    pub order_id: String,
    /// How long one capture attempt may take.
    pub timeout: Duration,
}

#[async_trait]
impl<B: EventStoreBackend + 'static> SagaStep for ProcessPaymentStep<B> {
    fn name(&self) -> &str {
        "process-payment"
    }
    fn service(&self) -> &str {
        "payment-service"
    }
    fn event_type(&self) -> &str {
        "PaymentCaptured"
    }
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
        let amount = ctx
            .get::<u64>("order_total_cents")
            .ok_or_else(|| StepError::transient("order total missing from saga context"))?;
        self.payments.charge(&self.order_id, amount, ctx.get::<String>("saga_id")).await?;
        Ok(json!({ "captured_cents": amount }))
    }
    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        self.payments.refund(&self.order_id, ctx.get::<String>("saga_id")).await
    }
    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Step 3: confirm the order. Terminal: nothing to undo once confirmed.
pub struct ConfirmOrderStep<B: EventStoreBackend + 'static> {
    /// The owning order service.
    pub orders: Arc<OrderService<B>>,
    /// The order to confirm.
    pub order_id: String,
}

#[async_trait]
impl<B: EventStoreBackend + 'static> SagaStep for ConfirmOrderStep<B> {
    fn name(&self) -> &str {
        "confirm-order"
    }
    fn service(&self) -> &str {
        "order-service"
    }
    fn event_type(&self) -> &str {
        "OrderConfirmed"
    }
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value, StepError> {
        self.orders.confirm(&self.order_id, ctx.get::<String>("saga_id")).await?;
        Ok(serde_json::Value::Null)
    }
    fn has_compensation(&self) -> bool {
        false
    }
}

/// The four-step order fulfillment saga over the given services.
#[allow(clippy::too_many_arguments)]
pub fn fulfillment_definition<B: EventStoreBackend + 'static>(
    orders: &Arc<OrderService<B>>,
    inventory: &Arc<InventoryService<B>>,
    payments: &Arc<PaymentService<B>>,
    order_id: &str,
    customer_id: &str,
    lines: Vec<OrderLine>,
    payment_timeout: Duration,
    saga_timeout: Duration,
) -> SagaDefinition {
    SagaDefinition::new("OrderFulfillment")
        .with_timeout(saga_timeout)
        .add_step(CreateOrderStep {
            orders: orders.clone(),
            order_id: order_id.to_string(),
            customer_id: customer_id.to_string(),
            lines: lines.clone(),
        })
        .add_step(ReserveInventoryStep {
            inventory: inventory.clone(),
            order_id: order_id.to_string(),
            lines,
        })
        .add_step(ProcessPaymentStep {
            payments: payments.clone(),
            order_id: order_id.to_string(),
            timeout: payment_timeout,
        })
        .add_step(ConfirmOrderStep {
            orders: orders.clone(),
            order_id: order_id.to_string(),
        })
}
