//! Topic-scoped publish/subscribe between services, with optional envelope
//! signing.
//!
//! The bus itself does not persist anything; durability is the publishing
//! side's outbox concern. Publication fans out to every subscriber on the
//! topic; a subscriber's error is logged and does not prevent delivery to
//! the remaining subscribers, since a failing subscriber has its own
//! retry/outbox/DLQ path.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sagaflow_core::Metrics;
use sha2::Sha256;
use tracing::{instrument, warn};

use crate::error::{ResilienceError, ResilienceResult};

type HmacSha256 = Hmac<Sha256>;

/// Current envelope wire version.
pub const ENVELOPE_VERSION: u32 = 1;

/// A published message: routing metadata, the producing service's identity,
/// an optional signature, and a JSON body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    /// Destination topic.
    pub topic: String,
    /// The service that published this envelope.
    pub source_service: String,
    /// Envelope wire version.
    pub envelope_version: u32,
    /// The event type carried in `body`.
    pub event_type: String,
    /// Hex-encoded HMAC-SHA256 over `event_id|event_type|source_service`,
    /// present only when the publisher signs envelopes.
    pub signature: Option<String>,
    /// When the signature was computed.
    pub signed_at: Option<DateTime<Utc>>,
    /// Message body.
    pub body: serde_json::Value,
}

impl Envelope {
    /// An unsigned envelope.
    pub fn new(
        topic: impl Into<String>,
        source_service: impl Into<String>,
        event_type: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            source_service: source_service.into(),
            envelope_version: ENVELOPE_VERSION,
            event_type: event_type.into(),
            signature: None,
            signed_at: None,
            body,
        }
    }

    /// The string the signature covers. The event id comes from the body
    /// when present, so a tampered body no longer matches its signature.
    fn signing_input(&self) -> String {
        let event_id = self.body.get("event_id").and_then(|v| v.as_str()).unwrap_or_default();
        format!("{}|{}|{}", event_id, self.event_type, self.source_service)
    }
}

/// Signs and verifies envelopes with HMAC-SHA256 over
/// `event_id|event_type|source_service`. Verification failures are
/// warn-only: a mismatch is logged and the envelope still delivered, so a
/// key rollout can't silently drop traffic.
pub struct EnvelopeSigner {
    key: Vec<u8>,
}

impl EnvelopeSigner {
    /// A signer using `key` for HMAC-SHA256.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn compute(&self, input: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(input.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Stamp `envelope` with a fresh signature and signing timestamp.
    pub fn sign(&self, envelope: &mut Envelope) {
        envelope.signature = Some(self.compute(&envelope.signing_input()));
        envelope.signed_at = Some(Utc::now());
    }

    /// Verify `envelope`'s signature. Returns `false` (and logs a warning)
    /// on mismatch or if no signature is present; never errors, since
    /// verification failures are warn-only.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        match &envelope.signature {
            Some(sig) => {
                let ok = *sig == self.compute(&envelope.signing_input());
                if !ok {
                    warn!(topic = %envelope.topic, source = %envelope.source_service, "envelope signature mismatch");
                }
                ok
            }
            None => {
                warn!(topic = %envelope.topic, source = %envelope.source_service, "envelope missing signature while verification is enabled");
                false
            }
        }
    }
}

/// A subscriber registered against one or more topics.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle a delivered envelope.
    async fn handle(&self, envelope: &Envelope) -> ResilienceResult<()>;
}

/// In-process topic bus with server-side fan-out acknowledgement: `publish`
/// returns once every current subscriber has been offered the envelope.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<DashMap<String, Vec<Arc<dyn Subscriber>>>>,
    verifier: Option<Arc<EnvelopeSigner>>,
    metrics: Option<Arc<Metrics>>,
}

impl EventBus {
    /// A bus with verification disabled and no metrics.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            verifier: None,
            metrics: None,
        }
    }

    /// Verify every delivered envelope's signature with `verifier`
    /// (warn-only; delivery proceeds regardless).
    pub fn with_verifier(mut self, verifier: Arc<EnvelopeSigner>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Record publish timings on `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register `subscriber` against `topic`.
    pub fn subscribe(&self, topic: &str, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.entry(topic.to_string()).or_default().push(subscriber);
    }

    /// Publish `envelope` to its topic, delivering to every current
    /// subscriber.
    #[instrument(skip(self, envelope), fields(topic = %envelope.topic, event_type = %envelope.event_type))]
    pub async fn publish(&self, envelope: Envelope) -> ResilienceResult<()> {
        let started = Instant::now();

        if let Some(verifier) = &self.verifier {
            verifier.verify(&envelope);
        }

        let subscribers = match self.subscribers.get(&envelope.topic) {
            Some(subs) => subs.clone(),
            None => {
                return Err(ResilienceError::NoSubscriber(envelope.topic.clone()));
            }
        };

        for subscriber in subscribers {
            if let Err(err) = subscriber.handle(&envelope).await {
                warn!(topic = %envelope.topic, error = %err, "subscriber failed to handle envelope");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_duration("itopic.publish.duration", &[], started.elapsed());
        }
        Ok(())
    }

    /// Convenience: wrap `body` in an unsigned envelope and publish it.
    pub async fn publish_json(
        &self,
        topic: &str,
        source_service: &str,
        event_type: &str,
        body: serde_json::Value,
    ) -> ResilienceResult<()> {
        self.publish(Envelope::new(topic, source_service, event_type, body)).await
    }

    /// Number of subscribers currently registered on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl Subscriber for Counter {
        async fn handle(&self, _envelope: &Envelope) -> ResilienceResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));
        bus.subscribe("orders", Arc::new(Counter(count.clone())));
        bus.subscribe("orders", Arc::new(Counter(count.clone())));

        bus.publish_json("orders", "order-service", "OrderCreated", serde_json::json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_errors() {
        let bus = EventBus::new();
        let err = bus
            .publish_json("ghost-topic", "order-service", "OrderCreated", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::NoSubscriber(_)));
    }

    #[tokio::test]
    async fn one_subscriber_failing_does_not_block_the_other() {
        struct Failing;
        #[async_trait]
        impl Subscriber for Failing {
            async fn handle(&self, _e: &Envelope) -> ResilienceResult<()> {
                Err(ResilienceError::Publish {
                    topic: "orders".into(),
                    message: "boom".into(),
                })
            }
        }

        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));
        bus.subscribe("orders", Arc::new(Failing));
        bus.subscribe("orders", Arc::new(Counter(count.clone())));
        bus.publish_json("orders", "order-service", "OrderCreated", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signer_detects_a_reattributed_envelope() {
        let signer = EnvelopeSigner::new(b"secret".to_vec());
        let mut envelope = Envelope::new(
            "orders",
            "order-service",
            "OrderCreated",
            serde_json::json!({"event_id": "e-1", "amount": 100}),
        );
        signer.sign(&mut envelope);
        assert!(signer.verify(&envelope));
        assert!(envelope.signed_at.is_some());

        let mut reattributed = envelope.clone();
        reattributed.source_service = "rogue-service".into();
        assert!(!signer.verify(&reattributed));

        let mut swapped_event = envelope.clone();
        swapped_event.body = serde_json::json!({"event_id": "e-2", "amount": 100});
        assert!(!signer.verify(&swapped_event));
    }

    #[tokio::test]
    async fn verification_failure_is_warn_only_and_still_delivers() {
        let signer = Arc::new(EnvelopeSigner::new(b"secret".to_vec()));
        let bus = EventBus::new().with_verifier(signer);
        let count = Arc::new(AtomicU32::new(0));
        bus.subscribe("orders", Arc::new(Counter(count.clone())));

        // Unsigned envelope against a verifying bus: logged, not dropped.
        bus.publish_json("orders", "order-service", "OrderCreated", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_records_duration_metric() {
        let metrics = Arc::new(Metrics::new());
        let bus = EventBus::new().with_metrics(metrics.clone());
        let count = Arc::new(AtomicU32::new(0));
        bus.subscribe("orders", Arc::new(Counter(count)));

        bus.publish_json("orders", "order-service", "OrderCreated", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(metrics.snapshot().histograms["itopic.publish.duration"].count, 1);
    }
}
