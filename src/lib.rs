//! Composition root for sagaflow: observability bootstrap, the aggregate
//! configuration surface, a per-service runtime builder, and (behind
//! `src/domain.rs`) a small demo service family used by
//! `src/bin/sagaflow_demo.rs` to exercise the framework end-to-end.
//!
//! Everything here is explicit construction, never a DI container or
//! reflection-driven wiring.

pub mod domain;
pub mod runtime;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use sagaflow_core::{EvictionConfig, InitialLoadMode, WriteBehindConfig};
use sagaflow_pipeline::{DlqConfig, OutboxConfig, PipelineConfig};
use sagaflow_resilience::{CircuitBreakerConfig, InstanceConfig, RetryConfig};
use sagaflow_saga::TimeoutDetectorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

/// Durable backing store settings. Disabled by default: the grid maps stay
/// purely in memory.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Whether write-behind and load-on-miss are active at all.
    #[serde(default = "default_false")]
    pub enabled: bool,
    /// Flush batching parameters.
    #[serde(flatten)]
    pub write_behind: WriteBehindConfig,
    /// Whether view maps hydrate eagerly at startup or per key on first
    /// access. Event journals always load lazily.
    pub initial_load_mode: InitialLoadMode,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            write_behind: WriteBehindConfig::default(),
            initial_load_mode: InitialLoadMode::Eager,
        }
    }
}

/// Duplicate-delivery guard settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Whether saga listeners deduplicate deliveries at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long a processed event id is remembered.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl IdempotencySettings {
    /// The TTL to build guards with: a zero TTL means every remembered
    /// claim is already expired, which disables deduplication.
    pub fn effective_ttl(&self) -> Duration {
        if self.enabled {
            self.ttl
        } else {
            Duration::ZERO
        }
    }
}

/// Shared resilience defaults plus per-instance overrides keyed by
/// instance name (`"inventory-stock-reservation"`, ...).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// Circuit breaker defaults for instances without an override.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry defaults for instances without an override.
    pub retry: RetryConfig,
    /// Per-instance overrides.
    pub instances: HashMap<String, InstanceConfig>,
}

impl ResilienceSettings {
    /// The default instance config assembled from the shared sections.
    pub fn default_instance(&self) -> InstanceConfig {
        InstanceConfig {
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
        }
    }
}

/// Saga deadline and timeout-detector settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SagaTimeoutSettings {
    /// Detector sweep cadence and scope.
    #[serde(flatten)]
    pub detector: TimeoutDetectorConfig,
    /// Deadline applied to saga types without an override.
    #[serde(with = "duration_millis")]
    pub default_deadline: Duration,
    /// Per-saga-type deadline overrides, in milliseconds.
    pub saga_types: HashMap<String, u64>,
}

impl Default for SagaTimeoutSettings {
    fn default() -> Self {
        Self {
            detector: TimeoutDetectorConfig::default(),
            default_deadline: Duration::from_secs(60),
            saga_types: HashMap::new(),
        }
    }
}

impl SagaTimeoutSettings {
    /// The deadline for `saga_type`, honoring any override.
    pub fn deadline_for(&self, saga_type: &str) -> Duration {
        self.saga_types
            .get(saga_type)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(self.default_deadline)
    }
}

fn default_view_eviction() -> EvictionConfig {
    EvictionConfig {
        enabled: true,
        max_size: 10_000,
        max_idle: Some(Duration::from_secs(3600)),
    }
}

/// The full set of tunables, loadable from one TOML file. Each section
/// defaults independently, so a deployment only overrides what it cares
/// about.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SagaflowConfig {
    /// Pipeline engine and completion-sweep tunables.
    pub pipeline: PipelineConfig,
    /// Transactional outbox tunables.
    pub outbox: OutboxConfig,
    /// Dead letter queue tunables.
    pub dlq: DlqConfig,
    /// Duplicate-delivery guard tunables.
    pub idempotency: IdempotencySettings,
    /// Durable backing store tunables.
    pub persistence: PersistenceSettings,
    /// Circuit breaker / retry defaults and per-instance overrides.
    pub resilience: ResilienceSettings,
    /// Saga deadlines and the timeout detector.
    pub saga_timeout: SagaTimeoutSettings,
    /// Hot-cache bounds for event journals.
    pub event_store_eviction: EvictionConfig,
    /// Hot-cache bounds for view maps. Views idle an hour are evicted by
    /// default; journals only age out under LRU pressure.
    #[serde(default = "default_view_eviction")]
    pub view_store_eviction: EvictionConfig,
}

impl Default for SagaflowConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            outbox: OutboxConfig::default(),
            dlq: DlqConfig::default(),
            idempotency: IdempotencySettings::default(),
            persistence: PersistenceSettings::default(),
            resilience: ResilienceSettings::default(),
            saga_timeout: SagaTimeoutSettings::default(),
            event_store_eviction: EvictionConfig::default(),
            view_store_eviction: default_view_eviction(),
        }
    }
}

/// Errors loading or parsing a [`SagaflowConfig`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The file's contents were not valid TOML for this shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl SagaflowConfig {
    /// Load configuration from a TOML file at `path`, falling back to
    /// documented defaults for anything the file omits.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Initializes a `tracing` subscriber reading its filter from `RUST_LOG`
/// (or `default_level` if unset). Returns a guard to keep alive for the
/// process lifetime.
pub fn init_observability(default_level: &str) -> ObservabilityGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
    ObservabilityGuard { _private: () }
}

/// Keeps the process's tracing subscriber installed. Dropping it is a
/// no-op today; it exists so a future exporter can flush on drop without
/// changing every call site.
pub struct ObservabilityGuard {
    _private: (),
}
