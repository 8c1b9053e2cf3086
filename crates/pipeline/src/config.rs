//! Configuration surface for the pipeline engine, outbox and DLQ, with
//! serde defaults per field so a deployment only overrides what it cares
//! about.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_worker_count() -> usize {
    4
}

fn default_pending_completion_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_stage_retries() -> u32 {
    3
}

/// Configuration for [`crate::engine::PipelineEngine`] and the
/// pending-completion sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent stage workers. Entries for one entity key are
    /// always routed to the same worker regardless of this count.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// How long a submitted event may wait for the `complete` stage before
    /// its pending completion is orphaned.
    #[serde(default = "default_pending_completion_timeout", with = "humantime_duration")]
    pub pending_completion_timeout: Duration,
    /// In-place retries per entry before it is routed to the DLQ.
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            pending_completion_timeout: default_pending_completion_timeout(),
            max_stage_retries: default_max_stage_retries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_stale_claim_after() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for [`crate::outbox::Outbox`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Whether pipeline publication routes through the outbox at all;
    /// disabled, the pipeline publishes straight to the bus and loses the
    /// outage decoupling.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often the publisher polls for pending entries.
    #[serde(default = "default_poll_interval", with = "humantime_duration")]
    pub poll_interval: Duration,
    /// Most entries claimed per poll.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Delivery attempts allowed before an entry moves to the DLQ.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// An `InFlight` claim older than this is considered abandoned and
    /// re-queued.
    #[serde(default = "default_stale_claim_after", with = "humantime_duration")]
    pub stale_claim_after: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval: default_poll_interval(),
            max_batch_size: default_max_batch_size(),
            max_retries: default_max_retries(),
            stale_claim_after: default_stale_claim_after(),
        }
    }
}

fn default_max_replay_attempts() -> u32 {
    3
}

/// Configuration for [`crate::dlq::DeadLetterQueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Whether exhausted entries are captured at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of times one entry may be replayed.
    #[serde(default = "default_max_replay_attempts")]
    pub max_replay_attempts: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_replay_attempts: default_max_replay_attempts(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.pending_completion_timeout, Duration::from_secs(30));

        let outbox = OutboxConfig::default();
        assert!(outbox.enabled);
        assert_eq!(outbox.poll_interval, Duration::from_millis(1000));
        assert_eq!(outbox.max_batch_size, 50);
        assert_eq!(outbox.max_retries, 5);

        let dlq = DlqConfig::default();
        assert!(dlq.enabled);
        assert_eq!(dlq.max_replay_attempts, 3);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = OutboxConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: OutboxConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.poll_interval, config.poll_interval);
        assert_eq!(deserialized.max_batch_size, config.max_batch_size);
    }
}
