//! In-process metrics registry shared by every layer of the framework.
//!
//! Counters, gauges and duration histograms keyed by name, with an optional
//! `{key=value}` tag suffix so dashboards can split a metric by dimension
//! (`events.failed{stage=persist}`, `saga.duration{sagaType=OrderFulfillment}`).
//! Durations are recorded as histograms rather than decaying quantile
//! gauges, so a long-lived dashboard reads stable aggregates. Exporting to
//! an external system is a deployment concern; this registry only has to
//! make every value observable from inside the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Formats `name{k1=v1,k2=v2}`, or just `name` with no tags.
fn tagged_name(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let joined: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{}{{{}}}", name, joined.join(","))
}

#[derive(Default)]
struct Histogram {
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Histogram {
    fn record(&self, d: Duration) {
        let micros = d.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Aggregated view of one duration histogram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSnapshot {
    /// Number of recorded observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: Duration,
    /// Largest single observation.
    pub max: Duration,
}

impl HistogramSnapshot {
    /// Mean observation, or zero if nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.sum / self.count as u32
        }
    }
}

/// A point-in-time read of every tracked metric.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Monotonically increasing counters, e.g. `events.processed`.
    pub counters: HashMap<String, u64>,
    /// Values that can move up or down, e.g. `pending.events`.
    pub gauges: HashMap<String, i64>,
    /// Duration histograms, e.g. `pipeline.stage.duration{stage=persist}`.
    pub histograms: HashMap<String, HistogramSnapshot>,
}

/// Registry of named counters, gauges and duration histograms.
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
}

impl Metrics {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the named counter by 1.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment the tagged counter by 1, e.g.
    /// `incr_tagged("events.failed", &[("stage", "persist")])`.
    pub fn incr_tagged(&self, name: &str, tags: &[(&str, &str)]) {
        self.add(&tagged_name(name, tags), 1);
    }

    /// Increment the named counter by `by`.
    pub fn add(&self, name: &str, by: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    /// Set the named gauge to `value`.
    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Record one observation into the named duration histogram.
    pub fn record_duration(&self, name: &str, tags: &[(&str, &str)], d: Duration) {
        self.histograms
            .entry(tagged_name(name, tags))
            .or_default()
            .record(d);
    }

    /// Current value of a counter, 0 if it was never incremented. The exact
    /// key must match, tag suffix included.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Current value of a gauge, 0 if it was never set.
    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.get(name).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// A consistent snapshot of every tracked metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|e| {
                    (
                        e.key().clone(),
                        HistogramSnapshot {
                            count: e.value().count.load(Ordering::Relaxed),
                            sum: Duration::from_micros(e.value().sum_micros.load(Ordering::Relaxed)),
                            max: Duration::from_micros(e.value().max_micros.load(Ordering::Relaxed)),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.incr("events.processed");
        metrics.incr("events.processed");
        metrics.set_gauge("pending.events", 5);
        metrics.set_gauge("pending.events", 2);

        assert_eq!(metrics.counter("events.processed"), 2);
        assert_eq!(metrics.gauge("pending.events"), 2);
    }

    #[test]
    fn tagged_counters_keep_dimensions_apart() {
        let metrics = Metrics::new();
        metrics.incr_tagged("events.failed", &[("stage", "persist")]);
        metrics.incr_tagged("events.failed", &[("stage", "publish")]);
        metrics.incr_tagged("events.failed", &[("stage", "persist")]);

        assert_eq!(metrics.counter("events.failed{stage=persist}"), 2);
        assert_eq!(metrics.counter("events.failed{stage=publish}"), 1);
    }

    #[test]
    fn histograms_track_count_sum_and_max() {
        let metrics = Metrics::new();
        metrics.record_duration("pipeline.stage.duration", &[("stage", "persist")], Duration::from_millis(10));
        metrics.record_duration("pipeline.stage.duration", &[("stage", "persist")], Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        let h = &snapshot.histograms["pipeline.stage.duration{stage=persist}"];
        assert_eq!(h.count, 2);
        assert_eq!(h.sum, Duration::from_millis(40));
        assert_eq!(h.max, Duration::from_millis(30));
        assert_eq!(h.mean(), Duration::from_millis(20));
    }
}
