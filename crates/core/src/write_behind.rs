//! Write-behind adapters fronting the durable backing store.
//!
//! Two shapes, matching how events and views differ:
//!
//! * [`WriteBehindEventStoreBackend`] — events are unique, so writes are
//!   batched inserts with no coalescing, the hot cache holds recent keys
//!   bounded by LRU, and a miss loads the key's full history on demand.
//! * [`ViewWriteBehind`] — only the latest state per key matters, so queued
//!   writes coalesce (one upsert per key per flush) and a warm start loads
//!   every key eagerly.
//!
//! When the backing store is down, a failed flush re-queues its batch and
//! retries on the next tick with backoff, forever; accepted writes are never
//! dropped. Sustained failures are visible through the
//! `persistence.errors{operation}` counter, which is the signal operators
//! must alert on before the queue and hot cache grow unbounded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::event::{EventRecord, PartitionedSequenceKey};
use crate::metrics::Metrics;
use crate::persistence::{PersistedEvent, PersistedView, PersistenceBackend};
use crate::store::{BackendStats, EventStoreBackend};
use crate::view::ViewRecord;

/// Whether a map hydrates from the backing store at startup or on first
/// access per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InitialLoadMode {
    /// Load keys on first access.
    Lazy,
    /// Load every key at startup.
    Eager,
}

/// Batching parameters for the write-behind flush loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WriteBehindConfig {
    /// How long queued writes may wait before a flush, regardless of batch
    /// size.
    #[serde(with = "duration_secs")]
    pub write_delay: Duration,
    /// Flush as soon as this many writes are queued, without waiting out
    /// `write_delay`.
    pub write_batch_size: usize,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            write_delay: Duration::from_secs(5),
            write_batch_size: 100,
        }
    }
}

/// Hot-cache bounding parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Whether bounded eviction is active at all.
    pub enabled: bool,
    /// Maximum number of keys kept hot before the least-recently-used one
    /// is evicted.
    pub max_size: usize,
    /// Evict keys untouched for this long; `None` keeps idle keys until
    /// LRU pressure reaches them.
    #[serde(with = "duration_secs_opt", skip_serializing_if = "Option::is_none", default)]
    pub max_idle: Option<Duration>,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10_000,
            max_idle: None,
        }
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

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

struct KeyCacheEntry {
    events: BTreeMap<u64, EventRecord>,
    /// Whether this entry holds the key's full durable history, or only
    /// events appended since the key last became hot.
    complete: bool,
    last_access: Instant,
}

struct HotEventCache {
    entries: Mutex<HashMap<String, KeyCacheEntry>>,
    lru: Mutex<VecDeque<String>>,
    eviction: EvictionConfig,
}

impl HotEventCache {
    fn new(eviction: EvictionConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lru: Mutex::new(VecDeque::new()),
            eviction,
        }
    }

    fn touch(&self, key: &str) {
        let mut lru = self.lru.lock();
        lru.retain(|k| k != key);
        lru.push_back(key.to_string());
        if self.eviction.enabled && lru.len() > self.eviction.max_size {
            if let Some(evicted) = lru.pop_front() {
                self.entries.lock().remove(&evicted);
                debug!(key = %evicted, "evicted least-recently-used hot cache key");
            }
        }
    }

    fn sweep_idle(&self) {
        let Some(max_idle) = self.eviction.max_idle else {
            return;
        };
        if !self.eviction.enabled {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.last_access) <= max_idle);
        let removed = before - entries.len();
        if removed > 0 {
            let mut lru = self.lru.lock();
            lru.retain(|k| entries.contains_key(k));
            debug!(removed, "evicted idle hot cache keys");
        }
    }
}

/// An [`EventStoreBackend`] whose hot cache fronts a durable
/// [`PersistenceBackend`]: appends land in cache and a flush queue, reads
/// miss through to the backing store, and the cache stays bounded by LRU.
pub struct WriteBehindEventStoreBackend {
    durable: Arc<dyn PersistenceBackend>,
    cache: HotEventCache,
    unflushed: Mutex<HashMap<String, Vec<PersistedEvent>>>,
    unflushed_count: Mutex<usize>,
    flush_trigger: Arc<Notify>,
    config: WriteBehindConfig,
    metrics: Arc<Metrics>,
}

impl WriteBehindEventStoreBackend {
    /// Wrap `durable` behind a hot cache with the given batching and
    /// eviction settings. Call [`Self::spawn_flush_loop`] afterwards to
    /// start draining queued writes.
    pub fn new(
        durable: Arc<dyn PersistenceBackend>,
        config: WriteBehindConfig,
        eviction: EvictionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            durable,
            cache: HotEventCache::new(eviction),
            unflushed: Mutex::new(HashMap::new()),
            unflushed_count: Mutex::new(0),
            flush_trigger: Arc::new(Notify::new()),
            config,
            metrics,
        }
    }

    /// Drain one batch of queued writes into the backing store. Returns how
    /// many events were durably persisted; a backend failure re-queues the
    /// batch for the next call.
    #[instrument(skip(self))]
    pub async fn flush_once(&self) -> usize {
        let batch: Vec<PersistedEvent> = {
            let mut unflushed = self.unflushed.lock();
            let mut count = self.unflushed_count.lock();
            let mut batch = Vec::with_capacity(self.config.write_batch_size.min(*count));
            let keys: Vec<String> = unflushed.keys().cloned().collect();
            'outer: for key in keys {
                let Some(bucket) = unflushed.get_mut(&key) else { continue };
                while !bucket.is_empty() {
                    if batch.len() >= self.config.write_batch_size {
                        break 'outer;
                    }
                    batch.push(bucket.remove(0));
                }
                unflushed.remove(&key);
            }
            *count -= batch.len();
            batch
        };

        if batch.is_empty() {
            return 0;
        }

        let started = Instant::now();
        match self.durable.persist_events(&batch).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.metrics.add("persistence.store.count", batch.len() as u64);
                self.metrics.incr("persistence.store.batch.count");
                self.metrics.add("persistence.store.batch.entries", batch.len() as u64);
                self.metrics.record_duration("persistence.store.batch.duration", &[], elapsed);
                debug!(flushed = batch.len(), "flushed event batch to durable store");
                batch.len()
            }
            Err(err) => {
                self.metrics.incr_tagged("persistence.errors", &[("operation", "persist_events")]);
                error!(error = %err, requeued = batch.len(), "event flush failed; batch re-queued for retry");
                let mut unflushed = self.unflushed.lock();
                let mut count = self.unflushed_count.lock();
                *count += batch.len();
                for event in batch {
                    unflushed.entry(event.aggregate_id.clone()).or_default().push(event);
                }
                0
            }
        }
    }

    /// Number of writes accepted but not yet durably persisted.
    pub fn unflushed_count(&self) -> usize {
        *self.unflushed_count.lock()
    }

    /// Spawn the background loop that flushes on `write_delay` ticks, early
    /// when a batch fills, and with growing backoff while the backing store
    /// is failing.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let backend = self.clone();
        let trigger = self.flush_trigger.clone();
        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                let delay = if consecutive_failures == 0 {
                    backend.config.write_delay
                } else {
                    (backend.config.write_delay * 2u32.saturating_pow(consecutive_failures.min(4)))
                        .min(Duration::from_secs(60))
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = trigger.notified() => {}
                }
                backend.cache.sweep_idle();
                let before = backend.unflushed_count();
                if before == 0 {
                    continue;
                }
                let flushed = backend.flush_once().await;
                consecutive_failures = if flushed == 0 { consecutive_failures.saturating_add(1) } else { 0 };
                if consecutive_failures == 1 {
                    warn!("durable store rejected a flush; retrying with backoff");
                }
            }
        })
    }

    fn overlay_unflushed(&self, entity_key: &str, mut events: Vec<EventRecord>) -> Vec<EventRecord> {
        let unflushed = self.unflushed.lock();
        if let Some(bucket) = unflushed.get(entity_key) {
            for pending in bucket {
                if let Ok(record) = pending.to_record() {
                    if !events.iter().any(|e| e.sequence == record.sequence) {
                        events.push(record);
                    }
                }
            }
        }
        events.sort_by_key(|e| e.sequence.unwrap_or(0));
        events
    }

    async fn load_key_through(&self, entity_key: &str) -> CoreResult<Vec<EventRecord>> {
        let started = Instant::now();
        self.metrics.incr("persistence.load.miss");
        let rows = self.durable.load_events_for_key(entity_key).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(row.to_record()?);
        }
        let events = self.overlay_unflushed(entity_key, events);
        self.metrics.record_duration("persistence.load.duration", &[], started.elapsed());

        let mut entries = self.cache.entries.lock();
        entries.insert(
            entity_key.to_string(),
            KeyCacheEntry {
                events: events.iter().filter_map(|e| e.sequence.map(|s| (s, e.clone()))).collect(),
                complete: true,
                last_access: Instant::now(),
            },
        );
        drop(entries);
        self.cache.touch(entity_key);
        Ok(events)
    }
}

#[async_trait]
impl EventStoreBackend for WriteBehindEventStoreBackend {
    async fn append(&self, key: PartitionedSequenceKey, event: EventRecord) -> CoreResult<()> {
        let persisted = PersistedEvent::from_record(&event)?;
        {
            let mut entries = self.cache.entries.lock();
            let entry = entries.entry(key.entity_key.clone()).or_insert_with(|| KeyCacheEntry {
                events: BTreeMap::new(),
                complete: false,
                last_access: Instant::now(),
            });
            if entry.events.contains_key(&key.sequence) {
                return Err(CoreError::DuplicateSequence {
                    entity_key: key.entity_key,
                    sequence: key.sequence,
                });
            }
            entry.events.insert(key.sequence, event);
            entry.last_access = Instant::now();
        }
        self.cache.touch(&key.entity_key);

        let should_flush = {
            let mut unflushed = self.unflushed.lock();
            let mut count = self.unflushed_count.lock();
            unflushed.entry(key.entity_key.clone()).or_default().push(persisted);
            *count += 1;
            *count >= self.config.write_batch_size
        };
        if should_flush {
            self.flush_trigger.notify_one();
        }
        Ok(())
    }

    async fn get_for_key(&self, entity_key: &str) -> CoreResult<Vec<EventRecord>> {
        self.metrics.incr("persistence.load.count");
        {
            let mut entries = self.cache.entries.lock();
            if let Some(entry) = entries.get_mut(entity_key) {
                if entry.complete {
                    entry.last_access = Instant::now();
                    let events: Vec<EventRecord> = entry.events.values().cloned().collect();
                    drop(entries);
                    self.cache.touch(entity_key);
                    return Ok(events);
                }
            }
        }
        self.load_key_through(entity_key).await
    }

    async fn get_by_type(&self, event_type: &str) -> CoreResult<Vec<EventRecord>> {
        let rows = self.durable.load_events_by_type(event_type).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(row.to_record()?);
        }
        // Queued-but-unflushed events are part of the journal too.
        let unflushed = self.unflushed.lock();
        for bucket in unflushed.values() {
            for pending in bucket {
                if pending.event_type == event_type && !events.iter().any(|e| e.event_id == pending.event_id) {
                    events.push(pending.to_record()?);
                }
            }
        }
        drop(unflushed);
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn get_in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<EventRecord>> {
        let rows = self.durable.load_events_in_range(from, to).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(row.to_record()?);
        }
        let unflushed = self.unflushed.lock();
        for bucket in unflushed.values() {
            for pending in bucket {
                if pending.timestamp >= from
                    && pending.timestamp <= to
                    && !events.iter().any(|e| e.event_id == pending.event_id)
                {
                    events.push(pending.to_record()?);
                }
            }
        }
        drop(unflushed);
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn max_sequence(&self) -> CoreResult<u64> {
        let durable_max = self.durable.max_sequence().await?;
        let unflushed_max = self
            .unflushed
            .lock()
            .values()
            .flatten()
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0);
        Ok(durable_max.max(unflushed_max))
    }

    async fn stats(&self) -> CoreResult<BackendStats> {
        let entries = self.cache.entries.lock();
        Ok(BackendStats {
            total_events: entries.values().map(|e| e.events.len() as u64).sum(),
            entity_count: entries.len() as u64,
        })
    }
}

/// Coalescing write-behind for materialized views: the queue holds at most
/// one (latest) record per key, flushed as upserts.
pub struct ViewWriteBehind {
    map_name: String,
    durable: Arc<dyn PersistenceBackend>,
    pending: Mutex<HashMap<String, ViewRecord>>,
    config: WriteBehindConfig,
    metrics: Arc<Metrics>,
}

impl ViewWriteBehind {
    /// A view write-behind persisting into `map_name` on `durable`.
    pub fn new(
        map_name: impl Into<String>,
        durable: Arc<dyn PersistenceBackend>,
        config: WriteBehindConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            durable,
            pending: Mutex::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// Queue `record` for the next flush, replacing any earlier queued
    /// state for the same key.
    pub fn record(&self, record: ViewRecord) {
        self.pending.lock().insert(record.entity_key.clone(), record);
    }

    /// Number of keys queued for the next flush.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Upsert one batch of queued records into the backing store. Returns
    /// how many keys were persisted; a failure re-queues anything that has
    /// not been overwritten by a newer state in the meantime.
    #[instrument(skip(self), fields(map_name = %self.map_name))]
    pub async fn flush_once(&self) -> usize {
        let drained: Vec<ViewRecord> = {
            let mut pending = self.pending.lock();
            let keys: Vec<String> = pending.keys().take(self.config.write_batch_size).cloned().collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        if drained.is_empty() {
            return 0;
        }

        let rows: Vec<PersistedView> = match drained.iter().map(PersistedView::from_record).collect() {
            Ok(rows) => rows,
            Err(err) => {
                self.metrics.incr_tagged("persistence.errors", &[("operation", "serialize_view")]);
                error!(error = %err, "view batch failed to serialize; dropping batch");
                return 0;
            }
        };

        let started = Instant::now();
        match self.durable.upsert_views(&self.map_name, &rows).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.metrics.add("persistence.store.count", rows.len() as u64);
                self.metrics.record_duration("persistence.store.duration", &[], elapsed);
                debug!(flushed = rows.len(), "flushed view batch to durable store");
                rows.len()
            }
            Err(err) => {
                self.metrics.incr_tagged("persistence.errors", &[("operation", "upsert_views")]);
                error!(error = %err, requeued = drained.len(), "view flush failed; batch re-queued for retry");
                let mut pending = self.pending.lock();
                for record in drained {
                    // A newer state queued during the flush wins.
                    pending.entry(record.entity_key.clone()).or_insert(record);
                }
                0
            }
        }
    }

    /// Load one record from the backing store.
    pub async fn load(&self, map_key: &str) -> CoreResult<Option<ViewRecord>> {
        let started = Instant::now();
        self.metrics.incr("persistence.load.count");
        // A queued-but-unflushed state is newer than anything durable.
        if let Some(pending) = self.pending.lock().get(map_key).cloned() {
            return Ok(Some(pending));
        }
        let loaded = self.durable.load_view(&self.map_name, map_key).await?;
        self.metrics.record_duration("persistence.load.duration", &[], started.elapsed());
        match loaded {
            Some(row) => Ok(Some(row.to_record()?)),
            None => {
                self.metrics.incr("persistence.load.miss");
                Ok(None)
            }
        }
    }

    /// Load every persisted record, for eager warm-up at startup.
    pub async fn load_all(&self) -> CoreResult<Vec<ViewRecord>> {
        let rows = self.durable.load_all_views(&self.map_name).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row.to_record()?);
        }
        info!(map_name = %self.map_name, loaded = records.len(), "eagerly loaded view map");
        Ok(records)
    }

    /// Spawn the background loop flushing queued records every
    /// `write_delay`.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let wb = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wb.config.write_delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                wb.flush_once().await;
            }
        })
    }
}
