//! Materialized view store.
//!
//! Each entity key has exactly one view record, updated by a single atomic
//! per-key processor: read current record, apply the event's registered
//! update function, write back. Concurrent updates to different keys never
//! contend; concurrent updates to the same key serialize through that key's
//! lock. When a durable backing store is attached, every accepted update is
//! coalesced into its write-behind queue, the in-memory map stays bounded
//! (LRU plus an idle sweep, per the eviction config), and evicted or cold
//! keys are transparently reloaded on access — including on the update
//! path, so a fold after eviction lands on the durable state rather than an
//! empty document.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock as SyncRwLock};
use tracing::{debug, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::event::EventRecord;
use crate::store::{EventStore, EventStoreBackend};
use crate::write_behind::{EvictionConfig, ViewWriteBehind};

/// A materialized view record: an arbitrary JSON document plus the sequence
/// number of the last event folded into it, used to detect stale replays.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ViewRecord {
    /// The entity key this record represents.
    pub entity_key: String,
    /// The materialized document.
    pub fields: serde_json::Value,
    /// Sequence number of the last event applied.
    pub last_sequence: u64,
}

impl ViewRecord {
    /// A fresh, empty view record for `entity_key`.
    pub fn empty(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            fields: serde_json::json!({}),
            last_sequence: 0,
        }
    }
}

/// An event-type-keyed update function: given the event and the current
/// record (absent on first event for a key), produce the next record.
pub type ViewUpdateFn = Arc<dyn Fn(&EventRecord, Option<&ViewRecord>) -> ViewRecord + Send + Sync>;

/// Registry of per-event-type update functions, consulted by the view
/// store's atomic processor.
#[derive(Clone, Default)]
pub struct ViewUpdater {
    by_event_type: HashMap<String, ViewUpdateFn>,
}

impl ViewUpdater {
    /// An empty registry; every event type falls through to
    /// [`ViewUpdater::default_merge`] unless registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the update function for `event_type`.
    pub fn register(&mut self, event_type: impl Into<String>, f: ViewUpdateFn) -> &mut Self {
        self.by_event_type.insert(event_type.into(), f);
        self
    }

    fn apply(&self, event: &EventRecord, current: Option<&ViewRecord>) -> ViewRecord {
        match self.by_event_type.get(&event.event_type) {
            Some(f) => f(event, current),
            None => Self::default_merge(event, current),
        }
    }

    /// Fallback update: shallow-merge the event payload's fields into the
    /// current document. Used for event types with no registered handler so
    /// that an unmodeled event never silently drops.
    fn default_merge(event: &EventRecord, current: Option<&ViewRecord>) -> ViewRecord {
        let mut fields = current.map(|r| r.fields.clone()).unwrap_or(serde_json::json!({}));
        if let (Some(obj), Some(incoming)) = (fields.as_object_mut(), event.payload.fields.as_object()) {
            for (k, v) in incoming {
                obj.insert(k.clone(), v.clone());
            }
        }
        ViewRecord {
            entity_key: event.entity_key.clone(),
            fields,
            last_sequence: event.sequence.unwrap_or(0),
        }
    }
}

/// LRU and idle bookkeeping for the in-memory record map.
#[derive(Default)]
struct EvictionTracking {
    lru: Mutex<VecDeque<String>>,
    last_access: Mutex<HashMap<String, Instant>>,
}

/// The materialized view store. One [`ViewRecord`] per entity key, mutated
/// through a per-key lock so that updates for the same key never race while
/// updates for different keys run fully in parallel.
pub struct ViewStore {
    records: DashMap<String, Arc<SyncRwLock<ViewRecord>>>,
    updater: ViewUpdater,
    write_behind: Option<Arc<ViewWriteBehind>>,
    eviction: EvictionConfig,
    tracking: EvictionTracking,
}

impl ViewStore {
    /// A purely in-memory view store driven by `updater`. Without a backing
    /// store there is nowhere to reload an evicted record from, so the map
    /// is unbounded regardless of eviction settings.
    pub fn new(updater: ViewUpdater) -> Self {
        Self {
            records: DashMap::new(),
            updater,
            write_behind: None,
            eviction: EvictionConfig::default(),
            tracking: EvictionTracking::default(),
        }
    }

    /// A view store that coalesces every accepted update into
    /// `write_behind`'s queue, loads cold keys from it on miss, and bounds
    /// the in-memory map with the default eviction settings.
    pub fn with_write_behind(updater: ViewUpdater, write_behind: Arc<ViewWriteBehind>) -> Self {
        Self {
            records: DashMap::new(),
            updater,
            write_behind: Some(write_behind),
            eviction: EvictionConfig::default(),
            tracking: EvictionTracking::default(),
        }
    }

    /// Override the hot-cache bounds. Only meaningful with a backing store
    /// attached.
    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Eviction only runs when an evicted record can be reloaded.
    fn evicting(&self) -> bool {
        self.eviction.enabled && self.write_behind.is_some()
    }

    fn touch(&self, entity_key: &str) {
        if !self.evicting() {
            return;
        }
        self.tracking.last_access.lock().insert(entity_key.to_string(), Instant::now());
        let mut lru = self.tracking.lru.lock();
        lru.retain(|k| k != entity_key);
        lru.push_back(entity_key.to_string());
        while lru.len() > self.eviction.max_size {
            if let Some(evicted) = lru.pop_front() {
                self.records.remove(&evicted);
                self.tracking.last_access.lock().remove(&evicted);
                debug!(key = %evicted, "evicted least-recently-used view record");
            }
        }
    }

    fn forget(&self, entity_key: &str) {
        self.tracking.lru.lock().retain(|k| k != entity_key);
        self.tracking.last_access.lock().remove(entity_key);
    }

    /// Drop records untouched for longer than the configured idle horizon.
    /// Returns how many were evicted; they reload on next access.
    pub fn sweep_idle(&self) -> usize {
        let Some(max_idle) = self.eviction.max_idle else {
            return 0;
        };
        if !self.evicting() {
            return 0;
        }
        let now = Instant::now();
        let idle: Vec<String> = self
            .tracking
            .last_access
            .lock()
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &idle {
            self.records.remove(key);
            self.forget(key);
        }
        if !idle.is_empty() {
            debug!(evicted = idle.len(), "swept idle view records");
        }
        idle.len()
    }

    /// Spawn a background loop running [`ViewStore::sweep_idle`] every
    /// `interval`.
    pub fn spawn_idle_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep_idle();
            }
        })
    }

    /// The slot for `entity_key`, reloading an evicted record's durable
    /// state on a miss so updates never fold onto an empty document by
    /// accident.
    async fn slot_for(&self, entity_key: &str) -> CoreResult<Arc<SyncRwLock<ViewRecord>>> {
        if let Some(existing) = self.records.get(entity_key) {
            return Ok(existing.clone());
        }
        let seed = match &self.write_behind {
            Some(wb) => wb.load(entity_key).await?.unwrap_or_else(|| ViewRecord::empty(entity_key)),
            None => ViewRecord::empty(entity_key),
        };
        Ok(self
            .records
            .entry(entity_key.to_string())
            .or_insert_with(|| Arc::new(SyncRwLock::new(seed)))
            .clone())
    }

    /// Atomically fold `event` into the view record for its entity key:
    /// read current, apply, write back, all under one lock acquisition.
    /// Stale events (sequence at or below what's already applied) are
    /// skipped, making this idempotent under at-least-once redelivery.
    #[instrument(skip(self, event), fields(entity_key = %event.entity_key))]
    pub async fn apply_event(&self, event: &EventRecord) -> CoreResult<ViewRecord> {
        let slot = self.slot_for(&event.entity_key).await?;
        let next = {
            let mut guard = slot.write();
            if let Some(seq) = event.sequence {
                if seq <= guard.last_sequence && guard.last_sequence != 0 {
                    warn!(sequence = seq, last_sequence = guard.last_sequence, "skipping stale event");
                    return Ok(guard.clone());
                }
            }
            let next = self.updater.apply(event, Some(&guard));
            *guard = next.clone();
            next
        };
        self.touch(&event.entity_key);

        if let Some(wb) = &self.write_behind {
            wb.record(next.clone());
        }
        Ok(next)
    }

    /// The current record for `entity_key`, if one is materialized in
    /// memory. Never touches the backing store; use [`ViewStore::load`] for
    /// read-through semantics.
    pub fn get(&self, entity_key: &str) -> Option<ViewRecord> {
        let found = self.records.get(entity_key).map(|s| s.read().clone());
        if found.is_some() {
            self.touch(entity_key);
        }
        found
    }

    /// The record for `entity_key`, loading it from the backing store on a
    /// miss (and keeping it hot afterwards). Returns `None` if the key is
    /// unknown everywhere.
    pub async fn load(&self, entity_key: &str) -> CoreResult<Option<ViewRecord>> {
        if let Some(hot) = self.get(entity_key) {
            return Ok(Some(hot));
        }
        let Some(wb) = &self.write_behind else {
            return Ok(None);
        };
        match wb.load(entity_key).await? {
            Some(record) => {
                self.records
                    .insert(entity_key.to_string(), Arc::new(SyncRwLock::new(record.clone())));
                self.touch(entity_key);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Eagerly load every persisted record into memory, for warm starts.
    /// Returns how many records were hydrated; LRU bounding still applies.
    /// No-op without a backing store.
    pub async fn warm(&self) -> CoreResult<usize> {
        let Some(wb) = &self.write_behind else {
            return Ok(0);
        };
        let all = wb.load_all().await?;
        let count = all.len();
        for record in all {
            let key = record.entity_key.clone();
            self.records.insert(key.clone(), Arc::new(SyncRwLock::new(record)));
            self.touch(&key);
        }
        Ok(count)
    }

    /// Push one batch of queued write-behind records to the backing store
    /// immediately, returning how many keys flushed. No-op without one.
    pub async fn flush_write_behind(&self) -> usize {
        match &self.write_behind {
            Some(wb) => wb.flush_once().await,
            None => 0,
        }
    }

    /// Number of records currently materialized in memory.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are materialized.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Discard the view record for `entity_key`, then replay the full event
    /// history from `store` to rebuild it from scratch. Used for view
    /// schema migrations or after suspected corruption.
    #[instrument(skip(self, store), fields(entity_key = %entity_key))]
    pub async fn rebuild<B: EventStoreBackend>(&self, store: &EventStore<B>, entity_key: &str) -> CoreResult<ViewRecord> {
        self.records.remove(entity_key);
        self.forget(entity_key);
        let history = store.get_for_key(entity_key).await?;
        if history.is_empty() {
            return Err(CoreError::NotFound(entity_key.to_string()));
        }
        // Replay folds from scratch; the stale slot (in memory or durable)
        // must not seed it.
        self.records
            .insert(entity_key.to_string(), Arc::new(SyncRwLock::new(ViewRecord::empty(entity_key))));
        let mut last = ViewRecord::empty(entity_key);
        for event in &history {
            last = self.apply_event(event).await?;
        }
        Ok(last)
    }
}
