//! Durable relational backing store contract and implementations.
//!
//! [`PersistedEvent`] is the portable row shape an event takes in durable
//! storage: the full record serialized as an opaque payload plus the
//! indexed columns queries need. The write-behind adapters in
//! [`crate::write_behind`] drive a [`PersistenceBackend`] asynchronously;
//! nothing on a hot path calls one of these methods directly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::event::EventRecord;
use crate::view::ViewRecord;

/// The row shape of one durably persisted event: indexed columns plus the
/// full record as an opaque payload, so a load returns a bitwise-identical
/// copy of what was stored.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PersistedEvent {
    /// Globally unique event id.
    pub event_id: String,
    /// The entity key the event applies to.
    pub aggregate_id: String,
    /// Aggregate kind, derived from the entity key's type prefix
    /// (`"order-1"` -> `"order"`).
    pub aggregate_type: String,
    /// Short event kind tag.
    pub event_type: String,
    /// The full serialized [`EventRecord`].
    pub payload: Vec<u8>,
    /// Correlates the event to the business request that produced it.
    pub correlation_id: String,
    /// The saga instance the event belongs to, if any.
    pub saga_id: Option<String>,
    /// The sequence number assigned at submission.
    pub sequence: u64,
    /// The event's creation timestamp.
    pub timestamp: DateTime<Utc>,
}

impl PersistedEvent {
    /// Flatten `event` into its durable row shape. Fails if the record
    /// cannot be serialized or carries no sequence yet.
    pub fn from_record(event: &EventRecord) -> CoreResult<Self> {
        let sequence = event.sequence.ok_or_else(|| CoreError::Store {
            operation: "persist".into(),
            message: format!("event {} has no sequence assigned", event.event_id),
        })?;
        let payload = serde_json::to_vec(event).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let aggregate_type = event
            .entity_key
            .split_once('-')
            .map(|(prefix, _)| prefix.to_string())
            .unwrap_or_default();
        Ok(Self {
            event_id: event.event_id.clone(),
            aggregate_id: event.entity_key.clone(),
            aggregate_type,
            event_type: event.event_type.clone(),
            payload,
            correlation_id: event.correlation_id.clone(),
            saga_id: event.saga.saga_id.clone(),
            sequence,
            timestamp: event.timestamp,
        })
    }

    /// Reconstruct the full [`EventRecord`] from the stored payload.
    pub fn to_record(&self) -> CoreResult<EventRecord> {
        serde_json::from_slice(&self.payload).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One durably persisted view row: the map it belongs to, its key within
/// that map, and the serialized record.
#[derive(Debug, Clone)]
pub struct PersistedView {
    /// Key within the map.
    pub map_key: String,
    /// The serialized [`ViewRecord`].
    pub payload: Vec<u8>,
}

impl PersistedView {
    /// Flatten a view record into its durable row shape.
    pub fn from_record(record: &ViewRecord) -> CoreResult<Self> {
        Ok(Self {
            map_key: record.entity_key.clone(),
            payload: serde_json::to_vec(record).map_err(|e| CoreError::Serialization(e.to_string()))?,
        })
    }

    /// Reconstruct the [`ViewRecord`] from the stored payload.
    pub fn to_record(&self) -> CoreResult<ViewRecord> {
        serde_json::from_slice(&self.payload).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Durable relational store contract. Event writes are inserts (re-inserting
/// an already-stored `(aggregate_id, sequence)` is an idempotent no-op, so a
/// retried flush of a partially persisted batch is safe); view writes are
/// latest-wins upserts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Durably persist a batch of events. Must tolerate rows that were
    /// already persisted by an earlier, partially failed flush.
    async fn persist_events(&self, events: &[PersistedEvent]) -> CoreResult<()>;

    /// All events for `aggregate_id`, ordered by sequence ascending.
    async fn load_events_for_key(&self, aggregate_id: &str) -> CoreResult<Vec<PersistedEvent>>;

    /// All events of one type, ordered by timestamp ascending.
    async fn load_events_by_type(&self, event_type: &str) -> CoreResult<Vec<PersistedEvent>>;

    /// All events whose timestamp falls in `[from, to]`, ordered by
    /// timestamp ascending.
    async fn load_events_in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<PersistedEvent>>;

    /// The highest persisted sequence number, 0 if empty.
    async fn max_sequence(&self) -> CoreResult<u64>;

    /// Upsert a batch of view rows into `map_name` (latest-wins per key).
    async fn upsert_views(&self, map_name: &str, views: &[PersistedView]) -> CoreResult<()>;

    /// Load one view row from `map_name`.
    async fn load_view(&self, map_name: &str, map_key: &str) -> CoreResult<Option<PersistedView>>;

    /// Load every view row in `map_name`, for eager warm-up.
    async fn load_all_views(&self, map_name: &str) -> CoreResult<Vec<PersistedView>>;
}

/// Durable store simulated in memory; the default backend for tests and for
/// deployments that plug in their own store.
#[derive(Default)]
pub struct InMemoryPersistenceBackend {
    events: Mutex<HashMap<String, Vec<PersistedEvent>>>,
    views: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryPersistenceBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryPersistenceBackend {
    async fn persist_events(&self, events: &[PersistedEvent]) -> CoreResult<()> {
        let mut rows = self.events.lock();
        for event in events {
            let bucket = rows.entry(event.aggregate_id.clone()).or_default();
            if bucket.iter().any(|e| e.sequence == event.sequence) {
                continue;
            }
            bucket.push(event.clone());
            bucket.sort_by_key(|e| e.sequence);
        }
        Ok(())
    }

    async fn load_events_for_key(&self, aggregate_id: &str) -> CoreResult<Vec<PersistedEvent>> {
        Ok(self.events.lock().get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn load_events_by_type(&self, event_type: &str) -> CoreResult<Vec<PersistedEvent>> {
        let mut matches: Vec<PersistedEvent> = self
            .events
            .lock()
            .values()
            .flatten()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.timestamp);
        Ok(matches)
    }

    async fn load_events_in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<PersistedEvent>> {
        let mut matches: Vec<PersistedEvent> = self
            .events
            .lock()
            .values()
            .flatten()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.timestamp);
        Ok(matches)
    }

    async fn max_sequence(&self) -> CoreResult<u64> {
        Ok(self
            .events
            .lock()
            .values()
            .flatten()
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0))
    }

    async fn upsert_views(&self, map_name: &str, views: &[PersistedView]) -> CoreResult<()> {
        let mut rows = self.views.lock();
        for view in views {
            rows.insert((map_name.to_string(), view.map_key.clone()), view.payload.clone());
        }
        Ok(())
    }

    async fn load_view(&self, map_name: &str, map_key: &str) -> CoreResult<Option<PersistedView>> {
        Ok(self
            .views
            .lock()
            .get(&(map_name.to_string(), map_key.to_string()))
            .map(|payload| PersistedView {
                map_key: map_key.to_string(),
                payload: payload.clone(),
            }))
    }

    async fn load_all_views(&self, map_name: &str) -> CoreResult<Vec<PersistedView>> {
        Ok(self
            .views
            .lock()
            .iter()
            .filter(|((name, _), _)| name == map_name)
            .map(|((_, key), payload)| PersistedView {
                map_key: key.clone(),
                payload: payload.clone(),
            })
            .collect())
    }
}

/// SQLite-backed durable store. Blocking `rusqlite` calls are dispatched
/// through `spawn_blocking` so the write-behind flush loop never stalls the
/// async runtime.
#[cfg(feature = "sqlite")]
pub struct SqlitePersistenceBackend {
    conn: std::sync::Arc<Mutex<rusqlite::Connection>>,
}

#[cfg(feature = "sqlite")]
fn sqlite_err(operation: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::Persistence {
        operation: operation.into(),
        message: e.to_string(),
    }
}

#[cfg(feature = "sqlite")]
impl SqlitePersistenceBackend {
    /// Open (or create) the SQLite database at `path` and ensure the event
    /// and view tables exist.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = rusqlite::Connection::open(path).map_err(|e| sqlite_err("open", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                event_id TEXT NOT NULL UNIQUE,
                aggregate_id TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload BLOB NOT NULL,
                correlation_id TEXT NOT NULL,
                saga_id TEXT,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (aggregate_id, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_events_event_id ON events (event_id);
            CREATE INDEX IF NOT EXISTS idx_events_event_type ON events (event_type);
            CREATE INDEX IF NOT EXISTS idx_events_saga_id ON events (saga_id);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at);
            CREATE TABLE IF NOT EXISTS views (
                map_name TEXT NOT NULL,
                map_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (map_name, map_key)
            );",
        )
        .map_err(|e| sqlite_err("create_schema", e))?;
        Ok(Self {
            conn: std::sync::Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedEvent> {
        let created_at: String = row.get(8)?;
        Ok(PersistedEvent {
            event_id: row.get(0)?,
            aggregate_id: row.get(1)?,
            aggregate_type: row.get(2)?,
            event_type: row.get(3)?,
            payload: row.get(4)?,
            correlation_id: row.get(5)?,
            saga_id: row.get(6)?,
            sequence: row.get::<_, i64>(7)? as u64,
            timestamp: created_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }

    async fn query_events(&self, operation: &'static str, sql: &'static str, param: Option<String>) -> CoreResult<Vec<PersistedEvent>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare(sql).map_err(|e| sqlite_err(operation, e))?;
            let rows = match &param {
                Some(p) => stmt.query_map(rusqlite::params![p], Self::row_to_event),
                None => stmt.query_map([], Self::row_to_event),
            }
            .map_err(|e| sqlite_err(operation, e))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| sqlite_err(operation, e))
        })
        .await
        .map_err(|e| sqlite_err(operation, e))?
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl PersistenceBackend for SqlitePersistenceBackend {
    async fn persist_events(&self, events: &[PersistedEvent]) -> CoreResult<()> {
        let conn = self.conn.clone();
        let events = events.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            for event in &events {
                conn.execute(
                    "INSERT OR IGNORE INTO events
                     (event_id, aggregate_id, aggregate_type, event_type, payload, correlation_id, saga_id, sequence, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        event.event_id,
                        event.aggregate_id,
                        event.aggregate_type,
                        event.event_type,
                        event.payload,
                        event.correlation_id,
                        event.saga_id,
                        event.sequence as i64,
                        event.timestamp.to_rfc3339(),
                    ],
                )
                .map_err(|e| sqlite_err("persist_events", e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| sqlite_err("persist_events", e))?
    }

    async fn load_events_for_key(&self, aggregate_id: &str) -> CoreResult<Vec<PersistedEvent>> {
        self.query_events(
            "load_events_for_key",
            "SELECT event_id, aggregate_id, aggregate_type, event_type, payload, correlation_id, saga_id, sequence, created_at
             FROM events WHERE aggregate_id = ?1 ORDER BY sequence ASC",
            Some(aggregate_id.to_string()),
        )
        .await
    }

    async fn load_events_by_type(&self, event_type: &str) -> CoreResult<Vec<PersistedEvent>> {
        self.query_events(
            "load_events_by_type",
            "SELECT event_id, aggregate_id, aggregate_type, event_type, payload, correlation_id, saga_id, sequence, created_at
             FROM events WHERE event_type = ?1 ORDER BY created_at ASC",
            Some(event_type.to_string()),
        )
        .await
    }

    async fn load_events_in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<PersistedEvent>> {
        let all = self
            .query_events(
                "load_events_in_range",
                "SELECT event_id, aggregate_id, aggregate_type, event_type, payload, correlation_id, saga_id, sequence, created_at
                 FROM events ORDER BY created_at ASC",
                None,
            )
            .await?;
        Ok(all.into_iter().filter(|e| e.timestamp >= from && e.timestamp <= to).collect())
    }

    async fn max_sequence(&self) -> CoreResult<u64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.query_row("SELECT COALESCE(MAX(sequence), 0) FROM events", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|v| v as u64)
            .map_err(|e| sqlite_err("max_sequence", e))
        })
        .await
        .map_err(|e| sqlite_err("max_sequence", e))?
    }

    async fn upsert_views(&self, map_name: &str, views: &[PersistedView]) -> CoreResult<()> {
        let conn = self.conn.clone();
        let map_name = map_name.to_string();
        let views = views.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            for view in &views {
                conn.execute(
                    "INSERT INTO views (map_name, map_key, payload) VALUES (?1, ?2, ?3)
                     ON CONFLICT (map_name, map_key) DO UPDATE SET payload = excluded.payload",
                    rusqlite::params![map_name, view.map_key, view.payload],
                )
                .map_err(|e| sqlite_err("upsert_views", e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| sqlite_err("upsert_views", e))?
    }

    async fn load_view(&self, map_name: &str, map_key: &str) -> CoreResult<Option<PersistedView>> {
        let conn = self.conn.clone();
        let map_name = map_name.to_string();
        let map_key = map_key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let result = conn.query_row(
                "SELECT payload FROM views WHERE map_name = ?1 AND map_key = ?2",
                rusqlite::params![map_name, map_key],
                |row| row.get::<_, Vec<u8>>(0),
            );
            match result {
                Ok(payload) => Ok(Some(PersistedView { map_key, payload })),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(sqlite_err("load_view", e)),
            }
        })
        .await
        .map_err(|e| sqlite_err("load_view", e))?
    }

    async fn load_all_views(&self, map_name: &str) -> CoreResult<Vec<PersistedView>> {
        let conn = self.conn.clone();
        let map_name = map_name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare("SELECT map_key, payload FROM views WHERE map_name = ?1")
                .map_err(|e| sqlite_err("load_all_views", e))?;
            let rows = stmt
                .query_map(rusqlite::params![map_name], |row| {
                    Ok(PersistedView {
                        map_key: row.get(0)?,
                        payload: row.get(1)?,
                    })
                })
                .map_err(|e| sqlite_err("load_all_views", e))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| sqlite_err("load_all_views", e))
        })
        .await
        .map_err(|e| sqlite_err("load_all_views", e))?
    }
}
