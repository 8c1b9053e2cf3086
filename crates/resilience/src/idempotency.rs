//! Idempotency guard: deduplicates at-least-once delivery by keying on a
//! caller-supplied idempotency key and remembering the claim for a bounded
//! time-to-live.
//!
//! Saga listeners and orchestrator step executors check this first; a
//! duplicate delivery within the TTL means the handler must skip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, instrument};

/// A remembered result: either still in flight (another caller got there
/// first and hasn't finished) or a completed value.
#[derive(Clone)]
enum Slot<T> {
    InFlight,
    Done { value: T, expires_at: Instant },
}

/// Outcome of [`IdempotencyGuard::begin`].
pub enum BeginOutcome<T> {
    /// No prior attempt is known; the caller should execute the operation
    /// and call [`IdempotencyGuard::complete`] with the result.
    Proceed,
    /// A prior attempt already completed; here is its (still valid) result.
    AlreadyCompleted(T),
    /// A prior attempt is currently in flight on another task.
    InFlight,
}

/// Put-if-absent guard with TTL expiry, keyed by an arbitrary idempotency
/// key (typically `eventId` or `(sagaId, stepName)`).
pub struct IdempotencyGuard<T: Clone + Send + Sync + 'static = ()> {
    slots: Arc<DashMap<String, Slot<T>>>,
    ttl: Duration,
    duplicates: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> IdempotencyGuard<T> {
    /// A guard remembering completed results for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ttl,
            duplicates: AtomicU64::new(0),
        }
    }

    /// Claim `event_id` for processing. Returns `true` only on the first
    /// delivery within the TTL; `false` means a duplicate the handler must
    /// skip. The claim is recorded immediately (put-if-absent), so two
    /// concurrent deliveries of the same id can never both see `true`.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn try_process(&self, event_id: &str) -> bool
    where
        T: Default,
    {
        match self.begin(event_id) {
            BeginOutcome::Proceed => {
                self.complete(event_id, T::default());
                true
            }
            BeginOutcome::AlreadyCompleted(_) | BeginOutcome::InFlight => {
                debug!(event_id = %event_id, "duplicate delivery skipped");
                false
            }
        }
    }

    /// Number of duplicate deliveries rejected so far, surfaced as the
    /// `idempotency.duplicates` counter.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Claim `key` for execution. Returns [`BeginOutcome::Proceed`] only for
    /// the first caller; concurrent or repeat callers get the in-flight or
    /// completed outcome instead, counted as duplicates.
    #[instrument(skip(self), fields(key = %key))]
    pub fn begin(&self, key: &str) -> BeginOutcome<T> {
        if let Some(mut existing) = self.slots.get_mut(key) {
            return match &*existing {
                Slot::InFlight => {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    BeginOutcome::InFlight
                }
                Slot::Done { value, expires_at } => {
                    if Instant::now() < *expires_at {
                        self.duplicates.fetch_add(1, Ordering::Relaxed);
                        BeginOutcome::AlreadyCompleted(value.clone())
                    } else {
                        *existing = Slot::InFlight;
                        BeginOutcome::Proceed
                    }
                }
            };
        }
        match self.slots.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                BeginOutcome::InFlight
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Slot::InFlight);
                BeginOutcome::Proceed
            }
        }
    }

    /// Record the result of an operation claimed via [`begin`], making it
    /// visible to subsequent callers until the guard's TTL elapses.
    #[instrument(skip(self, value), fields(key = %key))]
    pub fn complete(&self, key: &str, value: T) {
        let expires_at = Instant::now() + self.ttl;
        self.slots.insert(key.to_string(), Slot::Done { value, expires_at });
    }

    /// Release a claim without recording a result, e.g. after the guarded
    /// operation failed and should be retryable by the next caller.
    pub fn abandon(&self, key: &str) {
        self.slots.remove(key);
    }

    /// Drop every entry whose TTL has expired. Call periodically (the
    /// composition root spawns a sweep task) to bound memory.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::InFlight => true,
            Slot::Done { expires_at, .. } => *expires_at > now,
        });
        let removed = before - self.slots.len();
        if removed > 0 {
            debug!(removed, "swept expired idempotency entries");
        }
    }

    /// Number of entries currently tracked (in-flight or completed, expired
    /// or not).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
