//! Pending-completion tracking for submitted events.
//!
//! The controller registers a completion entry per submitted event, keyed
//! by its partitioned sequence key, and hands the caller a
//! [`CompletionHandle`] to await. The pipeline resolves the entry at its
//! complete stage. A periodic sweep evicts entries that have waited past
//! the configured horizon, failing their handles and counting them as
//! `completions.orphaned` — a completion arriving after that point finds no
//! pending entry and is dropped, the caller having long since been failed.
//!
//! Cancellation is advisory: cancelling a handle removes the pending entry
//! and abandons notification, but the pipeline still completes the event.
//! Submission is not a transaction to roll back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sagaflow_core::{Metrics, PartitionedSequenceKey, ViewRecord};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::error::{PipelineError, PipelineResult};

/// What the caller learns when its event clears the pipeline.
#[derive(Debug, Clone)]
pub struct CompletionInfo {
    /// The key the event was processed under.
    pub key: PartitionedSequenceKey,
    /// The completed event's id.
    pub event_id: String,
    /// The view record after folding this event in.
    pub view: ViewRecord,
    /// When the pipeline's complete stage ran.
    pub completed_at: DateTime<Utc>,
}

struct PendingCompletion {
    tx: oneshot::Sender<PipelineResult<CompletionInfo>>,
    registered_at: Instant,
}

/// Pending and completed entries for one service's pipeline.
pub struct CompletionTracker {
    pending: DashMap<String, PendingCompletion>,
    completions: DashMap<String, CompletionInfo>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl CompletionTracker {
    /// A tracker orphaning pending entries older than `timeout`.
    pub fn new(timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            pending: DashMap::new(),
            completions: DashMap::new(),
            timeout,
            metrics,
        }
    }

    fn update_gauge(&self) {
        self.metrics.set_gauge("pending.completions", self.pending.len() as i64);
    }

    /// Register a pending completion for `key`, returning the handle the
    /// submitting caller awaits.
    pub fn register(self: &Arc<Self>, key: &PartitionedSequenceKey) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            key.to_string(),
            PendingCompletion {
                tx,
                registered_at: Instant::now(),
            },
        );
        self.update_gauge();
        CompletionHandle {
            key: key.clone(),
            rx,
            tracker: self.clone(),
        }
    }

    /// Resolve `key` successfully: record it in the completion map and wake
    /// the waiting handle, if one is still registered.
    pub fn resolve_ok(&self, key: &PartitionedSequenceKey, info: CompletionInfo) {
        self.completions.insert(key.to_string(), info.clone());
        if let Some((_, pending)) = self.pending.remove(&key.to_string()) {
            let _ = pending.tx.send(Ok(info));
        } else {
            debug!(key = %key, "completion arrived for an orphaned or cancelled entry");
        }
        self.update_gauge();
    }

    /// Resolve `key` as failed, waking the waiting handle with `error`.
    pub fn resolve_err(&self, key: &PartitionedSequenceKey, error: PipelineError) {
        if let Some((_, pending)) = self.pending.remove(&key.to_string()) {
            let _ = pending.tx.send(Err(error));
        }
        self.update_gauge();
    }

    /// The completion recorded for `key`, if the pipeline has finished it.
    pub fn completion_for(&self, key: &PartitionedSequenceKey) -> Option<CompletionInfo> {
        self.completions.get(&key.to_string()).map(|c| c.clone())
    }

    /// Number of completions currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn remove_pending(&self, key: &PartitionedSequenceKey) {
        self.pending.remove(&key.to_string());
        self.update_gauge();
    }

    /// Evict every pending entry older than the timeout, failing its
    /// handle. Returns how many entries were orphaned.
    #[instrument(skip(self))]
    pub fn sweep_orphans(&self) -> usize {
        let now = Instant::now();
        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(e.value().registered_at) > self.timeout)
            .map(|e| e.key().clone())
            .collect();

        for key in &orphaned {
            if let Some((_, pending)) = self.pending.remove(key) {
                warn!(key = %key, "pending completion orphaned after timeout");
                self.metrics.incr("completions.orphaned");
                let _ = pending.tx.send(Err(PipelineError::PendingCompletionTimeout {
                    key: key.clone(),
                }));
            }
        }
        self.update_gauge();
        orphaned.len()
    }

    /// Spawn the periodic orphan sweep. Runs at a fraction of the timeout
    /// so an entry is orphaned soon after crossing the horizon rather than
    /// up to a full horizon late.
    pub fn spawn_sweep_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        let interval = (tracker.timeout / 4).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracker.sweep_orphans();
            }
        })
    }
}

/// The caller's side of one pending completion.
pub struct CompletionHandle {
    key: PartitionedSequenceKey,
    rx: oneshot::Receiver<PipelineResult<CompletionInfo>>,
    tracker: Arc<CompletionTracker>,
}

impl CompletionHandle {
    /// The key this handle is waiting on.
    pub fn key(&self) -> &PartitionedSequenceKey {
        &self.key
    }

    /// Wait for the pipeline to complete (or fail, or orphan) the event.
    pub async fn wait(self) -> PipelineResult<CompletionInfo> {
        match self.rx.await {
            Ok(result) => result,
            // The tracker dropped the sender without resolving; treat the
            // same as an orphaned entry.
            Err(_) => Err(PipelineError::PendingCompletionTimeout {
                key: self.key.to_string(),
            }),
        }
    }

    /// Abandon this completion: the pending entry is removed and no
    /// notification will arrive, but the pipeline still processes the
    /// event.
    pub fn cancel(self) {
        self.tracker.remove_pending(&self.key);
    }
}
