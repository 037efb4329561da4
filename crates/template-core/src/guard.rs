//! Reentrancy suppression and change coalescing.
//!
//! Three pieces keep the engine from chasing its own writes:
//! - [`OperationGuard`]: scoped "in progress" markers keyed by operation kind
//!   and document path. Notifications for a document with a marker held are
//!   dropped, not queued. Markers are released when the [`GuardToken`] drops,
//!   on every exit path.
//! - [`RecentWrites`]: remembers documents we just wrote so the host's echo
//!   notification is recognized once, within a short window.
//! - [`ChangeCoalescer`]: per-document quiet period. A burst of notifications
//!   for one path yields a single ready path once the burst settles.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

/// Kind of write-causing work held for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Processing a change notification.
    Change,
    /// Merging templates into a document.
    Apply,
    /// Pushing a template's property delta to bound documents.
    Propagate,
    /// Removing empty properties after a reference was dropped.
    Prune,
}

type HeldSet = Arc<Mutex<HashSet<(OperationKind, String)>>>;

#[derive(Clone, Default)]
pub struct OperationGuard {
    held: HeldSet,
}

impl OperationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `kind` for `path`, or `None` if it is already held.
    pub fn try_acquire(&self, kind: OperationKind, path: &str) -> Option<GuardToken> {
        let key = (kind, path.to_string());
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(GuardToken {
            held: Arc::clone(&self.held),
            key,
        })
    }

    /// Acquire `kind` for `path` only if nothing at all is held for `path`.
    pub fn try_acquire_idle(&self, kind: OperationKind, path: &str) -> Option<GuardToken> {
        let key = (kind, path.to_string());
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.iter().any(|(_, p)| p == path) {
            return None;
        }
        held.insert(key.clone());
        Some(GuardToken {
            held: Arc::clone(&self.held),
            key,
        })
    }

    /// Acquire `kind` for `path` unless `kind` or any of `blockers` is held
    /// for `path`.
    pub fn try_acquire_unless(
        &self,
        kind: OperationKind,
        path: &str,
        blockers: &[OperationKind],
    ) -> Option<GuardToken> {
        let key = (kind, path.to_string());
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held
            .iter()
            .any(|(k, p)| p == path && (*k == kind || blockers.contains(k)))
        {
            return None;
        }
        held.insert(key.clone());
        Some(GuardToken {
            held: Arc::clone(&self.held),
            key,
        })
    }

    pub fn is_held(&self, path: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(_, p)| p == path)
    }
}

/// Releases its marker on drop.
pub struct GuardToken {
    held: HeldSet,
    key: (OperationKind, String),
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Documents the engine wrote recently.
///
/// Mark a path before writing it; the next notification for that path within
/// the window is consumed as an echo. Marks older than the window are stale
/// and suppress nothing, so a dropped echo cannot swallow a later user edit.
#[derive(Clone)]
pub struct RecentWrites {
    written: Arc<Mutex<HashMap<String, Instant>>>,
    window: Duration,
}

impl RecentWrites {
    pub fn new(window: Duration) -> Self {
        Self {
            written: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    pub fn mark(&self, path: &str) {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), Instant::now());
    }

    /// Drop the mark, e.g. after the write failed.
    pub fn forget(&self, path: &str) {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// True once if `path` was marked within the window.
    pub fn consume(&self, path: &str) -> bool {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        // Opportunistic cleanup keeps the map bounded.
        written.retain(|_, at| at.elapsed() < self.window);
        written.remove(path).is_some()
    }
}

/// Coalesces bursts of change notifications per document.
///
/// Each [`notify`](Self::notify) pushes the path's deadline out by the quiet
/// period; the path is sent on the ready channel once no notification has
/// arrived for a full quiet period. Must be used inside a Tokio runtime.
#[derive(Clone)]
pub struct ChangeCoalescer {
    pending: Arc<Mutex<HashMap<String, Instant>>>,
    ready_tx: mpsc::UnboundedSender<String>,
    quiet: Duration,
}

impl ChangeCoalescer {
    pub fn new(quiet: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(Mutex::new(HashMap::new())),
                ready_tx,
                quiet,
            },
            ready_rx,
        )
    }

    pub fn notify(&self, path: &str) {
        let is_new = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), Instant::now())
            .is_none();

        if !is_new {
            debug!("Coalescing change for {}", path);
            return;
        }

        let pending = Arc::clone(&self.pending);
        let ready_tx = self.ready_tx.clone();
        let quiet = self.quiet;
        let path = path.to_string();
        tokio::spawn(async move {
            loop {
                let last = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&path)
                    .copied();
                let Some(last) = last else {
                    return;
                };

                let deadline = last + quiet;
                if Instant::now() >= deadline {
                    pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&path);
                    if ready_tx.send(path).is_err() {
                        error!("Change coalescer receiver dropped");
                    }
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        });
    }

    /// Paths still inside their quiet period.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
