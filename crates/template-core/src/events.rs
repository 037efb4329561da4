//! Observer channel for UI collaborators.
//!
//! The engine publishes which documents it rewrote so a view layer can refresh
//! or highlight template-derived properties. Nothing in the engine depends on
//! whether anyone is listening.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TemplateEvent {
    /// Documents whose frontmatter the engine rewrote.
    DocumentsChanged {
        /// Operation that caused the writes ("apply", "propagate", "prune").
        operation: String,
        paths: Vec<String>,
    },
    /// A destructive template edit was declined and reverted.
    ChangeDeclined {
        template: String,
        /// Properties that would have been deleted from bound documents.
        properties: Vec<String>,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(TemplateEvent) + Send + Sync>;

/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(TemplateEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit(&self, event: TemplateEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
