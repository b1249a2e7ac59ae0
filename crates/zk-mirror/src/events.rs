//! Change notification infrastructure.
//!
//! Provides `TreeEvent` for tree-level observers and a generic `EventBus`
//! used both by the mirror's listener hub and by per-node property listeners.

use crate::node::NodeRecord;
use crate::session::SessionState;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::error;

/// Tree-level change published to mirror subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TreeEvent {
    /// A node became live (first observation or revival of a tombstone).
    NodeCreated {
        node: NodeRecord,
    },
    /// A live node was tombstoned and spliced out of its parent's child list.
    NodeDeleted {
        node: NodeRecord,
        /// Position in the parent's child list before removal.
        index: usize,
    },
    /// Data or stat of a live node changed.
    NodeDataChanged {
        node: NodeRecord,
    },
    /// The session moved to a new state.
    SessionStateChanged {
        state: SessionState,
    },
    /// A subtree could not be (fully) populated.
    PopulateFailed {
        path: String,
        error: String,
    },
    /// A watch could not be re-registered; retried on the next reconnect.
    WatchRearmFailed {
        path: String,
        error: String,
    },
}

impl TreeEvent {
    /// The node this event is about, if any.
    pub fn node(&self) -> Option<&NodeRecord> {
        match self {
            TreeEvent::NodeCreated { node }
            | TreeEvent::NodeDeleted { node, .. }
            | TreeEvent::NodeDataChanged { node } => Some(node),
            _ => None,
        }
    }
}

/// Something a `Subscription` can detach itself from.
trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or call [`Subscription::cancel`]) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    target: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(target) = self.target.upgrade() {
            target.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions. A panicking callback
/// is logged and counted, and the remaining callbacks still run.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
    failures: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let target: Arc<dyn Unsubscribe> = self.clone();
        Subscription {
            target: Arc::downgrade(&target),
            id,
        }
    }

    /// Emit an event to all subscribers, returning how many of them panicked.
    pub fn emit(&self, event: &E) -> usize {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        let mut failed = 0;
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Listener {} panicked while handling an event", id);
                failed += 1;
            }
        }
        if failed > 0 {
            self.failures.fetch_add(failed, Ordering::Relaxed);
        }
        failed
    }

    /// Number of subscribers currently registered.
    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total listener panics seen since creation.
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl<E: Send + Sync + 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}
