//! Typed lifecycle events for a single relay connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything a relay connection can announce outside of subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connect,
    Disconnect,
    Error(String),
    Notice(String),
    /// NIP-42 challenge
    Auth(String),
}

impl RelayEvent {
    pub fn kind(&self) -> RelayEventKind {
        match self {
            RelayEvent::Connect => RelayEventKind::Connect,
            RelayEvent::Disconnect => RelayEventKind::Disconnect,
            RelayEvent::Error(_) => RelayEventKind::Error,
            RelayEvent::Notice(_) => RelayEventKind::Notice,
            RelayEvent::Auth(_) => RelayEventKind::Auth,
        }
    }
}

/// Listener table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayEventKind {
    Connect,
    Disconnect,
    Error,
    Notice,
    Auth,
}

/// Handle returned by `on`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    pub(crate) fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub type RelayEventListener = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

/// Per-connection dispatch table.
///
/// Listeners are called outside the table lock, so a listener may add or
/// remove listeners (including itself) while running.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<HashMap<RelayEventKind, Vec<(ListenerId, RelayEventListener)>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: RelayEventKind, listener: F) -> ListenerId
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns false if no such listener was registered.
    pub fn off(&self, kind: RelayEventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn emit(&self, event: &RelayEvent) {
        let snapshot: Vec<RelayEventListener> = self
            .listeners
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: RelayEventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }
}
