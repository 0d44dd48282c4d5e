#![expect(
    clippy::module_name_repetitions,
    reason = "Listener types expose their domain in the name for clarity"
)]

//! Event listener bookkeeping shared by the manager and the transports.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};

/// Callback invoked with the payload of a dispatched event.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Name of the event emitted after a transport is opened and listeners are attached.
pub const CONNECT: &str = "connect";
/// Name of the event emitted when a live connection ends.
pub const DISCONNECT: &str = "disconnect";
/// Name of the event emitted before each backoff wait.
pub const RECONNECTING: &str = "reconnecting";
/// Name of the event emitted when the retry budget is exhausted.
pub const ERROR: &str = "error";

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by `on`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Connection lifecycle notifications raised by the manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connect,
    Disconnect { reason: String },
    Reconnecting { attempt: u32, reason: String },
    Error { reason: String },
}

impl LifecycleEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect => CONNECT,
            Self::Disconnect { .. } => DISCONNECT,
            Self::Reconnecting { .. } => RECONNECTING,
            Self::Error { .. } => ERROR,
        }
    }

    /// Payload handed to listeners registered under [`Self::name`].
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Connect => Value::Null,
            Self::Disconnect { reason } | Self::Error { reason } => Value::String(reason.clone()),
            Self::Reconnecting { attempt, reason } => json!({
                "attempt": attempt,
                "reason": reason,
            }),
        }
    }

    /// Lifecycle names are raised by the manager only and never bound to a transport.
    #[must_use]
    pub fn is_reserved(event: &str) -> bool {
        matches!(event, CONNECT | DISCONNECT | RECONNECTING | ERROR)
    }
}

struct Entry {
    id: ListenerId,
    listener: Listener,
}

/// Ordered mapping from event name to callbacks.
///
/// Insertion order is dispatch order. Dispatch runs on a snapshot so callbacks
/// may register or remove listeners without deadlocking.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<HashMap<String, Vec<Entry>>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener under a fresh id.
    pub fn insert(&self, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId::next();
        self.insert_with_id(id, event, listener);
        id
    }

    /// Append a listener under an id allocated elsewhere, e.g. when re-attaching.
    pub fn insert_with_id(&self, id: ListenerId, event: &str, listener: Listener) {
        self.lock()
            .entry(event.to_owned())
            .or_default()
            .push(Entry { id, listener });
    }

    /// Remove a listener from whichever event it was registered under.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let mut removed = false;
        entries.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|entry| entry.id != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Invoke every listener for `event` in registration order. Returns how many ran.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let listeners = self.listeners(event);
        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    #[must_use]
    pub fn listeners(&self, event: &str) -> Vec<Listener> {
        self.lock()
            .get(event)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
            .unwrap_or_default()
    }

    /// Every registration, grouped by event and in insertion order within each event.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ListenerId, Listener)> {
        let entries = self.lock();
        let mut out = Vec::new();
        for (event, listeners) in entries.iter() {
            for entry in listeners {
                out.push((event.clone(), entry.id, Arc::clone(&entry.listener)));
            }
        }
        out
    }

    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // The map has no intermediate state a panicking callback could leave behind.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.lock();
        let mut map = f.debug_map();
        for (event, listeners) in entries.iter() {
            map.entry(event, &listeners.len());
        }
        map.finish()
    }
}
