use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

/// Handler for one event type. Receives the parsed JSON payload.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::add_listener`]; pass it back to
/// [`ListenerRegistry::remove_listener`] to unregister.
#[derive(Debug)]
pub struct ListenerHandle {
    event_type: String,
    id: u64,
}

/// Multicast registry mapping event types to handler sets.
///
/// Application-level listener registration is decoupled from the connection:
/// handlers can be added and removed regardless of whether the underlying
/// channel is currently connected, and a single dispatched event fans out to
/// every handler registered for its type.
pub struct ListenerRegistry {
    handlers: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, event_type: &str, handler: EventHandler) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        debug!(event_type, "Registered event listener");
        ListenerHandle {
            event_type: event_type.to_string(),
            id,
        }
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        let mut handlers = self.handlers.lock();
        if let Some(set) = handlers.get_mut(&handle.event_type) {
            set.retain(|(id, _)| *id != handle.id);
            if set.is_empty() {
                handlers.remove(&handle.event_type);
            }
            debug!(event_type = %handle.event_type, "Removed event listener");
        }
    }

    /// Fan an event out to every handler registered for its type. Handlers
    /// are invoked outside the registry lock so they may add or remove
    /// listeners themselves.
    pub fn dispatch(&self, event_type: &str, payload: &Value) {
        let targets: Vec<EventHandler> = {
            let handlers = self.handlers.lock();
            match handlers.get(event_type) {
                Some(set) => set.iter().map(|(_, h)| h.clone()).collect(),
                None => {
                    trace!(event_type, "No listeners for event");
                    return;
                }
            }
        };
        for handler in targets {
            handler(payload);
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
