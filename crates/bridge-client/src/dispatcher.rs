//! Typed publish/subscribe bus for inbound messages and local events.
//!
//! Every inbound message reaches the bus whether or not it also matched a
//! pending request; push notifications and correlated responses share the
//! delivery path.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chromabridge_protocol::constants::MessageKind;
use tracing::warn;

use crate::types::BridgeEvent;

/// A registered event listener.
pub type Listener = Box<dyn Fn(&BridgeEvent) + Send + Sync>;

/// Handle returned from [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct BusInner {
    next_id: u64,
    listeners: HashMap<MessageKind, Vec<(u64, Arc<Listener>)>>,
}

/// Per-kind listener registry.
pub struct EventBus {
    inner: std::sync::Mutex<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(BusInner {
                next_id: 1,
                listeners: HashMap::new(),
            }),
        }
    }

    /// Registers a listener for a message kind.
    pub fn on(&self, kind: MessageKind, listener: Listener) -> ListenerId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Unregisters a listener. Returns `true` if it was registered.
    pub fn off(&self, kind: MessageKind, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = inner.listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id.0);
        before != list.len()
    }

    /// Delivers an event to every listener registered for its kind.
    ///
    /// A panicking listener is isolated and logged; the remaining
    /// listeners still run. Listeners are invoked outside the registry
    /// lock so they may call [`on`](Self::on)/[`off`](Self::off).
    pub fn emit(&self, event: &BridgeEvent) {
        let targets: Vec<Arc<Listener>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .listeners
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        for listener in targets {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(kind = ?event.kind(), "event listener panicked");
            }
        }
    }
}
