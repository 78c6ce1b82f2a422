//! Event-Verteilung des SignalingClients
//!
//! Handler werden pro Event-Typ registriert. Ein Handler, der paniciert,
//! wird geloggt und hält die übrigen Handler nicht auf.

use super::client::SignalingError;
use super::socket::CloseInfo;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Connection,
    Message,
    Close,
    Error,
}

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Verbindung geöffnet
    Connection,

    /// Gültiger JSON-Frame vom Relay
    Message(serde_json::Value),

    /// Verbindung geschlossen
    Close(CloseInfo),

    /// Nicht-fataler Fehler (oder das endgültige Aufgeben des Reconnects)
    Error(SignalingError),
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Connection => TransportEventKind::Connection,
            TransportEvent::Message(_) => TransportEventKind::Message,
            TransportEvent::Close(_) => TransportEventKind::Close,
            TransportEvent::Error(_) => TransportEventKind::Error,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Handle einer Registrierung; `unsubscribe()` entfernt genau diesen Handler
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    handlers: HashMap<TransportEventKind, Vec<(u64, EventHandler)>>,
}

#[derive(Default)]
pub(crate) struct EventBus {
    table: RwLock<HandlerTable>,
}

impl EventBus {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        kind: TransportEventKind,
        handler: EventHandler,
    ) -> Subscription {
        let id = {
            let mut table = self.table.write();
            table.next_id += 1;
            let id = table.next_id;
            table.handlers.entry(kind).or_default().push((id, handler));
            id
        };

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.remove(kind, id);
            }
        })
    }

    fn remove(&self, kind: TransportEventKind, id: u64) {
        let mut table = self.table.write();
        if let Some(handlers) = table.handlers.get_mut(&kind) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, kind: TransportEventKind) -> usize {
        self.table
            .read()
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let kind = event.kind();

        // Handler außerhalb des Locks aufrufen, sonst blockiert ein
        // (un)subscribe aus einem Handler heraus
        let handlers: Vec<EventHandler> = self
            .table
            .read()
            .handlers
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                tracing::error!(
                    "Transport {:?} handler panicked: {}",
                    kind,
                    panic_message(&panic)
                );
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let bus = Arc::new(EventBus::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let sub_first = bus.subscribe(TransportEventKind::Connection, counting_handler(&first));
        let _sub_second = bus.subscribe(TransportEventKind::Connection, counting_handler(&second));

        bus.emit(TransportEvent::Connection);
        sub_first.unsubscribe();
        bus.emit(TransportEvent::Connection);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(bus.handler_count(TransportEventKind::Connection), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = Arc::new(EventBus::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let _boom = bus.subscribe(
            TransportEventKind::Message,
            Arc::new(|_| panic!("handler exploded")),
        );
        let _counting = bus.subscribe(TransportEventKind::Message, counting_handler(&counter));

        bus.emit(TransportEvent::Message(serde_json::json!({ "ok": true })));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_only_reach_their_kind() {
        let bus = Arc::new(EventBus::default());
        let closes = Arc::new(AtomicUsize::new(0));
        let _sub = bus.subscribe(TransportEventKind::Close, counting_handler(&closes));

        bus.emit(TransportEvent::Connection);
        bus.emit(TransportEvent::Error(SignalingError::NotConnected));
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        bus.emit(TransportEvent::Close(CloseInfo::normal("bye")));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
