//! Process-wide event bus.
//!
//! The engine emits three event kinds, each keyed by client id: connection
//! status, ping round-trip times, and new connection handles. Subscribers
//! register for a specific `(client_id, kind)` pair or for a kind across
//! all clients, and receive events over an unbounded channel. Closed
//! receivers are pruned on the next publish.

use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::client::ConnectionHandle;
use crate::handler::ConnectionStatus;

/// An event published by a connection engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection came up or went down.
    Status {
        client_id: String,
        status: ConnectionStatus,
    },
    /// A PINGRESP arrived; round-trip time of the keep-alive exchange.
    PingResponse { client_id: String, rtt: Duration },
    /// A new connection was established; carries the live handle.
    Connection {
        client_id: String,
        handle: ConnectionHandle,
    },
}

impl Event {
    pub fn client_id(&self) -> &str {
        match self {
            Event::Status { client_id, .. }
            | Event::PingResponse { client_id, .. }
            | Event::Connection { client_id, .. } => client_id,
        }
    }

    fn kind(&self) -> EventKind {
        match self {
            Event::Status { .. } => EventKind::Status,
            Event::PingResponse { .. } => EventKind::PingResponse,
            Event::Connection { .. } => EventKind::Connection,
        }
    }
}

/// The three event kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Status,
    PingResponse,
    Connection,
}

struct Subscriber {
    /// `None` subscribes across all client ids.
    client_id: Option<String>,
    kind: EventKind,
    tx: mpsc::UnboundedSender<Event>,
}

/// Registry of event subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    /// Subscribe to events of `kind`, either for one client id or, with
    /// `None`, for every client in the process.
    pub fn subscribe(
        &self,
        client_id: Option<&str>,
        kind: EventKind,
    ) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber {
            client_id: client_id.map(str::to_string),
            kind,
            tx,
        });
        rx
    }

    /// Deliver an event to every matching subscriber, dropping the ones
    /// whose receivers are gone.
    pub(crate) fn publish(&self, event: Event) {
        let kind = event.kind();
        let client_id = event.client_id().to_string();

        self.subscribers.write().retain(|sub| {
            if sub.kind != kind {
                return !sub.tx.is_closed();
            }
            if let Some(ref id) = sub.client_id {
                if *id != client_id {
                    return !sub.tx.is_closed();
                }
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

/// The process-wide event bus instance.
pub fn bus() -> &'static EventBus {
    static BUS: OnceLock<EventBus> = OnceLock::new();
    BUS.get_or_init(EventBus::default)
}
