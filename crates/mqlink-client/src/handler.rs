//! User handler trait for inbound dispatch.
//!
//! Implement [`Handler`] to receive connection lifecycle changes and
//! broker-originated messages. All methods have default implementations
//! that do nothing. Hooks run on the engine's own task: a hook that blocks
//! stalls inbound dispatch, which is the intended backpressure mechanism.
//! For QoS 1 and QoS 2 the message is delivered before the acknowledgement
//! is queued, so a handler that panics prevents the ack and the broker
//! redelivers.

use bytes::Bytes;
use mqlink_core::QoS;

use crate::error::ClientError;

/// Connection status reported to the handler and the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Up,
    Down,
}

/// Result of a subscription change, reported per topic filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// The server accepted the subscription at this maximum QoS.
    Granted(QoS),
    /// The server refused the subscription.
    Refused,
    /// The subscription was removed (UNSUBACK received).
    Removed,
}

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Quality of Service level it was delivered with.
    pub qos: QoS,
    /// Whether this is a retained message.
    pub retain: bool,
}

impl Message {
    /// The topic split into its `/`-separated levels.
    pub fn topic_levels(&self) -> impl Iterator<Item = &str> {
        self.topic.split('/')
    }
}

/// Handler trait for engine events.
pub trait Handler: Send + 'static {
    /// Called when the connection goes up (CONNACK accepted) or down
    /// (socket lost; a reconnect will follow).
    #[allow(unused_variables)]
    fn on_connection(&mut self, status: ConnectionStatus) {}

    /// Called for every message delivered by the broker.
    #[allow(unused_variables)]
    fn on_message(&mut self, message: Message) {}

    /// Called when a subscription is granted, refused, or removed.
    #[allow(unused_variables)]
    fn on_subscription(&mut self, filter: &str, status: SubscriptionStatus) {}

    /// Called once when the engine stops. `None` means a graceful
    /// disconnect; `Some(err)` carries the fatal exit reason.
    #[allow(unused_variables)]
    fn on_terminate(&mut self, reason: Option<&ClientError>) {}
}

/// A handler that ignores everything.
pub struct NoopHandler;

impl Handler for NoopHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_levels() {
        let msg = Message {
            topic: "a/b/c".to_string(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
        };
        let levels: Vec<&str> = msg.topic_levels().collect();
        assert_eq!(levels, vec!["a", "b", "c"]);
    }
}
