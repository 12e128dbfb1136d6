//! Session state tracking: the QoS 1/2 in-flight machines.
//!
//! Client-side session state per MQTT spec section 6.1:
//! - QoS 1 and QoS 2 messages sent but not completely acknowledged
//! - QoS 2 messages received but not completely acknowledged
//!
//! Key requirements:
//! - [MQTT-4.4.0-1] On reconnect with CleanSession=0, re-send
//!   unacknowledged messages with DUP=1
//! - [MQTT-4.6.0-1] Re-send in the order originally sent
//!
//! Outbound QoS 1 and QoS 2 records live in a single insertion-ordered
//! queue so replay preserves submission order across QoS classes.

use std::collections::{HashMap, VecDeque};

use mqlink_core::{Packet, Publish, QoS};

/// State of an outbound QoS 1/2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// Accepted from the caller but not yet on the wire (submitted while
    /// disconnected). Sent without DUP once the connection is up.
    Unsent,
    /// PUBLISH on the wire; awaiting PUBACK (QoS 1) or PUBREC (QoS 2).
    PublishSent,
    /// QoS 2 only: PUBREC received and PUBREL sent; awaiting PUBCOMP.
    PubrelSent,
}

/// An outbound QoS 1 or QoS 2 publish that has not reached its terminal ack.
#[derive(Debug, Clone)]
pub struct OutboundPublish {
    pub packet_id: u16,
    pub publish: Publish,
    pub state: OutboundState,
}

/// Outcome of applying a PUBCOMP to the tracker.
#[derive(Debug, PartialEq, Eq)]
pub enum PubcompOutcome {
    /// The QoS 2 exchange completed; the identifier can be released.
    Completed,
    /// No record in the PUBREL-sent state: the PUBCOMP was not preceded
    /// by a PUBREC, which is a protocol violation.
    NotPreceded,
}

/// Client session state.
///
/// Mutated only by the connection engine; survives reconnects within the
/// process and is wiped on clean-session connects.
#[derive(Debug, Default)]
pub struct Session {
    /// In-flight outbound QoS 1/2 publishes in submission order.
    outbound: VecDeque<OutboundPublish>,
    /// Inbound QoS 2 publishes held until PUBREL, keyed by identifier.
    inbound_qos2: HashMap<u16, Publish>,
    /// QoS 0 publishes accepted while disconnected, flushed on connect.
    queued_qos0: VecDeque<Publish>,
    /// Granted subscriptions, authoritative only after SUBACK.
    subscriptions: Vec<(String, QoS)>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all session state (clean-session connect).
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound_qos2.clear();
        self.queued_qos0.clear();
        self.subscriptions.clear();
    }

    // === Outbound QoS 1/2 ===

    /// Track a new outbound QoS 1/2 publish. The publish must carry its
    /// packet identifier and `dup=false`.
    pub fn push_outbound(&mut self, packet_id: u16, publish: Publish) {
        debug_assert!(publish.qos != QoS::AtMostOnce);
        debug_assert_eq!(publish.packet_id, Some(packet_id));
        self.outbound.push_back(OutboundPublish {
            packet_id,
            publish,
            state: OutboundState::Unsent,
        });
    }

    /// Record that the publish went out on the wire.
    pub fn mark_sent(&mut self, packet_id: u16) {
        if let Some(record) = self.outbound_mut(packet_id) {
            if record.state == OutboundState::Unsent {
                record.state = OutboundState::PublishSent;
            }
        }
    }

    /// Apply a PUBACK: remove the matching QoS 1 record.
    pub fn complete_qos1(&mut self, packet_id: u16) -> Option<OutboundPublish> {
        let pos = self
            .outbound
            .iter()
            .position(|r| r.packet_id == packet_id && r.publish.qos == QoS::AtLeastOnce)?;
        self.outbound.remove(pos)
    }

    /// Apply a PUBREC: advance the matching QoS 2 record to PUBREL-sent.
    /// Returns true when a PUBREL should go out (also on duplicate PUBREC,
    /// since PUBREL is idempotent).
    pub fn apply_pubrec(&mut self, packet_id: u16) -> bool {
        match self
            .outbound
            .iter_mut()
            .find(|r| r.packet_id == packet_id && r.publish.qos == QoS::ExactlyOnce)
        {
            Some(record) => {
                record.state = OutboundState::PubrelSent;
                true
            }
            None => false,
        }
    }

    /// Apply a PUBCOMP: remove the matching QoS 2 record, but only if it
    /// had reached the PUBREL-sent state.
    pub fn apply_pubcomp(&mut self, packet_id: u16) -> PubcompOutcome {
        let pos = self.outbound.iter().position(|r| {
            r.packet_id == packet_id
                && r.publish.qos == QoS::ExactlyOnce
                && r.state == OutboundState::PubrelSent
        });
        match pos {
            Some(pos) => {
                self.outbound.remove(pos);
                PubcompOutcome::Completed
            }
            None => PubcompOutcome::NotPreceded,
        }
    }

    /// Number of in-flight outbound publishes.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Packets to (re-)emit after a connection comes up, in original
    /// submission order. Records already on the wire before the reconnect
    /// re-emit PUBLISH with DUP=1, or PUBREL for QoS 2 exchanges past
    /// PUBREC. Records never sent go out as-is and are marked sent.
    pub fn replay(&mut self) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(self.outbound.len());
        for record in &mut self.outbound {
            match record.state {
                OutboundState::Unsent => {
                    packets.push(Packet::Publish(record.publish.clone()));
                    record.state = OutboundState::PublishSent;
                }
                OutboundState::PublishSent => {
                    let mut publish = record.publish.clone();
                    publish.dup = true;
                    packets.push(Packet::Publish(publish));
                }
                OutboundState::PubrelSent => {
                    packets.push(Packet::Pubrel {
                        packet_id: record.packet_id,
                    });
                }
            }
        }
        packets
    }

    fn outbound_mut(&mut self, packet_id: u16) -> Option<&mut OutboundPublish> {
        self.outbound.iter_mut().find(|r| r.packet_id == packet_id)
    }

    // === Inbound QoS 2 ===

    /// Hold an inbound QoS 2 publish until its PUBREL arrives. A publish
    /// whose identifier is already held is dropped (no redelivery), but
    /// the caller still answers with PUBREC.
    pub fn hold_inbound(&mut self, packet_id: u16, publish: Publish) {
        self.inbound_qos2.entry(packet_id).or_insert(publish);
    }

    /// Apply a PUBREL: release the held publish for delivery, if any.
    /// The caller answers with PUBCOMP either way.
    pub fn release_inbound(&mut self, packet_id: u16) -> Option<Publish> {
        self.inbound_qos2.remove(&packet_id)
    }

    /// Whether an inbound QoS 2 identifier is currently held.
    pub fn is_held(&self, packet_id: u16) -> bool {
        self.inbound_qos2.contains_key(&packet_id)
    }

    // === QoS 0 queue ===

    /// Queue a QoS 0 publish submitted while disconnected.
    pub fn queue_qos0(&mut self, publish: Publish) {
        debug_assert_eq!(publish.qos, QoS::AtMostOnce);
        self.queued_qos0.push_back(publish);
    }

    /// Drain QoS 0 publishes queued while disconnected.
    pub fn drain_qos0(&mut self) -> Vec<Publish> {
        self.queued_qos0.drain(..).collect()
    }

    // === Subscriptions ===

    /// Record a granted subscription, replacing any previous grant for the
    /// same filter.
    pub fn add_subscription(&mut self, filter: String, qos: QoS) {
        if let Some(sub) = self.subscriptions.iter_mut().find(|s| s.0 == filter) {
            sub.1 = qos;
        } else {
            self.subscriptions.push((filter, qos));
        }
    }

    /// Remove a subscription record.
    pub fn remove_subscription(&mut self, filter: &str) {
        self.subscriptions.retain(|s| s.0 != filter);
    }

    /// The current granted subscription set.
    pub fn subscriptions(&self) -> &[(String, QoS)] {
        &self.subscriptions
    }
}
