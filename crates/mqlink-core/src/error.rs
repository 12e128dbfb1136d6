//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding MQTT control packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fixed-header flag bits do not match the value the spec reserves
    /// for this packet type.
    #[error("Invalid fixed header for {packet}: flags {flags:#04x}")]
    InvalidHeader { packet: &'static str, flags: u8 },

    /// The 4-bit opcode is not one of the fourteen control packet types.
    #[error("Unsupported opcode: {0}")]
    UnsupportedOpcode(u8),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Malformed UTF-8 string")]
    InvalidUtf8,

    /// A fifth continuation byte in the remaining-length field.
    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    /// The remaining length claims a complete packet, but a field inside
    /// runs past the end of it.
    #[error("Payload too short: needed {needed} more bytes, have {have}")]
    PayloadTooShort { needed: usize, have: usize },

    /// SUBSCRIBE with no topic filters, or a filter carrying a bad QoS byte.
    #[error("Invalid subscription payload: {0}")]
    InvalidSubscriptionPayload(String),

    /// UNSUBSCRIBE with no topic filters.
    #[error("Invalid unsubscription payload: empty topic list")]
    InvalidUnsubscriptionPayload,

    #[error("Packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
