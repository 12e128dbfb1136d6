//! Client error types.

use thiserror::Error;

use mqlink_core::{ConnackCode, PacketType, ProtocolError};

/// Transport-level failures, classified per the reconnect policy:
/// everything here is transient except TLS certificate-trust failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused")]
    Refused,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Name resolution failed")]
    NameResolution,

    #[error("Connection closed")]
    Closed,

    #[error("Connect timeout")]
    Timeout,

    #[error("TLS failure: {detail}")]
    Tls {
        detail: String,
        /// Certificate-trust failures are fatal; retrying cannot fix them.
        fatal: bool,
    },
}

impl TransportError {
    /// Whether reconnecting with backoff could plausibly succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Tls { fatal: true, .. })
    }

    /// Classify an I/O error from a connect or read/write call.
    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => TransportError::Refused,
            ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                TransportError::HostUnreachable
            }
            ErrorKind::NotFound | ErrorKind::InvalidInput => TransportError::NameResolution,
            _ => TransportError::Closed,
        }
    }
}

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An inbound packet that is inappropriate for the current connection
    /// state. Fatal: the engine exits with this reason.
    #[error("Protocol violation: expected {expected}, got {got}")]
    ProtocolViolation {
        expected: &'static str,
        got: &'static str,
    },

    /// The broker authoritatively refused the CONNECT. Fatal, no retry.
    #[error("Connection refused by broker: {0:?}")]
    Refused(ConnackCode),

    /// A caller-supplied timeout elapsed. The underlying protocol exchange
    /// is not cancelled.
    #[error("Operation timed out")]
    Timeout,

    /// No running connection with the requested client id.
    #[error("Unknown connection")]
    UnknownConnection,

    /// All 65535 packet identifiers are in flight.
    #[error("Packet identifier pool exhausted")]
    PacketIdExhausted,

    /// The engine has shut down; the operation can no longer complete.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("A connection with client id {0:?} is already running")]
    DuplicateClientId(String),
}

impl ClientError {
    pub(crate) fn violation(expected: &'static str, got: PacketType) -> Self {
        ClientError::ProtocolViolation {
            expected,
            got: got.name(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
