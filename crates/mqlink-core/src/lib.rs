//! mqlink-core - Core MQTT 3.1.1 types and packet codec.
//!
//! This crate provides the typed packet representation and the bit-exact
//! encoder/decoder shared by the mqlink client crates. It is pure: no I/O,
//! no timers, byte buffers in and typed packets out.

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;
