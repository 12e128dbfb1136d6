//! MQTT 3.1.1 packet types and codec.
//!
//! All fourteen control packet types, both directions, so the same codec
//! serves the client engine and scripted test brokers. Decoding is
//! incremental: `decode_packet` returns `Ok(None)` until a complete packet
//! is buffered, and never consumes a partial one.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Human-readable packet name, used in error reports.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::Puback => "PUBACK",
            PacketType::Pubrec => "PUBREC",
            PacketType::Pubrel => "PUBREL",
            PacketType::Pubcomp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::Suback => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::Unsuback => "UNSUBACK",
            PacketType::Pingreq => "PINGREQ",
            PacketType::Pingresp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::UnsupportedOpcode(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// Per-filter result in a SUBACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturn {
    /// Subscription accepted at the given maximum QoS.
    Granted(QoS),
    /// Subscription refused by the server (0x80).
    Failure,
}

impl SubscribeReturn {
    pub fn as_byte(self) -> u8 {
        match self {
            SubscribeReturn::Granted(qos) => qos as u8,
            SubscribeReturn::Failure => 0x80,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x80 => Ok(SubscribeReturn::Failure),
            b => Ok(SubscribeReturn::Granted(QoS::try_from(b)?)),
        }
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// The control packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message carried inside CONNECT.
///
/// The broker publishes it when the client disconnects without sending
/// DISCONNECT; the client itself never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    /// Will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the QoS level for will delivery.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the will message should be retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos > 0`.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested maximum QoS.
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// One return per filter of the matching SUBSCRIBE, in order.
    pub returns: Vec<SubscribeReturn>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Decoder cursor over one packet's variable header + payload.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::PayloadTooShort { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::PayloadTooShort {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::PayloadTooShort {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

/// Fixed-header flag bits the spec reserves for each packet type.
/// PUBLISH is excluded: its flags carry dup/qos/retain.
fn expected_flags(packet_type: PacketType) -> u8 {
    match packet_type {
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
        _ => 0x00,
    }
}

/// Try to decode a complete packet from the buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)` if
/// more data is needed, or `Err` on protocol errors.
/// `max_packet_size`: maximum allowed total packet size (0 = no limit).
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        });
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    // MQTT-2.2.2-2: reserved flag bits must match the spec exactly.
    if packet_type != PacketType::Publish && flags != expected_flags(packet_type) {
        return Err(ProtocolError::InvalidHeader {
            packet: packet_type.name(),
            flags,
        });
    }

    let payload = &buf[header_len..total_len];

    let packet = match packet_type {
        PacketType::Connect => decode_connect(payload)?,
        PacketType::Connack => decode_connack(payload)?,
        PacketType::Publish => decode_publish(flags, payload)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_packet_id_only(payload)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_packet_id_only(payload)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_packet_id_only(payload)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_packet_id_only(payload)?,
        },
        PacketType::Subscribe => decode_subscribe(payload)?,
        PacketType::Suback => decode_suback(payload)?,
        PacketType::Unsubscribe => decode_unsubscribe(payload)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_packet_id_only(payload)?,
        },
        PacketType::Pingreq => decode_empty(payload, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(payload, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(payload, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_empty(payload: &[u8], packet: Packet) -> Result<Packet> {
    if !payload.is_empty() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} must have zero remaining length",
            packet.packet_type().name()
        )));
    }
    Ok(packet)
}

fn decode_packet_id_only(payload: &[u8]) -> Result<u16> {
    if payload.len() != 2 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Ack packet remaining length must be 2, got {}",
            payload.len()
        )));
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    if packet_id == 0 {
        return Err(ProtocolError::MalformedPacket(
            "Packet identifier must be non-zero".into(),
        ));
    }
    Ok(packet_id)
}

fn decode_connect(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let protocol_name = dec.read_string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid protocol name: {:?}",
            protocol_name
        )));
    }

    let protocol_level = dec.read_u8()?;
    if protocol_level != PROTOCOL_LEVEL {
        return Err(ProtocolError::MalformedPacket(format!(
            "Unsupported protocol level: {}",
            protocol_level
        )));
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // MQTT-3.1.2-3: reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNECT reserved flag bit must be 0".into(),
        ));
    }

    // MQTT-3.1.2-11/13/15: without a will, Will QoS and Will Retain must be 0
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::MalformedPacket(
            "Will QoS/Retain must be 0 when Will Flag is 0".into(),
        ));
    }

    // MQTT-3.1.2-22: password requires username
    if !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "Password Flag must be 0 when Username Flag is 0".into(),
        ));
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let payload = dec.read_binary()?;
        Some(Will {
            topic,
            payload: Bytes::from(payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(payload: &[u8]) -> Result<Packet> {
    if payload.len() != 2 {
        return Err(ProtocolError::MalformedPacket(format!(
            "CONNACK remaining length must be 2, got {}",
            payload.len()
        )));
    }

    // MQTT-3.2.2-1: bits 7-1 of the acknowledge flags are reserved
    if (payload[0] & 0xFE) != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNACK acknowledge flags bits 7-1 must be 0".into(),
        ));
    }
    let session_present = (payload[0] & 0x01) != 0;
    let code = ConnackCode::try_from(payload[1])?;

    // MQTT-3.2.2-4: session present must be 0 when the connection is refused
    if code != ConnackCode::Accepted && session_present {
        return Err(ProtocolError::MalformedPacket(
            "CONNACK session present must be 0 on refusal".into(),
        ));
    }

    Ok(Packet::Connack(Connack {
        session_present,
        code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    // MQTT-3.3.1-2: dup must be 0 for QoS 0 messages
    if qos == QoS::AtMostOnce && dup {
        return Err(ProtocolError::InvalidHeader {
            packet: "PUBLISH",
            flags,
        });
    }

    let mut dec = Decoder::new(payload);

    let topic = dec.read_string()?;
    // MQTT-3.3.2-1/2: topic name must be non-empty and wildcard-free
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "PUBLISH topic must not be empty".into(),
        ));
    }
    if topic.contains(['#', '+']) {
        return Err(ProtocolError::MalformedPacket(
            "PUBLISH topic must not contain wildcards".into(),
        ));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = dec.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket(
                "Packet identifier must be non-zero".into(),
            ));
        }
        Some(id)
    } else {
        None
    };

    // Payload is whatever the remaining length says is left
    let payload_data = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload_data),
    }))
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::InvalidSubscriptionPayload(
                "empty topic filter".into(),
            ));
        }

        let qos_byte = dec.read_u8()?;
        // MQTT-3.8.3-4: upper six bits of the requested QoS byte are reserved
        if (qos_byte & 0xFC) != 0 {
            return Err(ProtocolError::InvalidSubscriptionPayload(format!(
                "bad requested QoS byte: {:#04x}",
                qos_byte
            )));
        }
        let qos = QoS::try_from(qos_byte)
            .map_err(|_| ProtocolError::InvalidSubscriptionPayload("bad QoS".into()))?;
        filters.push((filter, qos));
    }

    // MQTT-3.8.3-3: at least one filter
    if filters.is_empty() {
        return Err(ProtocolError::InvalidSubscriptionPayload(
            "empty filter list".into(),
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    if dec.remaining() == 0 {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no return codes".into(),
        ));
    }

    let mut returns = Vec::with_capacity(dec.remaining());
    while dec.remaining() > 0 {
        returns.push(SubscribeReturn::from_byte(dec.read_u8()?)?);
    }

    Ok(Packet::Suback(Suback { packet_id, returns }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::InvalidUnsubscriptionPayload);
        }
        topics.push(topic);
    }

    // MQTT-3.10.3-2: at least one filter
    if topics.is_empty() {
        return Err(ProtocolError::InvalidUnsubscriptionPayload);
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

/// Encode any packet into the provided buffer.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => encode_connack(connack, buf),
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_simple_ack(PacketType::Puback, *packet_id, buf),
        Packet::Pubrec { packet_id } => encode_simple_ack(PacketType::Pubrec, *packet_id, buf),
        Packet::Pubrel { packet_id } => encode_simple_ack(PacketType::Pubrel, *packet_id, buf),
        Packet::Pubcomp { packet_id } => encode_simple_ack(PacketType::Pubcomp, *packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback { packet_id } => encode_simple_ack(PacketType::Unsuback, *packet_id, buf),
        Packet::Pingreq => encode_empty(PacketType::Pingreq, buf),
        Packet::Pingresp => encode_empty(PacketType::Pingresp, buf),
        Packet::Disconnect => encode_empty(PacketType::Disconnect, buf),
    }
}

fn fixed_header_byte(packet_type: PacketType) -> u8 {
    ((packet_type as u8) << 4) | expected_flags(packet_type)
}

fn encode_empty(packet_type: PacketType, buf: &mut Vec<u8>) {
    buf.push(fixed_header_byte(packet_type));
    buf.push(0);
}

fn encode_simple_ack(packet_type: PacketType, packet_id: u16, buf: &mut Vec<u8>) {
    buf.push(fixed_header_byte(packet_type));
    buf.push(2); // Remaining length
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn write_string(payload: &mut Vec<u8>, s: &str) {
    payload.extend_from_slice(&(s.len() as u16).to_be_bytes());
    payload.extend_from_slice(s.as_bytes());
}

fn write_binary(payload: &mut Vec<u8>, b: &[u8]) {
    payload.extend_from_slice(&(b.len() as u16).to_be_bytes());
    payload.extend_from_slice(b);
}

/// Encode a CONNECT packet.
pub fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();

    write_string(&mut payload, PROTOCOL_NAME);
    payload.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    payload.push(flags);

    payload.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&mut payload, &connect.client_id);

    if let Some(ref will) = connect.will {
        write_string(&mut payload, &will.topic);
        write_binary(&mut payload, &will.payload);
    }
    if let Some(ref username) = connect.username {
        write_string(&mut payload, username);
    }
    if let Some(ref password) = connect.password {
        write_binary(&mut payload, password);
    }

    buf.push(fixed_header_byte(PacketType::Connect));
    varint::encode_to_vec(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    buf.push(fixed_header_byte(PacketType::Connack));
    buf.push(2); // Remaining length
    buf.push(if connack.session_present { 1 } else { 0 });
    buf.push(connack.code as u8);
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = 2 + publish.topic.len() + packet_id_len + publish.payload.len();
    varint::encode_to_vec(remaining, buf);

    write_string(buf, &publish.topic);
    if let Some(id) = publish.packet_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(&publish.payload);
}

/// Encode a SUBSCRIBE packet.
pub fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (filter, qos) in &subscribe.filters {
        write_string(&mut payload, filter);
        payload.push(*qos as u8);
    }

    buf.push(fixed_header_byte(PacketType::Subscribe));
    varint::encode_to_vec(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    buf.push(fixed_header_byte(PacketType::Suback));
    varint::encode_to_vec(2 + suback.returns.len(), buf);
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    for ret in &suback.returns {
        buf.push(ret.as_byte());
    }
}

/// Encode an UNSUBSCRIBE packet.
pub fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for topic in &unsubscribe.topics {
        write_string(&mut payload, topic);
    }

    buf.push(fixed_header_byte(PacketType::Unsubscribe));
    varint::encode_to_vec(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

// === Topic validation ===

/// Validate an outbound PUBLISH topic name: non-empty, no wildcards,
/// no embedded null, and short enough for its 16-bit length prefix.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "Topic must not be empty".into(),
        ));
    }
    if topic.len() > u16::MAX as usize {
        return Err(ProtocolError::MalformedPacket(
            "Topic exceeds 65535 bytes".into(),
        ));
    }
    if topic.contains(['#', '+']) {
        return Err(ProtocolError::MalformedPacket(
            "Topic name must not contain wildcards".into(),
        ));
    }
    if topic.contains('\0') {
        return Err(ProtocolError::MalformedPacket(
            "Topic must not contain null character".into(),
        ));
    }
    Ok(())
}

/// Validate a subscription topic filter: non-empty, no embedded null,
/// and short enough for its 16-bit length prefix. Wildcards are allowed.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidSubscriptionPayload(
            "empty topic filter".into(),
        ));
    }
    if filter.len() > u16::MAX as usize {
        return Err(ProtocolError::InvalidSubscriptionPayload(
            "topic filter exceeds 65535 bytes".into(),
        ));
    }
    if filter.contains('\0') {
        return Err(ProtocolError::InvalidSubscriptionPayload(
            "topic filter must not contain null character".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        let (decoded, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_connect_minimal() {
        roundtrip(Packet::Connect(Connect {
            clean_session: true,
            keep_alive: 60,
            client_id: "t".to_string(),
            will: None,
            username: None,
            password: None,
        }));
    }

    #[test]
    fn test_roundtrip_connect_full() {
        roundtrip(Packet::Connect(Connect {
            clean_session: false,
            keep_alive: 30,
            client_id: "sensor-17".to_string(),
            will: Some(Will {
                topic: "sensor-17/status".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("user".to_string()),
            password: Some(b"secret".to_vec()),
        }));
    }

    #[test]
    fn test_will_builder_drives_connect_flags() {
        let will = Will::new("lights/hall/state", "lost");
        assert_eq!(will.qos, QoS::AtMostOnce);
        assert!(!will.retain);

        let will = will.qos(QoS::ExactlyOnce).retain(true);
        let mut buf = Vec::new();
        encode_connect(
            &Connect {
                clean_session: true,
                keep_alive: 60,
                client_id: "w".to_string(),
                will: Some(will),
                username: None,
                password: None,
            },
            &mut buf,
        );
        // Connect flags byte: clean 0x02 | will 0x04 | will qos 2 (0x10)
        // | will retain 0x20
        assert_eq!(buf[9], 0x36);
    }

    #[test]
    fn test_roundtrip_connack() {
        roundtrip(Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        }));
        roundtrip(Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::IdentifierRejected,
        }));
    }

    #[test]
    fn test_roundtrip_publish_all_qos() {
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"hello"),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b/c".to_string(),
            packet_id: Some(7),
            payload: Bytes::new(),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "x".to_string(),
            packet_id: Some(0xFFFF),
            payload: Bytes::from_static(&[0, 1, 2, 3]),
        }));
    }

    #[test]
    fn test_roundtrip_acks() {
        roundtrip(Packet::Puback { packet_id: 1 });
        roundtrip(Packet::Pubrec { packet_id: 2 });
        roundtrip(Packet::Pubrel { packet_id: 3 });
        roundtrip(Packet::Pubcomp { packet_id: 4 });
        roundtrip(Packet::Unsuback { packet_id: 5 });
    }

    #[test]
    fn test_roundtrip_subscribe_suback() {
        roundtrip(Packet::Subscribe(Subscribe {
            packet_id: 10,
            filters: vec![
                ("foo".to_string(), QoS::AtMostOnce),
                ("bar/#".to_string(), QoS::AtLeastOnce),
                ("baz/+".to_string(), QoS::ExactlyOnce),
            ],
        }));
        roundtrip(Packet::Suback(Suback {
            packet_id: 10,
            returns: vec![
                SubscribeReturn::Granted(QoS::AtMostOnce),
                SubscribeReturn::Granted(QoS::ExactlyOnce),
                SubscribeReturn::Failure,
            ],
        }));
    }

    #[test]
    fn test_roundtrip_unsubscribe() {
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 11,
            topics: vec!["foo".to_string(), "bar/#".to_string()],
        }));
    }

    #[test]
    fn test_roundtrip_empty_packets() {
        roundtrip(Packet::Pingreq);
        roundtrip(Packet::Pingresp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_incomplete_returns_none() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "a/b".to_string(),
                packet_id: Some(3),
                payload: Bytes::from_static(b"payload"),
            }),
            &mut buf,
        );

        // Every strict prefix needs more data
        for n in 0..buf.len() {
            assert_eq!(decode_packet(&buf[..n], 0).unwrap(), None, "prefix {}", n);
        }
        assert!(decode_packet(&buf, 0).unwrap().is_some());
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let mut buf = Vec::new();
        encode_packet(&Packet::Puback { packet_id: 1 }, &mut buf);
        encode_packet(&Packet::Pingresp, &mut buf);

        let (first, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(first, Packet::Puback { packet_id: 1 });
        let (second, consumed2) = decode_packet(&buf[consumed..], 0).unwrap().unwrap();
        assert_eq!(second, Packet::Pingresp);
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn test_reserved_flags_rejected() {
        // SUBSCRIBE with flags 0000 instead of 0010
        let bad = [0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::InvalidHeader {
                packet: "SUBSCRIBE",
                ..
            })
        ));

        // PINGREQ with non-zero flags
        let bad = [0xC1, 0x00];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::InvalidHeader {
                packet: "PINGREQ",
                ..
            })
        ));

        // PUBREL with flags 0000
        let bad = [0x60, 0x02, 0x00, 0x01];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::InvalidHeader { packet: "PUBREL", .. })
        ));
    }

    #[test]
    fn test_unsupported_opcode() {
        assert_eq!(
            decode_packet(&[0x00, 0x00], 0),
            Err(ProtocolError::UnsupportedOpcode(0))
        );
        assert_eq!(
            decode_packet(&[0xF0, 0x00], 0),
            Err(ProtocolError::UnsupportedOpcode(15))
        );
    }

    #[test]
    fn test_connack_bad_return_code() {
        let bad = [0x20, 0x02, 0x00, 0x06];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_connack_session_present_on_refusal_rejected() {
        let bad = [0x20, 0x02, 0x01, 0x02];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_connack_reserved_ack_flags_rejected() {
        let bad = [0x20, 0x02, 0x02, 0x00];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_qos3_rejected() {
        // flags = 0110 → qos 3
        let bad = [0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_zero_packet_id_rejected() {
        let bad = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_wildcard_topic_rejected() {
        let mut buf = Vec::new();
        encode_publish(
            &Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "a/#".to_string(),
                packet_id: None,
                payload: Bytes::new(),
            },
            &mut buf,
        );
        assert!(matches!(
            decode_packet(&buf, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_truncated_inside_rejected() {
        // Remaining length 3 but topic length prefix claims 4 bytes
        let bad = [0x30, 0x03, 0x00, 0x04, b'a'];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::PayloadTooShort { .. })
        ));
    }

    #[test]
    fn test_subscribe_empty_filter_list_rejected() {
        let bad = [0x82, 0x02, 0x00, 0x01];
        assert_eq!(
            decode_packet(&bad, 0),
            Err(ProtocolError::InvalidSubscriptionPayload(
                "empty filter list".into()
            ))
        );
    }

    #[test]
    fn test_subscribe_bad_qos_byte_rejected() {
        let bad = [0x82, 0x07, 0x00, 0x01, 0x00, 0x02, b'a', b'b', 0x03];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::InvalidSubscriptionPayload(_))
        ));
    }

    #[test]
    fn test_unsubscribe_empty_topic_list_rejected() {
        let bad = [0xA2, 0x02, 0x00, 0x01];
        assert_eq!(
            decode_packet(&bad, 0),
            Err(ProtocolError::InvalidUnsubscriptionPayload)
        );
    }

    #[test]
    fn test_suback_empty_rejected() {
        let bad = [0x90, 0x02, 0x00, 0x01];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_topic_rejected() {
        let bad = [0x30, 0x04, 0x00, 0x02, 0xC3, 0x28];
        assert_eq!(decode_packet(&bad, 0), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_null_in_string_rejected() {
        let bad = [0x30, 0x04, 0x00, 0x02, b'a', 0x00];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_max_packet_size_enforced() {
        let mut buf = Vec::new();
        encode_publish(
            &Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "t".to_string(),
                packet_id: None,
                payload: Bytes::from(vec![0u8; 64]),
            },
            &mut buf,
        );
        assert!(matches!(
            decode_packet(&buf, 16),
            Err(ProtocolError::PacketTooLarge { .. })
        ));
        assert!(decode_packet(&buf, 1024).unwrap().is_some());
    }

    #[test]
    fn test_pingreq_with_payload_rejected() {
        let bad = [0xC0, 0x01, 0x00];
        assert!(matches!(
            decode_packet(&bad, 0),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a/+/b").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("a/+/b").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a\0b").is_err());
    }
}
