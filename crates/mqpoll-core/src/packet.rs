//! MQTT packet types and codec for MQTT 3.1 and 3.1.1.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::varint;

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
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // names from the MQTT standard
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
            _ => Err(ProtocolError::InvalidQos(value)),
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
                "Unknown CONNACK return code: {}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for ConnackCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnackCode::Accepted => "accepted",
            ConnackCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnackCode::IdentifierRejected => "identifier rejected",
            ConnackCode::ServerUnavailable => "server unavailable",
            ConnackCode::BadUsernamePassword => "bad user name or password",
            ConnackCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Protocol revision announced in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name "MQIsdp", level 3.
    V31,
    /// MQTT 3.1.1, protocol name "MQTT", level 4.
    #[default]
    V311,
}

impl ProtocolVersion {
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }

    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
        }
    }
}

/// One entry of a SUBACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn to_byte(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x80 => Ok(SubscribeReturnCode::Failure),
            b => QoS::try_from(b)
                .map(SubscribeReturnCode::Success)
                .map_err(|_| {
                    ProtocolError::MalformedPacket(format!("Invalid SUBACK return code: {:#04x}", b))
                }),
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
    pub version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
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
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Bounds-checked reader over a packet body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_binary(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(Bytes::copy_from_slice(bytes))
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

type BodyDecoder = fn(u8, &[u8]) -> Result<Packet>;

/// Body decoders indexed by the type nibble of the fixed header. Types 0
/// and 15 are reserved in 3.1.1.
static DECODERS: [Option<BodyDecoder>; 16] = [
    None,
    Some(decode_connect as BodyDecoder),
    Some(decode_connack as BodyDecoder),
    Some(decode_publish as BodyDecoder),
    Some(decode_puback as BodyDecoder),
    Some(decode_pubrec as BodyDecoder),
    Some(decode_pubrel as BodyDecoder),
    Some(decode_pubcomp as BodyDecoder),
    Some(decode_subscribe as BodyDecoder),
    Some(decode_suback as BodyDecoder),
    Some(decode_unsubscribe as BodyDecoder),
    Some(decode_unsuback as BodyDecoder),
    Some(decode_pingreq as BodyDecoder),
    Some(decode_pingresp as BodyDecoder),
    Some(decode_disconnect as BodyDecoder),
    None,
];

/// Decode a packet body given its fixed header byte.
///
/// The socket layer assembles frames itself and hands the header byte plus
/// the remaining-length bytes of body here.
pub fn decode_body(header: u8, body: &[u8]) -> Result<Packet> {
    let type_nibble = header >> 4;
    let decoder = DECODERS[type_nibble as usize]
        .ok_or(ProtocolError::InvalidPacketType(type_nibble))?;
    decoder(header & 0x0F, body)
}

/// Try to decode a complete packet from the buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` if successful, `Ok(None)` if
/// more data is needed, or `Err` on protocol errors.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let header = buf[0];
    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let packet = decode_body(header, &buf[header_len..total_len])?;
    Ok(Some((packet, total_len)))
}

fn require_flags(packet_type: PacketType, flags: u8, expected: u8) -> Result<()> {
    if flags != expected {
        return Err(ProtocolError::InvalidHeaderFlags {
            packet_type: packet_type as u8,
            flags,
        });
    }
    Ok(())
}

fn decode_connect(_flags: u8, body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    let level = dec.read_u8()?;
    let version = match (protocol_name.as_str(), level) {
        ("MQIsdp", 3) => ProtocolVersion::V31,
        ("MQTT", 4) => ProtocolVersion::V311,
        ("MQIsdp", _) | ("MQTT", _) => {
            return Err(ProtocolError::UnsupportedProtocolVersion(level))
        }
        _ => return Err(ProtocolError::InvalidProtocolName(protocol_name)),
    };

    let flags = dec.read_u8()?;
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(LastWill {
            topic,
            message,
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
        version,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(_flags: u8, body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: (ack_flags & 0x01) != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;
    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(dec.read_rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_puback(_flags: u8, body: &[u8]) -> Result<Packet> {
    let packet_id = Decoder::new(body).read_u16()?;
    Ok(Packet::Puback { packet_id })
}

fn decode_pubrec(_flags: u8, body: &[u8]) -> Result<Packet> {
    let packet_id = Decoder::new(body).read_u16()?;
    Ok(Packet::Pubrec { packet_id })
}

fn decode_pubrel(flags: u8, body: &[u8]) -> Result<Packet> {
    require_flags(PacketType::Pubrel, flags, 0x02)?;
    let packet_id = Decoder::new(body).read_u16()?;
    Ok(Packet::Pubrel { packet_id })
}

fn decode_pubcomp(_flags: u8, body: &[u8]) -> Result<Packet> {
    let packet_id = Decoder::new(body).read_u16()?;
    Ok(Packet::Pubcomp { packet_id })
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet> {
    require_flags(PacketType::Subscribe, flags, 0x02)?;
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        let qos = QoS::try_from(dec.read_u8()?)?;
        topics.push((filter, qos));
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE must contain at least one topic filter".into(),
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(_flags: u8, body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    let return_codes = dec
        .read_rest()
        .iter()
        .map(|&b| SubscribeReturnCode::from_byte(b))
        .collect::<Result<Vec<_>>>()?;
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet> {
    require_flags(PacketType::Unsubscribe, flags, 0x02)?;
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        topics.push(dec.read_string()?);
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE must contain at least one topic filter".into(),
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

fn decode_unsuback(_flags: u8, body: &[u8]) -> Result<Packet> {
    let packet_id = Decoder::new(body).read_u16()?;
    Ok(Packet::Unsuback { packet_id })
}

fn decode_pingreq(_flags: u8, _body: &[u8]) -> Result<Packet> {
    Ok(Packet::Pingreq)
}

fn decode_pingresp(_flags: u8, _body: &[u8]) -> Result<Packet> {
    Ok(Packet::Pingresp)
}

fn decode_disconnect(_flags: u8, _body: &[u8]) -> Result<Packet> {
    Ok(Packet::Disconnect)
}

// === Encoding ===

fn put_string(buf: &mut BytesMut, s: &[u8]) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s);
    Ok(())
}

fn put_frame(header: u8, body: &[u8], buf: &mut BytesMut) -> Result<()> {
    buf.reserve(1 + varint::MAX_LEN_BYTES + body.len());
    buf.put_u8(header);
    varint::encode(body.len(), buf)?;
    buf.put_slice(body);
    Ok(())
}

/// Encode any packet, appending to `buf`.
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<()> {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => {
            encode_connack(connack, buf);
            Ok(())
        }
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => {
            encode_ack(PacketType::Puback, *packet_id, buf);
            Ok(())
        }
        Packet::Pubrec { packet_id } => {
            encode_ack(PacketType::Pubrec, *packet_id, buf);
            Ok(())
        }
        Packet::Pubrel { packet_id } => {
            encode_ack(PacketType::Pubrel, *packet_id, buf);
            Ok(())
        }
        Packet::Pubcomp { packet_id } => {
            encode_ack(PacketType::Pubcomp, *packet_id, buf);
            Ok(())
        }
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback { packet_id } => {
            encode_ack(PacketType::Unsuback, *packet_id, buf);
            Ok(())
        }
        Packet::Pingreq => {
            encode_header_only(PacketType::Pingreq, buf);
            Ok(())
        }
        Packet::Pingresp => {
            encode_header_only(PacketType::Pingresp, buf);
            Ok(())
        }
        Packet::Disconnect => {
            encode_header_only(PacketType::Disconnect, buf);
            Ok(())
        }
    }
}

/// Encode a packet into a fresh frozen buffer.
pub fn to_bytes(packet: &Packet) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a CONNECT packet.
pub fn encode_connect(connect: &Connect, buf: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::new();

    put_string(&mut body, connect.version.protocol_name().as_bytes())?;
    body.put_u8(connect.version.level());

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
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_string(&mut body, connect.client_id.as_bytes())?;
    if let Some(ref will) = connect.will {
        put_string(&mut body, will.topic.as_bytes())?;
        put_string(&mut body, &will.message)?;
    }
    if let Some(ref username) = connect.username {
        put_string(&mut body, username.as_bytes())?;
    }
    if let Some(ref password) = connect.password {
        put_string(&mut body, password)?;
    }

    put_frame((PacketType::Connect as u8) << 4, &body, buf)
}

fn encode_connack(connack: &Connack, buf: &mut BytesMut) {
    buf.put_u8((PacketType::Connack as u8) << 4);
    buf.put_u8(2);
    buf.put_u8(u8::from(connack.session_present));
    buf.put_u8(connack.code as u8);
}

fn publish_header_byte(publish: &Publish) -> u8 {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    fixed_header
}

/// Encode everything of a PUBLISH except its payload.
///
/// The returned header is followed on the wire by `publish.payload`, which
/// lets callers hand both to a vectored write without copying the payload.
pub fn encode_publish_header(publish: &Publish) -> Result<Bytes> {
    if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
        return Err(ProtocolError::MalformedPacket(
            "PUBLISH with QoS > 0 requires a packet identifier".into(),
        ));
    }

    let topic_len = 2 + publish.topic.len();
    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = topic_len + packet_id_len + publish.payload.len();

    let mut buf = BytesMut::with_capacity(1 + varint::MAX_LEN_BYTES + topic_len + packet_id_len);
    buf.put_u8(publish_header_byte(publish));
    varint::encode(remaining, &mut buf)?;
    put_string(&mut buf, publish.topic.as_bytes())?;
    if publish.qos != QoS::AtMostOnce {
        if let Some(id) = publish.packet_id {
            buf.put_u16(id);
        }
    }
    Ok(buf.freeze())
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, buf: &mut BytesMut) -> Result<()> {
    let header = encode_publish_header(publish)?;
    buf.reserve(header.len() + publish.payload.len());
    buf.put_slice(&header);
    buf.put_slice(&publish.payload);
    Ok(())
}

/// Encode one of the two-byte acknowledgements (PUBACK, PUBREC, PUBREL,
/// PUBCOMP, UNSUBACK).
pub fn encode_ack(packet_type: PacketType, packet_id: u16, buf: &mut BytesMut) {
    let flags = if packet_type == PacketType::Pubrel { 0x02 } else { 0 };
    buf.put_u8(((packet_type as u8) << 4) | flags);
    buf.put_u8(2);
    buf.put_u16(packet_id);
}

/// Encode PINGREQ, PINGRESP or DISCONNECT.
pub fn encode_header_only(packet_type: PacketType, buf: &mut BytesMut) {
    buf.put_u8((packet_type as u8) << 4);
    buf.put_u8(0);
}

/// Encode a SUBSCRIBE packet.
pub fn encode_subscribe(subscribe: &Subscribe, buf: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_u16(subscribe.packet_id);
    for (filter, qos) in &subscribe.topics {
        put_string(&mut body, filter.as_bytes())?;
        body.put_u8(*qos as u8);
    }
    put_frame(((PacketType::Subscribe as u8) << 4) | 0x02, &body, buf)
}

fn encode_suback(suback: &Suback, buf: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::with_capacity(2 + suback.return_codes.len());
    body.put_u16(suback.packet_id);
    for code in &suback.return_codes {
        body.put_u8(code.to_byte());
    }
    put_frame((PacketType::Suback as u8) << 4, &body, buf)
}

/// Encode an UNSUBSCRIBE packet.
pub fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_u16(unsubscribe.packet_id);
    for filter in &unsubscribe.topics {
        put_string(&mut body, filter.as_bytes())?;
    }
    put_frame(((PacketType::Unsubscribe as u8) << 4) | 0x02, &body, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let bytes = to_bytes(&packet).unwrap();
        let (decoded, consumed) = decode_packet(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, packet);
        // And back to the same bytes.
        assert_eq!(to_bytes(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_roundtrip_connect() {
        roundtrip(Packet::Connect(Connect {
            version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 60,
            client_id: "client-1".into(),
            will: None,
            username: None,
            password: None,
        }));
        roundtrip(Packet::Connect(Connect {
            version: ProtocolVersion::V31,
            clean_session: false,
            keep_alive: 0,
            client_id: "c".into(),
            will: Some(LastWill {
                topic: "status/c".into(),
                message: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("user".into()),
            password: Some(Bytes::from_static(b"secret")),
        }));
    }

    #[test]
    fn test_connect_wire_format() {
        let connect = Connect {
            version: ProtocolVersion::V31,
            clean_session: true,
            keep_alive: 10,
            client_id: "id".into(),
            will: None,
            username: Some("u".into()),
            password: Some(Bytes::from_static(b"p")),
        };
        let bytes = to_bytes(&Packet::Connect(connect)).unwrap();
        assert_eq!(bytes[0], 0x10);
        assert_eq!(&bytes[2..10], b"\x00\x06MQIsdp");
        assert_eq!(bytes[10], 3);
        assert_eq!(bytes[11], 0x80 | 0x40 | 0x02);
        assert_eq!(&bytes[12..14], &[0, 10]);
    }

    #[test]
    fn test_roundtrip_connack() {
        roundtrip(Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        }));
        roundtrip(Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::NotAuthorized,
        }));
    }

    #[test]
    fn test_roundtrip_publish() {
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: None,
            payload: Bytes::from_static(b"hello"),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: Some(7),
            payload: Bytes::new(),
        }));
    }

    #[test]
    fn test_roundtrip_remaining_length_boundaries() {
        // topic "t" (3 bytes) + id (2) + payload
        for (payload_len, len_bytes) in [(122usize, 1usize), (123, 2), (2_097_147, 4)] {
            let publish = Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "t".into(),
                packet_id: Some(1),
                payload: Bytes::from(vec![0xAB; payload_len]),
            };
            let bytes = to_bytes(&Packet::Publish(publish.clone())).unwrap();
            assert_eq!(bytes.len(), 1 + len_bytes + 5 + payload_len);
            let (decoded, _) = decode_packet(&bytes).unwrap().unwrap();
            assert_eq!(decoded, Packet::Publish(publish));
        }
    }

    #[test]
    fn test_roundtrip_acks() {
        roundtrip(Packet::Puback { packet_id: 1 });
        roundtrip(Packet::Pubrec { packet_id: 65535 });
        roundtrip(Packet::Pubrel { packet_id: 42 });
        roundtrip(Packet::Pubcomp { packet_id: 42 });
        roundtrip(Packet::Unsuback { packet_id: 9 });
    }

    #[test]
    fn test_roundtrip_subscribe_family() {
        roundtrip(Packet::Subscribe(Subscribe {
            packet_id: 3,
            topics: vec![("a/b".into(), QoS::ExactlyOnce), ("c/#".into(), QoS::AtMostOnce)],
        }));
        roundtrip(Packet::Suback(Suback {
            packet_id: 3,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::ExactlyOnce),
                SubscribeReturnCode::Failure,
            ],
        }));
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 4,
            topics: vec!["a/b".into()],
        }));
    }

    #[test]
    fn test_roundtrip_header_only() {
        roundtrip(Packet::Pingreq);
        roundtrip(Packet::Pingresp);
        roundtrip(Packet::Disconnect);
        assert_eq!(&to_bytes(&Packet::Pingreq).unwrap()[..], &[0xC0, 0x00]);
        assert_eq!(&to_bytes(&Packet::Disconnect).unwrap()[..], &[0xE0, 0x00]);
    }

    #[test]
    fn test_pubrel_header_flags() {
        let bytes = to_bytes(&Packet::Pubrel { packet_id: 1 }).unwrap();
        assert_eq!(bytes[0], 0x62);
        assert!(matches!(
            decode_packet(&[0x60, 0x02, 0x00, 0x01]),
            Err(ProtocolError::InvalidHeaderFlags { .. })
        ));
    }

    #[test]
    fn test_reserved_packet_types() {
        assert_eq!(
            decode_packet(&[0x00, 0x00]),
            Err(ProtocolError::InvalidPacketType(0))
        );
        assert_eq!(
            decode_packet(&[0xF0, 0x00]),
            Err(ProtocolError::InvalidPacketType(15))
        );
    }

    #[test]
    fn test_remaining_length_four_continuations() {
        assert_eq!(
            decode_packet(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::InvalidRemainingLength)
        );
    }

    #[test]
    fn test_incomplete_returns_none() {
        let bytes = to_bytes(&Packet::Puback { packet_id: 5 }).unwrap();
        for end in 0..bytes.len() {
            assert_eq!(decode_packet(&bytes[..end]).unwrap(), None);
        }
    }

    #[test]
    fn test_truncated_string_length() {
        // PUBLISH claiming a 16-byte topic in a 3-byte body.
        assert!(matches!(
            decode_packet(&[0x30, 0x03, 0x00, 0x10, b'a']),
            Err(ProtocolError::IncompletePacket { .. })
        ));
        // Length prefix cut in half.
        assert!(matches!(
            decode_packet(&[0x30, 0x01, 0x00]),
            Err(ProtocolError::IncompletePacket { .. })
        ));
    }

    #[test]
    fn test_publish_qos3_rejected() {
        assert_eq!(
            decode_packet(&[0x36, 0x03, 0x00, 0x01, b'a']),
            Err(ProtocolError::InvalidQos(3))
        );
    }

    #[test]
    fn test_publish_header_split() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "x".into(),
            packet_id: Some(0x0102),
            payload: Bytes::from_static(b"abc"),
        };
        let header = encode_publish_header(&publish).unwrap();
        assert_eq!(&header[..], &[0x32, 8, 0, 1, b'x', 1, 2]);

        let missing_id = Publish {
            packet_id: None,
            ..publish
        };
        assert!(encode_publish_header(&missing_id).is_err());
    }

    #[test]
    fn test_bad_suback_code() {
        assert!(decode_packet(&[0x90, 0x03, 0x00, 0x01, 0x05]).is_err());
    }
}
