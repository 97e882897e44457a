//! MQTT 3.1.1 control packet encoding and decoding.
//!
//! Every control packet starts with a fixed header:
//!
//! ```text
//!  bit    7   6   5   4   3   2   1   0
//! byte 1  [ packet type ] [    flags    ]
//! byte 2… remaining length (1-4 bytes, 7 bits per byte, MSB = continuation)
//! ```
//!
//! followed by `remaining length` bytes of variable header and payload.
//!
//! [`Packet::encode`] appends the wire form of a packet to a `heapless::Vec`;
//! [`decode`] parses one packet from the front of a byte slice and reports
//! how many bytes it consumed, or [`CodecError::NeedMoreData`] when the slice
//! holds only a prefix of a packet.
//!
//! # Examples
//!
//! ```rust
//! use heapless::Vec;
//! use libmqtt::mqtt::packet::{decode, Packet, Publish, QoS};
//!
//! let publish = Publish::new("sensors/temperature", b"23.5", QoS::AtLeastOnce, Some(7)).unwrap();
//! let packet = Packet::Publish(publish);
//!
//! let mut wire: Vec<u8, 512> = Vec::new();
//! let written = packet.encode(&mut wire).unwrap();
//!
//! let (decoded, consumed) = decode(&wire).unwrap();
//! assert_eq!(consumed, written);
//! assert_eq!(decoded, packet);
//! ```

use super::{
    MAX_CLIENT_ID_LEN, MAX_FILTERS, MAX_PACKET_LEN, MAX_PASSWORD_LEN, MAX_PAYLOAD_LEN,
    MAX_TOPIC_LEN, MAX_USERNAME_LEN,
};
use super::topic;
use heapless::{String, Vec};

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";
/// MQTT protocol level for version 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Largest value representable by the remaining length field.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT_FLAG_USERNAME: u8 = 0x80;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_WILL_QOS: u8 = 0x18;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_RESERVED: u8 = 0x01;

const PUBLISH_FLAG_DUP: u8 = 0x08;
const PUBLISH_FLAG_RETAIN: u8 = 0x01;

/// Fixed header flags mandated for PUBREL, SUBSCRIBE and UNSUBSCRIBE.
const FLAGS_RESERVED_0010: u8 = 0x02;

const SUBACK_FAILURE: u8 = 0x80;

/// Control packet types (upper nibble of the first fixed header byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client request to connect to a server
    Connect = 1,
    /// Connect acknowledgement
    Connack = 2,
    /// Publish message
    Publish = 3,
    /// QoS 1 publish acknowledgement
    Puback = 4,
    /// QoS 2 publish received (part 1)
    Pubrec = 5,
    /// QoS 2 publish release (part 2)
    Pubrel = 6,
    /// QoS 2 publish complete (part 3)
    Pubcomp = 7,
    /// Subscribe request
    Subscribe = 8,
    /// Subscribe acknowledgement
    Suback = 9,
    /// Unsubscribe request
    Unsubscribe = 10,
    /// Unsubscribe acknowledgement
    Unsuback = 11,
    /// Ping request
    Pingreq = 12,
    /// Ping response
    Pingresp = 13,
    /// Client is disconnecting
    Disconnect = 14,
}

impl PacketType {
    /// Packet type from the upper nibble of a fixed header byte.
    pub fn from_header(byte: u8) -> Option<Self> {
        Some(match byte >> 4 {
            1 => Self::Connect,
            2 => Self::Connack,
            3 => Self::Publish,
            4 => Self::Puback,
            5 => Self::Pubrec,
            6 => Self::Pubrel,
            7 => Self::Pubcomp,
            8 => Self::Subscribe,
            9 => Self::Suback,
            10 => Self::Unsubscribe,
            11 => Self::Unsuback,
            12 => Self::Pingreq,
            13 => Self::Pingresp,
            14 => Self::Disconnect,
            _ => return None,
        })
    }

    /// Upper-case packet name, e.g. `PUBLISH`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connack => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::Puback => "PUBACK",
            Self::Pubrec => "PUBREC",
            Self::Pubrel => "PUBREL",
            Self::Pubcomp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::Suback => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsuback => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// Quality of Service levels for MQTT messages.
///
/// ```rust
/// use libmqtt::mqtt::QoS;
///
/// assert_eq!(QoS::AtMostOnce as u8, 0);
/// assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
/// assert!(QoS::try_from(3).is_err());
/// ```
#[repr(u8)]
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum QoS {
    /// **QoS 0**: at most once. Fire and forget.
    #[default]
    AtMostOnce = 0,
    /// **QoS 1**: at least once. Acknowledged with PUBACK, duplicates possible.
    AtLeastOnce = 1,
    /// **QoS 2**: exactly once. Four-way PUBLISH/PUBREC/PUBREL/PUBCOMP handshake.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(CodecError::InvalidQoS(other)),
        }
    }
}

/// CONNACK return codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    /// Connection accepted
    Accepted = 0,
    /// The server does not support MQTT 3.1.1
    UnacceptableProtocolVersion = 1,
    /// The client identifier is not allowed by the server
    IdentifierRejected = 2,
    /// The MQTT service is unavailable
    ServerUnavailable = 3,
    /// The user name or password is malformed
    BadUserNameOrPassword = 4,
    /// The client is not authorized to connect
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            other => return Err(CodecError::InvalidReturnCode(other)),
        })
    }
}

impl core::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Accepted => "connection accepted",
            Self::UnacceptableProtocolVersion => "unacceptable protocol version",
            Self::IdentifierRejected => "client identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadUserNameOrPassword => "bad user name or password",
            Self::NotAuthorized => "not authorized",
        })
    }
}

/// Per-filter result carried by a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    /// Subscription accepted with the granted maximum QoS
    Success(QoS),
    /// Subscription refused by the server
    Failure,
}

impl SubscribeReturnCode {
    fn to_byte(self) -> u8 {
        match self {
            Self::Success(qos) => qos as u8,
            Self::Failure => SUBACK_FAILURE,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            SUBACK_FAILURE => Ok(Self::Failure),
            0..=2 => Ok(Self::Success(QoS::try_from(byte)?)),
            other => Err(CodecError::InvalidReturnCode(other)),
        }
    }
}

/// Codec failures.
///
/// [`CodecError::NeedMoreData`] is not an error in the protocol sense: the
/// input is a valid prefix and decoding should be retried once more bytes have
/// arrived. Every other variant means the packet is malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The input ends before the packet does
    NeedMoreData,
    /// The remaining length uses more than four bytes or exceeds the maximum
    InvalidRemainingLength,
    /// The packet type nibble is 0 or 15
    UnknownPacketType(u8),
    /// Fixed header flags do not match what the packet type requires
    InvalidHeaderFlags(PacketType),
    /// Fields overrun, or stop short of, the declared remaining length
    LengthMismatch(PacketType),
    /// A string is not well-formed UTF-8 or contains U+0000
    InvalidUtf8,
    /// A QoS field holds 3 or more
    InvalidQoS(u8),
    /// CONNECT carries an unexpected protocol name or level
    InvalidProtocol,
    /// CONNECT flags are inconsistent (reserved bit, password without user
    /// name) or request a will message, which this client does not support
    InvalidConnectFlags,
    /// A CONNACK or SUBACK return code is not defined
    InvalidReturnCode(u8),
    /// A packet identifier is zero
    InvalidPacketId,
    /// A PUBLISH topic name is empty or contains a wildcard
    InvalidTopic,
    /// SUBSCRIBE, UNSUBSCRIBE or SUBACK carries no entries
    EmptyPayload(PacketType),
    /// A field does not fit the client's fixed capacity
    CapacityExceeded,
    /// The declared packet size is larger than [`MAX_PACKET_LEN`], or a
    /// PUBLISH topic or payload is longer than the client accepts
    PacketTooLarge,
}

impl CodecError {
    /// `true` for every variant except [`CodecError::NeedMoreData`].
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::NeedMoreData)
    }
}

impl core::fmt::Display for CodecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NeedMoreData => f.write_str("incomplete packet"),
            Self::InvalidRemainingLength => f.write_str("invalid remaining length encoding"),
            Self::UnknownPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::InvalidHeaderFlags(t) => write!(f, "invalid fixed header flags for {}", t.name()),
            Self::LengthMismatch(t) => write!(f, "{} length does not match its contents", t.name()),
            Self::InvalidUtf8 => f.write_str("invalid UTF-8 string"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS {}", q),
            Self::InvalidProtocol => f.write_str("unsupported protocol name or level"),
            Self::InvalidConnectFlags => f.write_str("invalid CONNECT flags"),
            Self::InvalidReturnCode(c) => write!(f, "invalid return code {:#04x}", c),
            Self::InvalidPacketId => f.write_str("packet identifier must not be zero"),
            Self::InvalidTopic => f.write_str("invalid topic name"),
            Self::EmptyPayload(t) => write!(f, "{} carries no topic filters", t.name()),
            Self::CapacityExceeded => f.write_str("field exceeds client capacity"),
            Self::PacketTooLarge => f.write_str("packet exceeds maximum size"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CodecError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::NeedMoreData => defmt::write!(f, "NeedMoreData"),
            Self::InvalidRemainingLength => defmt::write!(f, "InvalidRemainingLength"),
            Self::UnknownPacketType(t) => defmt::write!(f, "UnknownPacketType({})", t),
            Self::InvalidHeaderFlags(t) => defmt::write!(f, "InvalidHeaderFlags({})", t.name()),
            Self::LengthMismatch(t) => defmt::write!(f, "LengthMismatch({})", t.name()),
            Self::InvalidUtf8 => defmt::write!(f, "InvalidUtf8"),
            Self::InvalidQoS(q) => defmt::write!(f, "InvalidQoS({})", q),
            Self::InvalidProtocol => defmt::write!(f, "InvalidProtocol"),
            Self::InvalidConnectFlags => defmt::write!(f, "InvalidConnectFlags"),
            Self::InvalidReturnCode(c) => defmt::write!(f, "InvalidReturnCode({})", c),
            Self::InvalidPacketId => defmt::write!(f, "InvalidPacketId"),
            Self::InvalidTopic => defmt::write!(f, "InvalidTopic"),
            Self::EmptyPayload(t) => defmt::write!(f, "EmptyPayload({})", t.name()),
            Self::CapacityExceeded => defmt::write!(f, "CapacityExceeded"),
            Self::PacketTooLarge => defmt::write!(f, "PacketTooLarge"),
        }
    }
}

/// CONNECT: the first packet a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier
    pub client_id: String<MAX_CLIENT_ID_LEN>,
    /// Keep-alive interval in seconds; 0 disables keep-alive
    pub keep_alive: u16,
    /// Discard any previous session state on the server
    pub clean_session: bool,
    /// Optional user name
    pub username: Option<String<MAX_USERNAME_LEN>>,
    /// Optional password; only valid together with a user name
    pub password: Option<Vec<u8, MAX_PASSWORD_LEN>>,
}

/// CONNACK: the server's answer to CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    /// The server resumed a stored session
    pub session_present: bool,
    /// Outcome of the connection attempt
    pub code: ConnectReturnCode,
}

/// PUBLISH: an application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Re-delivery of an earlier attempt
    pub dup: bool,
    /// Delivery guarantee
    pub qos: QoS,
    /// Ask the server to retain the message for future subscribers
    pub retain: bool,
    /// Topic name (no wildcards)
    pub topic: String<MAX_TOPIC_LEN>,
    /// Present exactly when `qos` is 1 or 2
    pub packet_id: Option<u16>,
    /// Application payload
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl Publish {
    /// Build a PUBLISH, checking topic and payload against the codec capacities.
    pub fn new(
        topic: &str,
        payload: &[u8],
        qos: QoS,
        packet_id: Option<u16>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic: String::try_from(topic).map_err(|_| CodecError::CapacityExceeded)?,
            packet_id,
            payload: Vec::from_slice(payload).map_err(|_| CodecError::CapacityExceeded)?,
        })
    }
}

/// One entry of a SUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    /// Topic filter, wildcards allowed
    pub filter: String<MAX_TOPIC_LEN>,
    /// Maximum QoS requested for matching messages
    pub qos: QoS,
}

/// SUBSCRIBE: request one or more subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Identifier echoed by the SUBACK
    pub packet_id: u16,
    /// Requested filters, at least one
    pub filters: Vec<SubscribeFilter, MAX_FILTERS>,
}

/// SUBACK: per-filter results of a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    /// Identifier of the acknowledged SUBSCRIBE
    pub packet_id: u16,
    /// One code per requested filter, in request order
    pub return_codes: Vec<SubscribeReturnCode, MAX_FILTERS>,
}

/// UNSUBSCRIBE: remove one or more subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Identifier echoed by the UNSUBACK
    pub packet_id: u16,
    /// Filters to remove, at least one
    pub filters: Vec<String<MAX_TOPIC_LEN>, MAX_FILTERS>,
}

/// An MQTT 3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT
    Connect(Connect),
    /// CONNACK
    Connack(Connack),
    /// PUBLISH
    Publish(Publish),
    /// PUBACK with its packet identifier
    Puback(u16),
    /// PUBREC with its packet identifier
    Pubrec(u16),
    /// PUBREL with its packet identifier
    Pubrel(u16),
    /// PUBCOMP with its packet identifier
    Pubcomp(u16),
    /// SUBSCRIBE
    Subscribe(Subscribe),
    /// SUBACK
    Suback(Suback),
    /// UNSUBSCRIBE
    Unsubscribe(Unsubscribe),
    /// UNSUBACK with its packet identifier
    Unsuback(u16),
    /// PINGREQ
    Pingreq,
    /// PINGRESP
    Pingresp,
    /// DISCONNECT
    Disconnect,
}

impl Packet {
    /// The control packet type.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::Connack(_) => PacketType::Connack,
            Self::Publish(_) => PacketType::Publish,
            Self::Puback(_) => PacketType::Puback,
            Self::Pubrec(_) => PacketType::Pubrec,
            Self::Pubrel(_) => PacketType::Pubrel,
            Self::Pubcomp(_) => PacketType::Pubcomp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::Suback(_) => PacketType::Suback,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::Unsuback(_) => PacketType::Unsuback,
            Self::Pingreq => PacketType::Pingreq,
            Self::Pingresp => PacketType::Pingresp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// The packet identifier, for packet types that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.packet_id,
            Self::Puback(id)
            | Self::Pubrec(id)
            | Self::Pubrel(id)
            | Self::Pubcomp(id)
            | Self::Unsuback(id) => Some(*id),
            Self::Subscribe(s) => Some(s.packet_id),
            Self::Suback(s) => Some(s.packet_id),
            Self::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }

    fn header_flags(&self) -> u8 {
        match self {
            Self::Publish(p) => {
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= PUBLISH_FLAG_DUP;
                }
                if p.retain {
                    flags |= PUBLISH_FLAG_RETAIN;
                }
                flags
            }
            Self::Pubrel(_) | Self::Subscribe(_) | Self::Unsubscribe(_) => FLAGS_RESERVED_0010,
            _ => 0,
        }
    }

    fn remaining_length(&self) -> usize {
        match self {
            Self::Connect(c) => {
                let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + c.client_id.len();
                if let Some(username) = &c.username {
                    len += 2 + username.len();
                }
                if let Some(password) = &c.password {
                    len += 2 + password.len();
                }
                len
            }
            Self::Connack(_) => 2,
            Self::Publish(p) => {
                2 + p.topic.len() + p.packet_id.map_or(0, |_| 2) + p.payload.len()
            }
            Self::Puback(_)
            | Self::Pubrec(_)
            | Self::Pubrel(_)
            | Self::Pubcomp(_)
            | Self::Unsuback(_) => 2,
            Self::Subscribe(s) => 2 + s.filters.iter().map(|f| 2 + f.filter.len() + 1).sum::<usize>(),
            Self::Suback(s) => 2 + s.return_codes.len(),
            Self::Unsubscribe(u) => 2 + u.filters.iter().map(|f| 2 + f.len()).sum::<usize>(),
            Self::Pingreq | Self::Pingresp | Self::Disconnect => 0,
        }
    }

    /// Append the wire form of this packet to `out`.
    ///
    /// Returns the number of bytes written. On error `out` is left as it was.
    pub fn encode<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<usize, CodecError> {
        let start = out.len();
        let result = self.encode_into(out);
        match result {
            Ok(()) => Ok(out.len() - start),
            Err(e) => {
                out.truncate(start);
                Err(e)
            }
        }
    }

    fn encode_into<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<(), CodecError> {
        let remaining = self.remaining_length();

        // --- Fixed Header ---
        push(out, ((self.packet_type() as u8) << 4) | self.header_flags())?;
        encode_remaining_length(out, remaining)?;

        // --- Variable Header and Payload ---
        match self {
            Self::Connect(c) => {
                if c.password.is_some() && c.username.is_none() {
                    return Err(CodecError::InvalidConnectFlags);
                }
                push_str(out, PROTOCOL_NAME)?;
                push(out, PROTOCOL_LEVEL)?;
                let mut flags = 0;
                if c.clean_session {
                    flags |= CONNECT_FLAG_CLEAN_SESSION;
                }
                if c.username.is_some() {
                    flags |= CONNECT_FLAG_USERNAME;
                }
                if c.password.is_some() {
                    flags |= CONNECT_FLAG_PASSWORD;
                }
                push(out, flags)?;
                push_u16(out, c.keep_alive)?;
                push_str(out, &c.client_id)?;
                if let Some(username) = &c.username {
                    push_str(out, username)?;
                }
                if let Some(password) = &c.password {
                    push_bytes(out, password)?;
                }
            }
            Self::Connack(c) => {
                push(out, c.session_present as u8)?;
                push(out, c.code as u8)?;
            }
            Self::Publish(p) => {
                if p.qos == QoS::AtMostOnce && (p.packet_id.is_some() || p.dup) {
                    return Err(CodecError::InvalidHeaderFlags(PacketType::Publish));
                }
                push_str(out, &p.topic)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (_, Some(id)) if id != 0 => push_u16(out, id)?,
                    _ => return Err(CodecError::InvalidPacketId),
                }
                extend(out, &p.payload)?;
            }
            Self::Puback(id)
            | Self::Pubrec(id)
            | Self::Pubrel(id)
            | Self::Pubcomp(id)
            | Self::Unsuback(id) => push_u16(out, *id)?,
            Self::Subscribe(s) => {
                if s.filters.is_empty() {
                    return Err(CodecError::EmptyPayload(PacketType::Subscribe));
                }
                push_u16(out, s.packet_id)?;
                for f in &s.filters {
                    push_str(out, &f.filter)?;
                    push(out, f.qos as u8)?;
                }
            }
            Self::Suback(s) => {
                push_u16(out, s.packet_id)?;
                for code in &s.return_codes {
                    push(out, code.to_byte())?;
                }
            }
            Self::Unsubscribe(u) => {
                if u.filters.is_empty() {
                    return Err(CodecError::EmptyPayload(PacketType::Unsubscribe));
                }
                push_u16(out, u.packet_id)?;
                for f in &u.filters {
                    push_str(out, f)?;
                }
            }
            Self::Pingreq | Self::Pingresp | Self::Disconnect => {}
        }
        Ok(())
    }
}

/// Declared size of the PUBLISH at the front of `data`, read from the fixed
/// header alone.
///
/// A reader uses it to skip a PUBLISH that [`decode`] rejected with
/// [`CodecError::PacketTooLarge`] and keep the connection. Returns `None`
/// unless `data` starts with a complete PUBLISH fixed header.
pub fn publish_frame_len(data: &[u8]) -> Option<usize> {
    let first = *data.first()?;
    if PacketType::from_header(first) != Some(PacketType::Publish) {
        return None;
    }
    let (remaining, len_bytes) = decode_remaining_length(&data[1..]).ok()?;
    Some(1 + len_bytes + remaining)
}

/// Decode one packet from the front of `data`.
///
/// Returns the packet and the number of bytes it occupied. Trailing bytes
/// belong to the next packet and are left untouched.
pub fn decode(data: &[u8]) -> Result<(Packet, usize), CodecError> {
    let Some(&first) = data.first() else {
        return Err(CodecError::NeedMoreData);
    };
    let packet_type = PacketType::from_header(first).ok_or(CodecError::UnknownPacketType(first >> 4))?;
    let flags = first & 0x0F;

    let (remaining, len_bytes) = decode_remaining_length(&data[1..])?;
    let total = 1 + len_bytes + remaining;
    if total > MAX_PACKET_LEN {
        return Err(CodecError::PacketTooLarge);
    }
    if data.len() < total {
        return Err(CodecError::NeedMoreData);
    }

    let body = &data[1 + len_bytes..total];
    let expected_flags = match packet_type {
        PacketType::Publish => flags,
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => FLAGS_RESERVED_0010,
        _ => 0,
    };
    if flags != expected_flags {
        return Err(CodecError::InvalidHeaderFlags(packet_type));
    }

    let mut reader = Reader::new(body, packet_type);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut reader)?),
        PacketType::Connack => {
            let ack_flags = reader.u8()?;
            if ack_flags & !0x01 != 0 {
                return Err(CodecError::InvalidHeaderFlags(PacketType::Connack));
            }
            let code = ConnectReturnCode::try_from(reader.u8()?)?;
            Packet::Connack(Connack {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut reader)?),
        PacketType::Puback => Packet::Puback(reader.packet_id()?),
        PacketType::Pubrec => Packet::Pubrec(reader.packet_id()?),
        PacketType::Pubrel => Packet::Pubrel(reader.packet_id()?),
        PacketType::Pubcomp => Packet::Pubcomp(reader.packet_id()?),
        PacketType::Subscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while !reader.is_empty() {
                let filter = reader.string()?;
                let qos_byte = reader.u8()?;
                if qos_byte & 0xFC != 0 {
                    return Err(CodecError::InvalidHeaderFlags(PacketType::Subscribe));
                }
                let qos = QoS::try_from(qos_byte)?;
                filters
                    .push(SubscribeFilter { filter, qos })
                    .map_err(|_| CodecError::CapacityExceeded)?;
            }
            if filters.is_empty() {
                return Err(CodecError::EmptyPayload(PacketType::Subscribe));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::Suback => {
            let packet_id = reader.packet_id()?;
            let mut return_codes = Vec::new();
            while !reader.is_empty() {
                let code = SubscribeReturnCode::from_byte(reader.u8()?)?;
                return_codes
                    .push(code)
                    .map_err(|_| CodecError::CapacityExceeded)?;
            }
            if return_codes.is_empty() {
                return Err(CodecError::EmptyPayload(PacketType::Suback));
            }
            Packet::Suback(Suback {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while !reader.is_empty() {
                filters
                    .push(reader.string()?)
                    .map_err(|_| CodecError::CapacityExceeded)?;
            }
            if filters.is_empty() {
                return Err(CodecError::EmptyPayload(PacketType::Unsubscribe));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        PacketType::Unsuback => Packet::Unsuback(reader.packet_id()?),
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    reader.finish()?;
    Ok((packet, total))
}

fn decode_connect(reader: &mut Reader<'_>) -> Result<Connect, CodecError> {
    let name: String<4> = reader.string().map_err(|e| match e {
        CodecError::CapacityExceeded => CodecError::InvalidProtocol,
        other => other,
    })?;
    if name != PROTOCOL_NAME || reader.u8()? != PROTOCOL_LEVEL {
        return Err(CodecError::InvalidProtocol);
    }

    let flags = reader.u8()?;
    let has_username = flags & CONNECT_FLAG_USERNAME != 0;
    let has_password = flags & CONNECT_FLAG_PASSWORD != 0;
    let will_bits = CONNECT_FLAG_WILL | CONNECT_FLAG_WILL_QOS | CONNECT_FLAG_WILL_RETAIN;
    if flags & CONNECT_FLAG_RESERVED != 0 || flags & will_bits != 0 || (has_password && !has_username) {
        return Err(CodecError::InvalidConnectFlags);
    }

    let keep_alive = reader.u16()?;
    let client_id = reader.string()?;
    let username = if has_username { Some(reader.string()?) } else { None };
    let password = if has_password { Some(reader.bytes()?) } else { None };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags & CONNECT_FLAG_CLEAN_SESSION != 0,
        username,
        password,
    })
}

fn decode_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Publish, CodecError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let dup = flags & PUBLISH_FLAG_DUP != 0;
    if qos == QoS::AtMostOnce && dup {
        return Err(CodecError::InvalidHeaderFlags(PacketType::Publish));
    }

    let topic: String<MAX_TOPIC_LEN> = reader.string().map_err(too_large)?;
    topic::validate_name(&topic).map_err(|_| CodecError::InvalidTopic)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(reader.packet_id()?),
    };
    let payload = Vec::from_slice(reader.rest()).map_err(|_| CodecError::PacketTooLarge)?;

    Ok(Publish {
        dup,
        qos,
        retain: flags & PUBLISH_FLAG_RETAIN != 0,
        topic,
        packet_id,
        payload,
    })
}

fn too_large(error: CodecError) -> CodecError {
    match error {
        CodecError::CapacityExceeded => CodecError::PacketTooLarge,
        other => other,
    }
}

/// Cursor over the body of one packet whose full length is known.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    packet_type: PacketType,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], packet_type: PacketType) -> Self {
        Self {
            data,
            pos: 0,
            packet_type,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        // The whole packet is buffered, so running short means the fields
        // disagree with the declared remaining length
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        let end = end.ok_or(CodecError::LengthMismatch(self.packet_type))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn packet_id(&mut self) -> Result<u16, CodecError> {
        match self.u16()? {
            0 => Err(CodecError::InvalidPacketId),
            id => Ok(id),
        }
    }

    fn string<const N: usize>(&mut self) -> Result<String<N>, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        let text = core::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
        if text.contains('\0') {
            return Err(CodecError::InvalidUtf8);
        }
        String::try_from(text).map_err(|_| CodecError::CapacityExceeded)
    }

    fn bytes<const N: usize>(&mut self) -> Result<Vec<u8, N>, CodecError> {
        let len = self.u16()? as usize;
        Vec::from_slice(self.take(len)?).map_err(|_| CodecError::CapacityExceeded)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::LengthMismatch(self.packet_type))
        }
    }
}

/// Encode the remaining length field for an MQTT packet.
///
/// Each byte carries seven bits of the value, least significant group first;
/// the top bit marks that another byte follows. Four bytes reach
/// [`MAX_REMAINING_LENGTH`].
pub fn encode_remaining_length<const N: usize>(
    buf: &mut Vec<u8, N>,
    mut len: usize,
) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::InvalidRemainingLength);
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        push(buf, byte)?;
        if len == 0 {
            break;
        }
    }
    Ok(())
}

/// Decode a remaining length field, returning `(value, bytes used)`.
pub fn decode_remaining_length(data: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut value = 0usize;
    for i in 0..4 {
        let Some(&byte) = data.get(i) else {
            return Err(CodecError::NeedMoreData);
        };
        value += ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::InvalidRemainingLength)
}

fn push<const N: usize>(out: &mut Vec<u8, N>, byte: u8) -> Result<(), CodecError> {
    out.push(byte).map_err(|_| CodecError::CapacityExceeded)
}

fn extend<const N: usize>(out: &mut Vec<u8, N>, bytes: &[u8]) -> Result<(), CodecError> {
    out.extend_from_slice(bytes)
        .map_err(|_| CodecError::CapacityExceeded)
}

fn push_u16<const N: usize>(out: &mut Vec<u8, N>, value: u16) -> Result<(), CodecError> {
    extend(out, &value.to_be_bytes())
}

fn push_bytes<const N: usize>(out: &mut Vec<u8, N>, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::CapacityExceeded)?;
    push_u16(out, len)?;
    extend(out, bytes)
}

fn push_str<const N: usize>(out: &mut Vec<u8, N>, text: &str) -> Result<(), CodecError> {
    push_bytes(out, text.as_bytes())
}
