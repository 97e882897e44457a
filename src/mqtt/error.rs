//! Errors reported by the MQTT session and client.
//!
//! Every failed operation ends in exactly one [`Error`], delivered either as
//! the `Err` of the call (preconditions) or as an
//! [`Event::Failure`](super::Event::Failure) to the operation's handler.

use super::packet::{CodecError, ConnectReturnCode, PacketType};
use crate::network;

/// Top-level MQTT error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The operation was rejected before anything was sent.
    Precondition(Precondition),
    /// An inbound packet could not be decoded.
    Malformed(CodecError),
    /// The broker sent a well-formed packet that makes no sense in the
    /// current state.
    ProtocolViolation(Violation),
    /// The broker answered CONNECT with a non-zero return code.
    ConnectionRefused(ConnectReturnCode),
    /// The link dropped while the operation was pending.
    ConnectionLost(network::Error),
    /// The transport could not be opened.
    Network(network::Error),
    /// No acknowledgement arrived in time.
    Timeout,
    /// The broker refused a subscription (SUBACK 0x80).
    SubscriptionRejected,
    /// The operation was abandoned by a call to disconnect.
    Cancelled,
}

/// Synchronous precondition failures.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Precondition {
    /// No server URI was configured
    EmptyServerUri,
    /// The server URI could not be parsed
    InvalidServerUri,
    /// Topic or filter is empty
    EmptyTopic,
    /// Topic contains wildcards where not allowed, misplaced wildcards, NUL, or is too long
    InvalidTopic,
    /// Publish payload is empty
    EmptyPayload,
    /// Publish payload exceeds the client's capacity
    PayloadTooLong,
    /// The session is not connected
    NotConnected,
    /// A connection is already established or in progress
    AlreadyConnected,
    /// Too many operations are awaiting acknowledgement
    InflightFull,
    /// The client identifier exceeds the client's capacity
    ClientIdTooLong,
    /// User name or password exceed the client's capacity
    CredentialsTooLong,
    /// A password was given without a user name
    PasswordWithoutUsername,
    /// The subscription table is full
    TooManySubscriptions,
}

/// Ways the broker can break the protocol.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Violation {
    /// A packet type that is not valid in the current state or never sent by a broker
    UnexpectedPacket(PacketType),
    /// An acknowledgement for an identifier that is not pending at the matching stage
    UnknownPacketId(PacketType, u16),
    /// More inbound QoS 2 messages awaiting PUBREL than the client tracks
    InboundWindowFull,
}

impl From<Precondition> for Error {
    fn from(value: Precondition) -> Self {
        Error::Precondition(value)
    }
}

impl From<CodecError> for Error {
    fn from(value: CodecError) -> Self {
        Error::Malformed(value)
    }
}

impl From<Violation> for Error {
    fn from(value: Violation) -> Self {
        Error::ProtocolViolation(value)
    }
}

impl Error {
    /// The network error an operation pending on a link that failed with
    /// `self` should report.
    pub(crate) fn as_network(&self) -> network::Error {
        match self {
            Error::ConnectionLost(e) | Error::Network(e) => *e,
            Error::Timeout => network::Error::Timeout,
            Error::Malformed(_) | Error::ProtocolViolation(_) => network::Error::ProtocolError,
            Error::ConnectionRefused(_) => network::Error::ConnectionRefused,
            _ => network::Error::ConnectionClosed,
        }
    }
}

impl core::fmt::Display for Precondition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Precondition::EmptyServerUri => "server URI is empty",
            Precondition::InvalidServerUri => "server URI is invalid",
            Precondition::EmptyTopic => "topic is empty",
            Precondition::InvalidTopic => "topic is invalid",
            Precondition::EmptyPayload => "payload is empty",
            Precondition::PayloadTooLong => "payload is too long",
            Precondition::NotConnected => "client is not connected",
            Precondition::AlreadyConnected => "client is already connected",
            Precondition::InflightFull => "too many operations in flight",
            Precondition::ClientIdTooLong => "client identifier is too long",
            Precondition::CredentialsTooLong => "user name or password is too long",
            Precondition::PasswordWithoutUsername => "password given without user name",
            Precondition::TooManySubscriptions => "too many subscriptions",
        })
    }
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Violation::UnexpectedPacket(t) => write!(f, "unexpected {}", t.name()),
            Violation::UnknownPacketId(t, id) => write!(f, "{} for unknown packet id {}", t.name(), id),
            Violation::InboundWindowFull => f.write_str("too many inbound QoS 2 messages"),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Precondition(p) => write!(f, "{}", p),
            Error::Malformed(e) => write!(f, "malformed packet: {}", e),
            Error::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            Error::ConnectionRefused(code) => write!(f, "connection refused: {}", code),
            Error::ConnectionLost(e) => write!(f, "connection lost: {}", e),
            Error::Network(e) => write!(f, "network error: {}", e),
            Error::Timeout => f.write_str("timed out waiting for the broker"),
            Error::SubscriptionRejected => f.write_str("subscription rejected by the broker"),
            Error::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Precondition(p) => defmt::write!(f, "Precondition({})", p),
            Error::Malformed(e) => defmt::write!(f, "Malformed({})", e),
            Error::ProtocolViolation(v) => defmt::write!(f, "ProtocolViolation({})", v),
            Error::ConnectionRefused(code) => defmt::write!(f, "ConnectionRefused({})", *code as u8),
            Error::ConnectionLost(e) => defmt::write!(f, "ConnectionLost({})", e),
            Error::Network(e) => defmt::write!(f, "Network({})", e),
            Error::Timeout => defmt::write!(f, "Timeout"),
            Error::SubscriptionRejected => defmt::write!(f, "SubscriptionRejected"),
            Error::Cancelled => defmt::write!(f, "Cancelled"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Precondition {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=u8}", *self as u8)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Violation {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Violation::UnexpectedPacket(t) => defmt::write!(f, "UnexpectedPacket({})", t.name()),
            Violation::UnknownPacketId(t, id) => defmt::write!(f, "UnknownPacketId({}, {})", t.name(), id),
            Violation::InboundWindowFull => defmt::write!(f, "InboundWindowFull"),
        }
    }
}
