//! Events delivered to handlers.
//!
//! Every operation ends with exactly one [`Event::Success`] or
//! [`Event::Failure`]. Inbound application messages arrive as
//! [`Event::Message`]; a completed connection additionally produces
//! [`Event::Connected`].

use super::error::Error;
use super::packet::QoS;
use super::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};
use heapless::{String, Vec};

/// An event produced by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The broker accepted the connection
    Connected,
    /// An application message arrived
    Message(Message),
    /// An operation completed
    Success(Info),
    /// An operation failed, or an established connection was lost
    Failure(Error),
}

/// An inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to
    pub topic: String<MAX_TOPIC_LEN>,
    /// Application payload
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
    /// QoS the message was delivered with
    pub qos: QoS,
    /// The message was retained by the broker
    pub retain: bool,
}

impl Message {
    /// Payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}

/// Description of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    /// CONNACK accepted
    Connected {
        /// The broker resumed a stored session
        session_present: bool,
    },
    /// SUBACK granted
    Subscribed {
        /// Subscribed filter
        topic: String<MAX_TOPIC_LEN>,
        /// QoS granted by the broker
        qos: QoS,
    },
    /// UNSUBACK received
    Unsubscribed {
        /// Removed filter
        topic: String<MAX_TOPIC_LEN>,
    },
    /// Publish handshake finished (immediately for QoS 0)
    Published {
        /// Destination topic
        topic: String<MAX_TOPIC_LEN>,
        /// QoS used
        qos: QoS,
    },
    /// DISCONNECT handed to the transport
    Disconnected,
}

impl core::fmt::Display for Info {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Info::Connected { session_present: true } => f.write_str("connected, session resumed"),
            Info::Connected { session_present: false } => f.write_str("connected"),
            Info::Subscribed { topic, qos } => write!(f, "subscribed to {} at QoS {}", topic, *qos as u8),
            Info::Unsubscribed { topic } => write!(f, "unsubscribed from {}", topic),
            Info::Published { topic, qos } => write!(f, "published to {} at QoS {}", topic, *qos as u8),
            Info::Disconnected => f.write_str("disconnected"),
        }
    }
}
