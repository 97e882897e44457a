//! MQTT 3.1.1 client core.
//!
//! The module is split the way data flows through a client:
//!
//! ```text
//! ┌─────────────────┐  operations   ┌─────────────────┐  packets   ┌─────────────────┐
//! │  Client facade  │──────────────▶│  Session state  │───────────▶│   Wire codec    │
//! │  (client, std)  │◀──────────────│  machine        │◀───────────│   (packet)      │
//! └─────────────────┘    events     └─────────────────┘            └─────────────────┘
//!          │                                                                │
//!          ▼                                                                ▼
//! ┌─────────────────┐                                             ┌─────────────────┐
//! │  Reader thread  │◀──────────────── bytes ─────────────────────│    Transport    │
//! └─────────────────┘                                             └─────────────────┘
//! ```
//!
//! - [`packet`]: encodes and decodes every MQTT 3.1.1 control packet.
//! - [`session`]: connection state, in-flight QoS 1/2 messages, pending
//!   subscriptions, keep-alive and retransmission timers. It never touches
//!   the network; side effects go through an [`session::Outbox`].
//! - [`client`] (feature `std`): the public facade. It owns the transport,
//!   runs one reader thread per connection and dispatches [`Event`]s to
//!   handlers.
//!
//! Everything except [`client`] is `no_std` and allocation free.

/// Client facade and transport driver.
#[cfg(feature = "std")]
pub mod client;

/// MQTT error taxonomy.
pub mod error;

/// Events delivered to handlers.
pub mod event;

/// Client configuration.
pub mod options;

/// Wire codec for MQTT 3.1.1 control packets.
pub mod packet;

/// Session state machine.
pub mod session;

/// Topic name and topic filter rules.
pub mod topic;

#[cfg(feature = "std")]
pub use client::{Client, EventHandler, Handler, WeakClient};
pub use error::{Error, Precondition, Violation};
pub use event::{Event, Info, Message};
pub use options::{Credentials, Options};
pub use packet::{CodecError, Packet, QoS};
pub use session::{ConnectionState, Session};

/// Maximum topic name or topic filter length in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// Maximum application payload in bytes.
///
/// An inbound PUBLISH with a larger payload is discarded without an
/// acknowledgement and reported to the registered event handler as
/// [`CodecError::PacketTooLarge`]; the connection stays up.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Maximum client identifier length in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Maximum user name length in bytes.
pub const MAX_USERNAME_LEN: usize = 64;

/// Maximum password length in bytes.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Maximum number of topic filters in a decoded SUBSCRIBE or UNSUBSCRIBE.
pub const MAX_FILTERS: usize = 4;

/// Maximum number of outbound operations awaiting acknowledgement.
pub const MAX_INFLIGHT: usize = 16;

/// Maximum number of inbound QoS 2 messages awaiting PUBREL.
pub const MAX_INBOUND: usize = 32;

/// Maximum number of tracked subscriptions.
pub const MAX_SUBSCRIPTIONS: usize = 16;

/// Largest encoded packet: a PUBLISH with maximal topic and payload.
pub const MAX_PACKET_LEN: usize = 1 + 4 + 2 + MAX_TOPIC_LEN + 2 + MAX_PAYLOAD_LEN;
