//! # libmqtt - MQTT 3.1.1 client core
//!
//! A small MQTT 3.1.1 client built from three layers:
//!
//! - a **wire codec** for every control packet ([`mqtt::packet`]),
//! - a **session state machine** tracking connection state, in-flight QoS 1/2
//!   handshakes, subscriptions and keep-alive ([`mqtt::session`]),
//! - a **client facade** that owns a transport and a reader thread and turns
//!   broker traffic into [`mqtt::Event`]s ([`mqtt::client`], feature `std`).
//!
//! The codec and the session are `no_std` and allocation free; they use
//! [`heapless`] containers with the capacities listed in [`mqtt`].
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libmqtt = "0.1.0"
//! ```
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use libmqtt::mqtt::{client, Client, Credentials, Event, Options, QoS};
//!
//! let client = Client::tcp("tcp://192.168.1.11:1883", None, Options::default()).unwrap();
//!
//! let publisher = client.clone();
//! client.connect(
//!     &Credentials::new("user", "pass").unwrap(),
//!     client::handler(move |event| match event {
//!         Event::Connected => publisher.publish(
//!             "sensors/temperature",
//!             b"23.5",
//!             QoS::AtLeastOnce,
//!             client::handler(|outcome| println!("{:?}", outcome)),
//!         ),
//!         Event::Failure(error) => eprintln!("connect failed: {}", error),
//!         _ => {}
//!     }),
//! );
//! ```
//!
//! ### Driving a Session Directly
//!
//! Without `std`, a [`mqtt::Session`] can be driven from any event loop by
//! implementing [`mqtt::session::Outbox`]:
//!
//! ```rust
//! use libmqtt::mqtt::packet::{Connack, ConnectReturnCode};
//! use libmqtt::mqtt::session::Outbox;
//! use libmqtt::mqtt::{ConnectionState, Credentials, Event, Options, Packet, Session};
//!
//! struct Log;
//! impl Outbox<u8> for Log {
//!     fn transmit(&mut self, packet: &Packet) { /* encode and write */ }
//!     fn notify(&mut self, handler: Option<u8>, event: Event) { /* dispatch */ }
//! }
//!
//! let mut session: Session<u8> = Session::new("device-1", Options::default()).unwrap();
//! session.connect(&Credentials::anonymous(), Some(0), 0, &mut Log).unwrap();
//! session.handle_packet(
//!     Packet::Connack(Connack { session_present: false, code: ConnectReturnCode::Accepted }),
//!     10,
//!     &mut Log,
//! );
//! assert_eq!(session.state(), ConnectionState::Connected);
//! ```
//!
//! ## Optional Features
//!
//! - `std` (default): TCP transport, the threaded [`mqtt::Client`] and
//!   random client identifiers
//! - `defmt`: `defmt::Format` implementations for error types

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![doc(html_root_url = "https://shishir-dey.github.io/libmqtt/")]

/// Transport abstraction: connection traits, server URIs and a TCP
/// implementation.
pub mod network;

/// MQTT 3.1.1 codec, session state machine and client.
pub mod mqtt;
