//! MQTT session state machine.
//!
//! [`Session`] owns everything a client must remember between packets: the
//! connection state, outbound operations awaiting acknowledgement, inbound
//! QoS 2 identifiers awaiting PUBREL, and the subscription table. It never
//! performs I/O. Packets to send and events to deliver are handed to an
//! [`Outbox`], and time is a caller-supplied monotonic millisecond counter,
//! which keeps the session usable from `no_std` code and deterministic in
//! tests.
//!
//! ```text
//!               connect()               CONNACK (accepted)
//! Disconnected ──────────▶ Connecting ──────────────────────▶ Connected
//!      ▲                    │  │  CONNACK refused / timeout       │
//!      │◀───────────────────┘  │                                  │ disconnect()
//!      │      link lost        │ disconnect()                     ▼
//!      │◀──────────────────────┴──────────────────────────── Disconnecting
//!                    disconnected() / link lost
//! ```
//!
//! Each operation receives a handler token `H`. The session hands the token
//! back with exactly one terminal [`Event::Success`] or [`Event::Failure`].
//! A `None` handler addresses the client's registered event handler.

use super::error::{Error, Precondition, Violation};
use super::event::{Event, Info, Message};
use super::options::{Credentials, Options};
use super::packet::{
    Connack, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, Suback, Subscribe,
    SubscribeFilter, SubscribeReturnCode, Unsubscribe,
};
use super::topic::{self, TopicError};
use super::{
    MAX_CLIENT_ID_LEN, MAX_INBOUND, MAX_INFLIGHT, MAX_PAYLOAD_LEN, MAX_SUBSCRIPTIONS,
    MAX_TOPIC_LEN,
};
use heapless::{FnvIndexMap, FnvIndexSet, String, Vec};

/// Receiver of the session's side effects.
pub trait Outbox<H> {
    /// Send a packet to the broker.
    fn transmit(&mut self, packet: &Packet);
    /// Deliver an event to `handler`, or to the registered event handler when `None`.
    fn notify(&mut self, handler: Option<H>, event: Event);
}

/// Connection life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection
    #[default]
    Disconnected,
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK accepted
    Connected,
    /// DISCONNECT queued, waiting for the transport to take it
    Disconnecting,
}

/// Life cycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// SUBSCRIBE sent, waiting for SUBACK
    Pending,
    /// Granted by the broker
    Active,
    /// UNSUBSCRIBE sent, waiting for UNSUBACK
    Removing,
}

#[derive(Debug)]
struct Subscription<H> {
    filter: String<MAX_TOPIC_LEN>,
    qos: QoS,
    state: SubscriptionState,
    handler: Option<H>,
    /// The active subscription a pending re-subscribe replaced
    replaced: Option<Replaced<H>>,
}

#[derive(Debug)]
struct Replaced<H> {
    qos: QoS,
    handler: Option<H>,
}

/// Stage of an outbound QoS 1/2 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// PUBLISH written, waiting for PUBACK (QoS 1) or PUBREC (QoS 2)
    Sent,
    /// PUBREL written, waiting for PUBCOMP
    Released,
}

#[derive(Debug)]
enum Pending {
    Publish { publish: Publish, stage: Stage },
    Subscribe { filter: String<MAX_TOPIC_LEN>, qos: QoS },
    Unsubscribe { filter: String<MAX_TOPIC_LEN> },
}

#[derive(Debug)]
struct Outgoing<H> {
    pending: Pending,
    handler: Option<H>,
    /// Issue order, for failing operations in the order they were started
    sequence: u32,
    retries: u8,
    /// Set once any step was retransmitted; the broker may then ack twice
    resent: bool,
    last_sent_ms: u64,
}

/// Identifiers of completed or expired operations that were retransmitted.
/// Power of two, as `FnvIndexSet` requires.
const RETIRED_IDS: usize = 2 * MAX_INFLIGHT;

/// MQTT 3.1.1 client session.
#[derive(Debug)]
pub struct Session<H> {
    client_id: String<MAX_CLIENT_ID_LEN>,
    options: Options,
    state: ConnectionState,
    next_packet_id: u16,
    next_sequence: u32,
    outgoing: FnvIndexMap<u16, Outgoing<H>, MAX_INFLIGHT>,
    retired: FnvIndexSet<u16, RETIRED_IDS>,
    incoming: FnvIndexSet<u16, MAX_INBOUND>,
    subscriptions: Vec<Subscription<H>, MAX_SUBSCRIPTIONS>,
    connect_handler: Option<H>,
    disconnect_handler: Option<H>,
    connect_started_ms: u64,
    last_sent_ms: u64,
    ping_sent_ms: Option<u64>,
}

impl<H: Clone> Session<H> {
    /// Create a disconnected session.
    pub fn new(client_id: &str, options: Options) -> Result<Self, Precondition> {
        Ok(Self {
            client_id: String::try_from(client_id).map_err(|_| Precondition::ClientIdTooLong)?,
            options,
            state: ConnectionState::Disconnected,
            next_packet_id: 1,
            next_sequence: 0,
            outgoing: FnvIndexMap::new(),
            retired: FnvIndexSet::new(),
            incoming: FnvIndexSet::new(),
            subscriptions: Vec::new(),
            connect_handler: None,
            disconnect_handler: None,
            connect_started_ms: 0,
            last_sent_ms: 0,
            ping_sent_ms: None,
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Client identifier sent in CONNECT.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Session options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Number of outbound operations awaiting acknowledgement.
    pub fn inflight(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of inbound QoS 2 messages awaiting PUBREL.
    pub fn inbound_pending(&self) -> usize {
        self.incoming.len()
    }

    /// State of the subscription for `filter`, if one is tracked.
    pub fn subscription(&self, filter: &str) -> Option<SubscriptionState> {
        self.subscriptions
            .iter()
            .find(|s| s.filter == filter)
            .map(|s| s.state)
    }

    /// Start connecting: emits CONNECT and moves to `Connecting`.
    pub fn connect(
        &mut self,
        credentials: &Credentials,
        handler: Option<H>,
        now: u64,
        out: &mut impl Outbox<H>,
    ) -> Result<(), Error> {
        if self.state != ConnectionState::Disconnected {
            return Err(Precondition::AlreadyConnected.into());
        }
        if credentials.password.is_some() && credentials.username.is_none() {
            return Err(Precondition::PasswordWithoutUsername.into());
        }
        let password = match &credentials.password {
            Some(p) => Some(Vec::from_slice(p.as_bytes()).map_err(|_| Precondition::CredentialsTooLong)?),
            None => None,
        };

        let connect = Connect {
            client_id: self.client_id.clone(),
            keep_alive: self.options.keep_alive_secs,
            clean_session: self.options.clean_session,
            username: credentials.username.clone(),
            password,
        };

        if self.options.clean_session {
            self.incoming.clear();
        }
        self.retired.clear();
        self.state = ConnectionState::Connecting;
        self.connect_handler = handler;
        self.connect_started_ms = now;
        self.ping_sent_ms = None;
        log::info!("connecting as '{}'", self.client_id);
        self.transmit(&Packet::Connect(connect), now, out);
        Ok(())
    }

    /// Subscribe to `filter`, returning the SUBSCRIBE packet identifier.
    pub fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Option<H>,
        now: u64,
        out: &mut impl Outbox<H>,
    ) -> Result<u16, Error> {
        topic::validate_filter(filter).map_err(topic_precondition)?;
        self.require_connected()?;
        let existing = self.subscriptions.iter().position(|s| s.filter == filter);
        if existing.is_none() && self.subscriptions.is_full() {
            return Err(Precondition::TooManySubscriptions.into());
        }
        let filter: String<MAX_TOPIC_LEN> =
            String::try_from(filter).map_err(|_| Precondition::InvalidTopic)?;
        let packet_id = self.allocate_packet_id()?;

        let mut subscription = Subscription {
            filter: filter.clone(),
            qos,
            state: SubscriptionState::Pending,
            handler: handler.clone(),
            replaced: None,
        };
        match existing {
            Some(index) => {
                let previous = &mut self.subscriptions[index];
                subscription.replaced = match previous.state {
                    SubscriptionState::Active => Some(Replaced {
                        qos: previous.qos,
                        handler: previous.handler.take(),
                    }),
                    SubscriptionState::Pending => previous.replaced.take(),
                    SubscriptionState::Removing => None,
                };
                self.subscriptions[index] = subscription;
            }
            None => {
                if self.subscriptions.push(subscription).is_err() {
                    return Err(Precondition::TooManySubscriptions.into());
                }
            }
        }

        self.track(
            packet_id,
            Pending::Subscribe {
                filter: filter.clone(),
                qos,
            },
            handler,
            now,
        )?;
        log::debug!("subscribing to '{}' (id {})", filter, packet_id);
        self.transmit(&subscribe_packet(packet_id, &filter, qos), now, out);
        Ok(packet_id)
    }

    /// Unsubscribe from `filter`, returning the UNSUBSCRIBE packet identifier.
    pub fn unsubscribe(
        &mut self,
        filter: &str,
        handler: Option<H>,
        now: u64,
        out: &mut impl Outbox<H>,
    ) -> Result<u16, Error> {
        topic::validate_filter(filter).map_err(topic_precondition)?;
        self.require_connected()?;
        let filter: String<MAX_TOPIC_LEN> =
            String::try_from(filter).map_err(|_| Precondition::InvalidTopic)?;
        let packet_id = self.allocate_packet_id()?;

        if let Some(sub) = self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            sub.state = SubscriptionState::Removing;
        }
        self.track(
            packet_id,
            Pending::Unsubscribe {
                filter: filter.clone(),
            },
            handler,
            now,
        )?;
        log::debug!("unsubscribing from '{}' (id {})", filter, packet_id);
        self.transmit(&unsubscribe_packet(packet_id, &filter), now, out);
        Ok(packet_id)
    }

    /// Publish an application message.
    ///
    /// QoS 0 completes immediately and returns `None`; QoS 1 and 2 return
    /// the packet identifier of the handshake now in flight.
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        handler: Option<H>,
        now: u64,
        out: &mut impl Outbox<H>,
    ) -> Result<Option<u16>, Error> {
        topic::validate_name(topic).map_err(topic_precondition)?;
        if payload.is_empty() {
            return Err(Precondition::EmptyPayload.into());
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Precondition::PayloadTooLong.into());
        }
        self.require_connected()?;

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.allocate_packet_id()?),
        };
        let mut publish =
            Publish::new(topic, payload, qos, packet_id).map_err(|_| Precondition::PayloadTooLong)?;
        publish.retain = retain;

        let Some(id) = packet_id else {
            log::trace!("publishing to '{}' at QoS 0", topic);
            self.transmit(&Packet::Publish(publish), now, out);
            out.notify(
                handler,
                Event::Success(Info::Published {
                    topic: topic_string(topic),
                    qos,
                }),
            );
            return Ok(None);
        };

        log::debug!("publishing to '{}' at QoS {} (id {})", topic, qos as u8, id);
        let packet = Packet::Publish(publish.clone());
        self.track(
            id,
            Pending::Publish {
                publish,
                stage: Stage::Sent,
            },
            handler,
            now,
        )?;
        self.transmit(&packet, now, out);
        Ok(Some(id))
    }

    /// Begin an orderly disconnect.
    ///
    /// From `Connected` a DISCONNECT is emitted; from `Connecting` nothing is
    /// sent. Either way every pending operation fails with
    /// [`Error::Cancelled`] and the session moves to `Disconnecting` until
    /// [`Session::disconnected`] is called.
    pub fn disconnect(
        &mut self,
        handler: Option<H>,
        now: u64,
        out: &mut impl Outbox<H>,
    ) -> Result<(), Error> {
        match self.state {
            ConnectionState::Connected => {
                log::info!("disconnecting");
                self.transmit(&Packet::Disconnect, now, out);
            }
            ConnectionState::Connecting => {
                log::info!("abandoning connection attempt");
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                return Err(Precondition::NotConnected.into());
            }
        }

        self.state = ConnectionState::Disconnecting;
        self.disconnect_handler = handler;
        self.ping_sent_ms = None;
        self.fail_pending(Error::Cancelled, out);
        if let Some(connect_handler) = self.connect_handler.take() {
            out.notify(Some(connect_handler), Event::Failure(Error::Cancelled));
        }
        self.prune_subscriptions();
        Ok(())
    }

    /// The transport has taken the DISCONNECT (or there was nothing to send).
    pub fn disconnected(&mut self, out: &mut impl Outbox<H>) {
        if self.state != ConnectionState::Disconnecting {
            return;
        }
        self.state = ConnectionState::Disconnected;
        log::info!("disconnected");
        out.notify(self.disconnect_handler.take(), Event::Success(Info::Disconnected));
    }

    /// Feed one packet received from the broker.
    pub fn handle_packet(&mut self, packet: Packet, now: u64, out: &mut impl Outbox<H>) {
        log::trace!("received {}", packet.packet_type().name());
        let result = match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                log::debug!("ignoring {} while not connected", packet.packet_type().name());
                Ok(())
            }
            ConnectionState::Connecting => match packet {
                Packet::Connack(connack) => {
                    self.on_connack(connack, out);
                    Ok(())
                }
                other => Err(Violation::UnexpectedPacket(other.packet_type())),
            },
            ConnectionState::Connected => self.on_packet(packet, now, out),
        };

        if let Err(violation) = result {
            log::warn!("protocol violation: {}", violation);
            self.connection_lost(Error::ProtocolViolation(violation), out);
        }
    }

    /// Run timers: connect timeout, retransmissions, keep-alive.
    pub fn tick(&mut self, now: u64, out: &mut impl Outbox<H>) {
        match self.state {
            ConnectionState::Connecting => {
                let elapsed = now.saturating_sub(self.connect_started_ms);
                if elapsed >= u64::from(self.options.connect_timeout_ms) {
                    log::warn!("no CONNACK after {} ms", elapsed);
                    self.connection_lost(Error::Timeout, out);
                }
            }
            ConnectionState::Connected => {
                if let Some(sent) = self.ping_sent_ms {
                    if now.saturating_sub(sent) >= u64::from(self.options.ping_timeout_ms) {
                        log::warn!("no PINGRESP within {} ms", self.options.ping_timeout_ms);
                        self.connection_lost(Error::ConnectionLost(crate::network::Error::Timeout), out);
                        return;
                    }
                }
                self.retransmit(now, out);
                let keep_alive = self.options.keep_alive_ms();
                if keep_alive > 0
                    && self.ping_sent_ms.is_none()
                    && now.saturating_sub(self.last_sent_ms) >= keep_alive
                {
                    log::trace!("keep-alive ping");
                    self.transmit(&Packet::Pingreq, now, out);
                    self.ping_sent_ms = Some(now);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
        }
    }

    /// The link is gone. Every pending operation fails, and the session
    /// returns to `Disconnected`.
    pub fn connection_lost(&mut self, cause: Error, out: &mut impl Outbox<H>) {
        let previous = self.state;
        if previous == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.ping_sent_ms = None;
        log::warn!("connection lost: {}", cause);

        self.fail_pending(Error::ConnectionLost(cause.as_network()), out);
        if let Some(handler) = self.connect_handler.take() {
            out.notify(Some(handler), Event::Failure(cause));
        }
        match previous {
            ConnectionState::Connected => out.notify(None, Event::Failure(cause)),
            ConnectionState::Disconnecting => {
                out.notify(self.disconnect_handler.take(), Event::Success(Info::Disconnected))
            }
            _ => {}
        }
        self.prune_subscriptions();
        if self.options.clean_session {
            self.incoming.clear();
        }
    }

    fn on_connack(&mut self, connack: Connack, out: &mut impl Outbox<H>) {
        let handler = self.connect_handler.take();
        if connack.code != ConnectReturnCode::Accepted {
            log::warn!("connection refused: {}", connack.code);
            self.state = ConnectionState::Disconnected;
            out.notify(handler, Event::Failure(Error::ConnectionRefused(connack.code)));
            self.prune_subscriptions();
            return;
        }

        log::info!("connected (session present: {})", connack.session_present);
        self.state = ConnectionState::Connected;
        out.notify(
            handler.clone(),
            Event::Success(Info::Connected {
                session_present: connack.session_present,
            }),
        );
        out.notify(handler, Event::Connected);
    }

    fn on_packet(&mut self, packet: Packet, now: u64, out: &mut impl Outbox<H>) -> Result<(), Violation> {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish, now, out),
            Packet::Pubrel(id) => {
                if !self.incoming.remove(&id) {
                    log::debug!("PUBREL for id {} not awaiting release", id);
                }
                self.transmit(&Packet::Pubcomp(id), now, out);
                Ok(())
            }
            Packet::Puback(id) => self.on_publish_ack(PacketType::Puback, id, now, out),
            Packet::Pubrec(id) => self.on_publish_ack(PacketType::Pubrec, id, now, out),
            Packet::Pubcomp(id) => self.on_publish_ack(PacketType::Pubcomp, id, now, out),
            Packet::Suback(suback) => self.on_suback(suback, out),
            Packet::Unsuback(id) => self.on_unsuback(id, out),
            Packet::Pingresp => {
                self.ping_sent_ms = None;
                Ok(())
            }
            other => Err(Violation::UnexpectedPacket(other.packet_type())),
        }
    }

    fn on_publish(&mut self, publish: Publish, now: u64, out: &mut impl Outbox<H>) -> Result<(), Violation> {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => self.deliver(&publish, out),
            (QoS::AtLeastOnce, Some(id)) => {
                self.deliver(&publish, out);
                self.transmit(&Packet::Puback(id), now, out);
            }
            (QoS::ExactlyOnce, Some(id)) => {
                if self.incoming.contains(&id) {
                    log::debug!("duplicate QoS 2 PUBLISH id {}", id);
                } else {
                    self.incoming
                        .insert(id)
                        .map_err(|_| Violation::InboundWindowFull)?;
                    self.deliver(&publish, out);
                }
                self.transmit(&Packet::Pubrec(id), now, out);
            }
            // The codec never yields QoS 1/2 without an identifier
            (_, None) => return Err(Violation::UnexpectedPacket(PacketType::Publish)),
        }
        Ok(())
    }

    fn deliver(&self, publish: &Publish, out: &mut impl Outbox<H>) {
        let message = Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        };

        let mut matched = false;
        let mut global_notified = false;
        for sub in self.subscriptions.iter() {
            if !topic::matches(&sub.filter, &publish.topic) {
                continue;
            }
            matched = true;
            match &sub.handler {
                Some(handler) => out.notify(Some(handler.clone()), Event::Message(message.clone())),
                None if !global_notified => {
                    global_notified = true;
                    out.notify(None, Event::Message(message.clone()));
                }
                None => {}
            }
        }
        if !matched {
            out.notify(None, Event::Message(message));
        }
    }

    fn on_publish_ack(
        &mut self,
        ack: PacketType,
        id: u16,
        now: u64,
        out: &mut impl Outbox<H>,
    ) -> Result<(), Violation> {
        let unknown = Violation::UnknownPacketId(ack, id);
        let Some(entry) = self.outgoing.get_mut(&id) else {
            return self.unmatched_ack(ack, id);
        };
        let Pending::Publish { publish, stage } = &mut entry.pending else {
            return Err(unknown);
        };

        match (ack, publish.qos, *stage) {
            (PacketType::Puback, QoS::AtLeastOnce, Stage::Sent)
            | (PacketType::Pubcomp, QoS::ExactlyOnce, Stage::Released) => {
                self.complete_publish(id, out);
                Ok(())
            }
            (PacketType::Pubrec, QoS::ExactlyOnce, Stage::Sent) => {
                *stage = Stage::Released;
                entry.retries = 0;
                entry.last_sent_ms = now;
                self.transmit(&Packet::Pubrel(id), now, out);
                Ok(())
            }
            (PacketType::Pubrec, QoS::ExactlyOnce, Stage::Released) => {
                log::debug!("duplicate PUBREC for id {}", id);
                Ok(())
            }
            _ => Err(unknown),
        }
    }

    fn complete_publish(&mut self, id: u16, out: &mut impl Outbox<H>) {
        if let Some(entry) = self.outgoing.remove(&id) {
            self.retire(id, &entry);
            if let Pending::Publish { publish, .. } = entry.pending {
                log::debug!("delivery of id {} complete", id);
                out.notify(
                    entry.handler,
                    Event::Success(Info::Published {
                        topic: publish.topic,
                        qos: publish.qos,
                    }),
                );
            }
        }
    }

    fn on_suback(&mut self, suback: Suback, out: &mut impl Outbox<H>) -> Result<(), Violation> {
        let id = suback.packet_id;
        if !matches!(
            self.outgoing.get(&id).map(|e| &e.pending),
            Some(Pending::Subscribe { .. })
        ) {
            return self.unmatched_ack(PacketType::Suback, id);
        }
        let Some(entry) = self.outgoing.remove(&id) else {
            return Err(Violation::UnknownPacketId(PacketType::Suback, id));
        };
        self.retire(id, &entry);
        let Outgoing {
            pending: Pending::Subscribe { filter, .. },
            handler,
            ..
        } = entry
        else {
            return Err(Violation::UnknownPacketId(PacketType::Suback, id));
        };

        let position = self
            .subscriptions
            .iter()
            .position(|s| s.filter == filter && s.state == SubscriptionState::Pending);
        match suback.return_codes.first() {
            Some(SubscribeReturnCode::Success(granted)) => {
                if let Some(index) = position {
                    let sub = &mut self.subscriptions[index];
                    sub.state = SubscriptionState::Active;
                    sub.qos = *granted;
                    sub.replaced = None;
                }
                log::info!("subscribed to '{}' at QoS {}", filter, *granted as u8);
                out.notify(
                    handler,
                    Event::Success(Info::Subscribed {
                        topic: filter,
                        qos: *granted,
                    }),
                );
            }
            _ => {
                if let Some(index) = position {
                    self.revert_subscription(index);
                }
                log::warn!("subscription to '{}' rejected", filter);
                out.notify(handler, Event::Failure(Error::SubscriptionRejected));
            }
        }
        Ok(())
    }

    fn on_unsuback(&mut self, id: u16, out: &mut impl Outbox<H>) -> Result<(), Violation> {
        if !matches!(
            self.outgoing.get(&id).map(|e| &e.pending),
            Some(Pending::Unsubscribe { .. })
        ) {
            return self.unmatched_ack(PacketType::Unsuback, id);
        }
        let Some(entry) = self.outgoing.remove(&id) else {
            return Err(Violation::UnknownPacketId(PacketType::Unsuback, id));
        };
        self.retire(id, &entry);
        let Outgoing {
            pending: Pending::Unsubscribe { filter },
            handler,
            ..
        } = entry
        else {
            return Err(Violation::UnknownPacketId(PacketType::Unsuback, id));
        };

        self.subscriptions
            .retain(|s| !(s.filter == filter && s.state == SubscriptionState::Removing));
        log::info!("unsubscribed from '{}'", filter);
        out.notify(handler, Event::Success(Info::Unsubscribed { topic: filter }));
        Ok(())
    }

    fn retransmit(&mut self, now: u64, out: &mut impl Outbox<H>) {
        let interval = u64::from(self.options.retry_interval_ms);
        let due: Vec<u16, MAX_INFLIGHT> = self
            .outgoing
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.last_sent_ms) >= interval)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let exhausted = match self.outgoing.get(&id) {
                Some(entry) => entry.retries >= self.options.max_retries,
                None => continue,
            };
            if exhausted {
                self.expire(id, out);
                continue;
            }

            let Some(entry) = self.outgoing.get_mut(&id) else {
                continue;
            };
            entry.retries += 1;
            entry.resent = true;
            entry.last_sent_ms = now;
            log::debug!("retransmitting id {} (attempt {})", id, entry.retries);
            let packet = match &mut entry.pending {
                Pending::Publish {
                    publish,
                    stage: Stage::Sent,
                } => {
                    publish.dup = true;
                    Packet::Publish(publish.clone())
                }
                Pending::Publish {
                    stage: Stage::Released,
                    ..
                } => Packet::Pubrel(id),
                Pending::Subscribe { filter, qos } => subscribe_packet(id, filter, *qos),
                Pending::Unsubscribe { filter } => unsubscribe_packet(id, filter),
            };
            self.transmit(&packet, now, out);
        }
    }

    /// Give up on `id` after too many retransmissions.
    fn expire(&mut self, id: u16, out: &mut impl Outbox<H>) {
        let Some(entry) = self.outgoing.remove(&id) else {
            return;
        };
        log::warn!("id {} not acknowledged after {} retries", id, entry.retries);
        self.retire(id, &entry);
        match &entry.pending {
            Pending::Subscribe { filter, .. } => {
                if let Some(index) = self
                    .subscriptions
                    .iter()
                    .position(|s| s.filter == *filter && s.state == SubscriptionState::Pending)
                {
                    self.revert_subscription(index);
                }
            }
            Pending::Unsubscribe { filter } => {
                if let Some(sub) = self
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.filter == *filter && s.state == SubscriptionState::Removing)
                {
                    sub.state = SubscriptionState::Active;
                }
            }
            Pending::Publish { .. } => {}
        }
        out.notify(entry.handler, Event::Failure(Error::Timeout));
    }

    /// Fail every outbound operation with `error`, in the order they were issued.
    fn fail_pending(&mut self, error: Error, out: &mut impl Outbox<H>) {
        let mut ids: Vec<(u32, u16), MAX_INFLIGHT> = self
            .outgoing
            .iter()
            .map(|(id, entry)| (entry.sequence, *id))
            .collect();
        ids.sort_unstable();
        for (_, id) in ids {
            if let Some(entry) = self.outgoing.remove(&id) {
                out.notify(entry.handler, Event::Failure(error));
            }
        }
    }

    /// Drop subscriptions that do not survive the end of a connection.
    fn prune_subscriptions(&mut self) {
        if self.options.clean_session {
            self.subscriptions.clear();
        } else {
            // The broker still holds what a pending re-subscribe replaced
            for sub in self.subscriptions.iter_mut() {
                if sub.state == SubscriptionState::Pending {
                    if let Some(replaced) = sub.replaced.take() {
                        sub.state = SubscriptionState::Active;
                        sub.qos = replaced.qos;
                        sub.handler = replaced.handler;
                    }
                }
            }
            self.subscriptions
                .retain(|s| s.state == SubscriptionState::Active);
        }
    }

    /// A subscribe was rejected or timed out: restore what it replaced, or
    /// forget the filter.
    fn revert_subscription(&mut self, index: usize) {
        let sub = &mut self.subscriptions[index];
        match sub.replaced.take() {
            Some(replaced) => {
                log::debug!("keeping previous subscription to '{}'", sub.filter);
                sub.state = SubscriptionState::Active;
                sub.qos = replaced.qos;
                sub.handler = replaced.handler;
            }
            None => {
                self.subscriptions.swap_remove(index);
            }
        }
    }

    /// Remember a retransmitted operation that is finished, so late
    /// acknowledgements of its duplicates are not mistaken for violations.
    fn retire(&mut self, id: u16, entry: &Outgoing<H>) {
        if !entry.resent {
            return;
        }
        if self.retired.len() == RETIRED_IDS {
            if let Some(&oldest) = self.retired.iter().next() {
                self.retired.remove(&oldest);
            }
        }
        let _ = self.retired.insert(id);
    }

    /// Handle an acknowledgement that matches no in-flight operation.
    fn unmatched_ack(&self, ack: PacketType, id: u16) -> Result<(), Violation> {
        if self.retired.contains(&id) {
            log::debug!("late {} for retransmitted id {}", ack.name(), id);
            return Ok(());
        }
        Err(Violation::UnknownPacketId(ack, id))
    }

    fn require_connected(&self) -> Result<(), Precondition> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(Precondition::NotConnected),
        }
    }

    fn allocate_packet_id(&mut self) -> Result<u16, Precondition> {
        if self.outgoing.len() >= MAX_INFLIGHT {
            return Err(Precondition::InflightFull);
        }
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = match self.next_packet_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.outgoing.contains_key(&id) {
                self.retired.remove(&id);
                return Ok(id);
            }
        }
    }

    fn track(&mut self, id: u16, pending: Pending, handler: Option<H>, now: u64) -> Result<(), Precondition> {
        let entry = Outgoing {
            pending,
            handler,
            sequence: self.next_sequence,
            retries: 0,
            resent: false,
            last_sent_ms: now,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.outgoing
            .insert(id, entry)
            .map(|_| ())
            .map_err(|_| Precondition::InflightFull)
    }

    fn transmit(&mut self, packet: &Packet, now: u64, out: &mut impl Outbox<H>) {
        self.last_sent_ms = now;
        out.transmit(packet);
    }
}

fn topic_precondition(error: TopicError) -> Precondition {
    match error {
        TopicError::Empty => Precondition::EmptyTopic,
        _ => Precondition::InvalidTopic,
    }
}

fn topic_string(topic: &str) -> String<MAX_TOPIC_LEN> {
    // Callers validated the length already
    String::try_from(topic).unwrap_or_default()
}

fn subscribe_packet(packet_id: u16, filter: &String<MAX_TOPIC_LEN>, qos: QoS) -> Packet {
    let mut filters = Vec::new();
    let _ = filters.push(SubscribeFilter {
        filter: filter.clone(),
        qos,
    });
    Packet::Subscribe(Subscribe { packet_id, filters })
}

fn unsubscribe_packet(packet_id: u16, filter: &String<MAX_TOPIC_LEN>) -> Packet {
    let mut filters = Vec::new();
    let _ = filters.push(filter.clone());
    Packet::Unsubscribe(Unsubscribe { packet_id, filters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network;
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct Recorder {
        sent: StdVec<Packet>,
        events: StdVec<(Option<u32>, Event)>,
    }

    impl Outbox<u32> for Recorder {
        fn transmit(&mut self, packet: &Packet) {
            self.sent.push(packet.clone());
        }

        fn notify(&mut self, handler: Option<u32>, event: Event) {
            self.events.push((handler, event));
        }
    }

    impl Recorder {
        fn take(&mut self) -> (StdVec<Packet>, StdVec<(Option<u32>, Event)>) {
            (core::mem::take(&mut self.sent), core::mem::take(&mut self.events))
        }
    }

    fn options() -> Options {
        Options {
            keep_alive_secs: 10,
            retry_interval_ms: 1_000,
            max_retries: 2,
            ping_timeout_ms: 500,
            connect_timeout_ms: 2_000,
            ..Options::default()
        }
    }

    fn connected(options: Options) -> (Session<u32>, Recorder) {
        let mut session = Session::new("tester", options).unwrap();
        let mut out = Recorder::default();
        session
            .connect(&Credentials::anonymous(), Some(1), 0, &mut out)
            .unwrap();
        session.handle_packet(
            Packet::Connack(Connack {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }),
            0,
            &mut out,
        );
        out.take();
        (session, out)
    }

    fn suback(packet_id: u16, code: SubscribeReturnCode) -> Packet {
        let mut return_codes = Vec::new();
        return_codes.push(code).unwrap();
        Packet::Suback(Suback {
            packet_id,
            return_codes,
        })
    }

    fn publish_in(topic: &str, qos: QoS, packet_id: Option<u16>) -> Packet {
        Packet::Publish(Publish::new(topic, b"data", qos, packet_id).unwrap())
    }

    #[test]
    fn test_connect_handshake() {
        let mut session: Session<u32> = Session::new("tester", options()).unwrap();
        let mut out = Recorder::default();
        let creds = Credentials::new("user", "pass").unwrap();
        session.connect(&creds, Some(7), 0, &mut out).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);

        let (sent, events) = out.take();
        assert!(events.is_empty());
        match &sent[..] {
            [Packet::Connect(c)] => {
                assert_eq!(c.client_id.as_str(), "tester");
                assert_eq!(c.keep_alive, 10);
                assert_eq!(c.username.as_deref(), Some("user"));
                assert_eq!(c.password.as_deref(), Some(&b"pass"[..]));
            }
            other => panic!("unexpected packets {:?}", other),
        }

        session.handle_packet(
            Packet::Connack(Connack {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }),
            5,
            &mut out,
        );
        assert_eq!(session.state(), ConnectionState::Connected);
        let (_, events) = out.take();
        assert_eq!(
            events,
            [
                (Some(7), Event::Success(Info::Connected { session_present: false })),
                (Some(7), Event::Connected),
            ]
        );

        assert_eq!(
            session.connect(&creds, Some(8), 6, &mut out),
            Err(Error::Precondition(Precondition::AlreadyConnected))
        );
        assert!(out.sent.is_empty());
    }

    #[test]
    fn test_connect_refused() {
        let mut session: Session<u32> = Session::new("tester", options()).unwrap();
        let mut out = Recorder::default();
        session
            .connect(&Credentials::anonymous(), Some(1), 0, &mut out)
            .unwrap();
        session.handle_packet(
            Packet::Connack(Connack {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            }),
            1,
            &mut out,
        );
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let (_, events) = out.take();
        assert_eq!(
            events,
            [(
                Some(1),
                Event::Failure(Error::ConnectionRefused(ConnectReturnCode::NotAuthorized))
            )]
        );
    }

    #[test]
    fn test_connect_timeout() {
        let mut session: Session<u32> = Session::new("tester", options()).unwrap();
        let mut out = Recorder::default();
        session
            .connect(&Credentials::anonymous(), Some(1), 0, &mut out)
            .unwrap();
        session.tick(1_999, &mut out);
        assert_eq!(session.state(), ConnectionState::Connecting);
        session.tick(2_000, &mut out);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(out.events.last(), Some(&(Some(1), Event::Failure(Error::Timeout))));
    }

    #[test]
    fn test_preconditions_emit_nothing() {
        let mut session: Session<u32> = Session::new("tester", options()).unwrap();
        let mut out = Recorder::default();
        assert_eq!(
            session.publish("a/b", b"x", QoS::AtMostOnce, false, Some(1), 0, &mut out),
            Err(Error::Precondition(Precondition::NotConnected))
        );

        let (mut session, mut out) = connected(options());
        assert_eq!(
            session.subscribe("", QoS::AtMostOnce, Some(1), 0, &mut out),
            Err(Error::Precondition(Precondition::EmptyTopic))
        );
        assert_eq!(
            session.subscribe("a/#/b", QoS::AtMostOnce, Some(1), 0, &mut out),
            Err(Error::Precondition(Precondition::InvalidTopic))
        );
        assert_eq!(
            session.publish("a/+", b"x", QoS::AtMostOnce, false, Some(1), 0, &mut out),
            Err(Error::Precondition(Precondition::InvalidTopic))
        );
        assert_eq!(
            session.publish("a", b"", QoS::AtMostOnce, false, Some(1), 0, &mut out),
            Err(Error::Precondition(Precondition::EmptyPayload))
        );
        assert!(out.sent.is_empty());
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_qos0_publish_completes_immediately() {
        let (mut session, mut out) = connected(options());
        let id = session
            .publish("a/b", b"hello", QoS::AtMostOnce, false, Some(3), 10, &mut out)
            .unwrap();
        assert_eq!(id, None);
        let (sent, events) = out.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&events[..], [(Some(3), Event::Success(Info::Published { qos: QoS::AtMostOnce, .. }))]));
        assert_eq!(session.inflight(), 0);
    }

    #[test]
    fn test_qos1_publish() {
        let (mut session, mut out) = connected(options());
        let id = session
            .publish("a/b", b"hello", QoS::AtLeastOnce, false, Some(3), 10, &mut out)
            .unwrap()
            .unwrap();
        assert_eq!(session.inflight(), 1);
        out.take();

        session.handle_packet(Packet::Puback(id), 20, &mut out);
        let (sent, events) = out.take();
        assert!(sent.is_empty());
        assert!(matches!(&events[..], [(Some(3), Event::Success(Info::Published { qos: QoS::AtLeastOnce, .. }))]));
        assert_eq!(session.inflight(), 0);
    }

    #[test]
    fn test_qos2_publish_with_duplicate_pubrec() {
        let (mut session, mut out) = connected(options());
        let id = session
            .publish("a/b", b"hello", QoS::ExactlyOnce, false, Some(3), 10, &mut out)
            .unwrap()
            .unwrap();
        out.take();

        session.handle_packet(Packet::Pubrec(id), 20, &mut out);
        session.handle_packet(Packet::Pubrec(id), 21, &mut out);
        let (sent, events) = out.take();
        assert_eq!(sent, [Packet::Pubrel(id)]);
        assert!(events.is_empty());
        assert_eq!(session.state(), ConnectionState::Connected);

        session.handle_packet(Packet::Pubcomp(id), 30, &mut out);
        let (_, events) = out.take();
        assert_eq!(events.len(), 1);
        assert_eq!(session.inflight(), 0);
    }

    #[test]
    fn test_unknown_ack_is_a_violation() {
        let (mut session, mut out) = connected(options());
        session.handle_packet(Packet::Puback(42), 0, &mut out);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let (_, events) = out.take();
        assert_eq!(
            events,
            [(
                None,
                Event::Failure(Error::ProtocolViolation(Violation::UnknownPacketId(PacketType::Puback, 42)))
            )]
        );
    }

    #[test]
    fn test_subscribe_and_route_messages() {
        let (mut session, mut out) = connected(options());
        let id = session
            .subscribe("sensors/+", QoS::AtLeastOnce, Some(5), 0, &mut out)
            .unwrap();
        assert_eq!(session.subscription("sensors/+"), Some(SubscriptionState::Pending));
        session.handle_packet(suback(id, SubscribeReturnCode::Success(QoS::AtLeastOnce)), 1, &mut out);
        assert_eq!(session.subscription("sensors/+"), Some(SubscriptionState::Active));
        out.take();

        session.handle_packet(publish_in("sensors/a", QoS::AtLeastOnce, Some(9)), 2, &mut out);
        session.handle_packet(publish_in("other", QoS::AtMostOnce, None), 3, &mut out);
        let (sent, events) = out.take();
        assert_eq!(sent, [Packet::Puback(9)]);
        assert!(matches!(&events[0], (Some(5), Event::Message(m)) if m.topic == "sensors/a"));
        assert!(matches!(&events[1], (None, Event::Message(m)) if m.topic == "other"));
    }

    #[test]
    fn test_rejected_subscription() {
        let (mut session, mut out) = connected(options());
        let id = session
            .subscribe("secret/#", QoS::AtMostOnce, Some(5), 0, &mut out)
            .unwrap();
        session.handle_packet(suback(id, SubscribeReturnCode::Failure), 1, &mut out);
        let (_, events) = out.take();
        assert_eq!(events.last(), Some(&(Some(5), Event::Failure(Error::SubscriptionRejected))));
        assert_eq!(session.subscription("secret/#"), None);
    }

    #[test]
    fn test_unsubscribe() {
        let (mut session, mut out) = connected(options());
        let id = session.subscribe("a", QoS::AtMostOnce, Some(5), 0, &mut out).unwrap();
        session.handle_packet(suback(id, SubscribeReturnCode::Success(QoS::AtMostOnce)), 1, &mut out);
        let id = session.unsubscribe("a", None, 2, &mut out).unwrap();
        assert_eq!(session.subscription("a"), Some(SubscriptionState::Removing));
        out.take();

        session.handle_packet(Packet::Unsuback(id), 3, &mut out);
        let (_, events) = out.take();
        assert!(matches!(&events[..], [(None, Event::Success(Info::Unsubscribed { .. }))]));
        assert_eq!(session.subscription("a"), None);
    }

    #[test]
    fn test_inbound_qos2_dedupe() {
        let (mut session, mut out) = connected(options());
        session.handle_packet(publish_in("t", QoS::ExactlyOnce, Some(4)), 0, &mut out);
        session.handle_packet(publish_in("t", QoS::ExactlyOnce, Some(4)), 1, &mut out);
        let (sent, events) = out.take();
        assert_eq!(sent, [Packet::Pubrec(4), Packet::Pubrec(4)]);
        assert_eq!(events.len(), 1);
        assert_eq!(session.inbound_pending(), 1);

        session.handle_packet(Packet::Pubrel(4), 2, &mut out);
        assert_eq!(out.sent, [Packet::Pubcomp(4)]);
        assert_eq!(session.inbound_pending(), 0);
    }

    #[test]
    fn test_retransmission_and_expiry() {
        let (mut session, mut out) = connected(Options {
            keep_alive_secs: 0,
            ..options()
        });
        let id = session
            .publish("t", b"x", QoS::AtLeastOnce, false, Some(2), 0, &mut out)
            .unwrap()
            .unwrap();
        out.take();

        session.tick(999, &mut out);
        assert!(out.sent.is_empty());

        session.tick(1_000, &mut out);
        match &out.sent[..] {
            [Packet::Publish(p)] => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("unexpected packets {:?}", other),
        }
        session.tick(2_000, &mut out);
        assert_eq!(out.sent.len(), 2);

        // max_retries reached
        session.tick(3_000, &mut out);
        let (sent, events) = out.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(events, [(Some(2), Event::Failure(Error::Timeout))]);
        assert_eq!(session.inflight(), 0);
    }

    #[test]
    fn test_late_acks_after_retransmission_are_ignored() {
        let (mut session, mut out) = connected(options());
        let id = session
            .publish("t", b"x", QoS::AtLeastOnce, false, Some(5), 0, &mut out)
            .unwrap()
            .unwrap();
        let sub_id = session.subscribe("s", QoS::AtMostOnce, Some(6), 0, &mut out).unwrap();
        session.tick(1_000, &mut out);
        assert_eq!(out.sent.iter().filter(|p| matches!(p, Packet::Publish(p) if p.dup)).count(), 1);
        out.take();

        // The broker answers the original and the duplicate
        session.handle_packet(Packet::Puback(id), 1_001, &mut out);
        session.handle_packet(Packet::Puback(id), 1_002, &mut out);
        let granted = SubscribeReturnCode::Success(QoS::AtMostOnce);
        session.handle_packet(suback(sub_id, granted), 1_003, &mut out);
        session.handle_packet(suback(sub_id, granted), 1_004, &mut out);

        assert_eq!(session.state(), ConnectionState::Connected);
        let (_, events) = out.take();
        assert!(matches!(
            &events[..],
            [
                (Some(5), Event::Success(Info::Published { .. })),
                (Some(6), Event::Success(Info::Subscribed { .. })),
            ]
        ));
    }

    #[test]
    fn test_late_pubcomp_after_pubrel_retransmission_is_ignored() {
        let (mut session, mut out) = connected(options());
        let id = session
            .publish("t", b"x", QoS::ExactlyOnce, false, Some(5), 0, &mut out)
            .unwrap()
            .unwrap();
        session.handle_packet(Packet::Pubrec(id), 1, &mut out);
        session.tick(1_001, &mut out);
        assert_eq!(out.sent.last(), Some(&Packet::Pubrel(id)));
        out.take();

        session.handle_packet(Packet::Pubcomp(id), 1_002, &mut out);
        session.handle_packet(Packet::Pubcomp(id), 1_003, &mut out);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn test_rejected_resubscribe_keeps_previous_subscription() {
        let (mut session, mut out) = connected(options());
        let id = session.subscribe("a", QoS::AtLeastOnce, Some(5), 0, &mut out).unwrap();
        session.handle_packet(suback(id, SubscribeReturnCode::Success(QoS::AtLeastOnce)), 1, &mut out);

        let id = session.subscribe("a", QoS::ExactlyOnce, Some(6), 2, &mut out).unwrap();
        assert_eq!(session.subscription("a"), Some(SubscriptionState::Pending));
        session.handle_packet(suback(id, SubscribeReturnCode::Failure), 3, &mut out);
        assert_eq!(session.subscription("a"), Some(SubscriptionState::Active));
        out.take();

        session.handle_packet(publish_in("a", QoS::AtMostOnce, None), 4, &mut out);
        let (_, events) = out.take();
        assert!(matches!(&events[..], [(Some(5), Event::Message(_))]));
    }

    #[test]
    fn test_expired_resubscribe_keeps_previous_subscription() {
        let (mut session, mut out) = connected(Options {
            keep_alive_secs: 0,
            ..options()
        });
        let id = session.subscribe("a", QoS::AtLeastOnce, Some(5), 0, &mut out).unwrap();
        session.handle_packet(suback(id, SubscribeReturnCode::Success(QoS::AtLeastOnce)), 0, &mut out);
        session.subscribe("a", QoS::AtMostOnce, Some(6), 0, &mut out).unwrap();

        for now in [1_000, 2_000, 3_000, 4_000] {
            session.tick(now, &mut out);
        }
        assert_eq!(session.inflight(), 0);
        assert_eq!(session.subscription("a"), Some(SubscriptionState::Active));
        assert_eq!(out.events.last(), Some(&(Some(6), Event::Failure(Error::Timeout))));
        out.take();

        session.handle_packet(publish_in("a", QoS::AtMostOnce, None), 5_000, &mut out);
        let (_, events) = out.take();
        assert!(matches!(&events[..], [(Some(5), Event::Message(_))]));
    }

    #[test]
    fn test_keep_alive_and_ping_timeout() {
        let (mut session, mut out) = connected(options());
        session.tick(9_999, &mut out);
        assert!(out.sent.is_empty());
        session.tick(10_000, &mut out);
        assert_eq!(out.sent, [Packet::Pingreq]);

        session.handle_packet(Packet::Pingresp, 10_100, &mut out);
        session.tick(20_000, &mut out);
        assert_eq!(out.sent, [Packet::Pingreq, Packet::Pingreq]);

        session.tick(20_500, &mut out);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            out.events.last(),
            Some(&(None, Event::Failure(Error::ConnectionLost(network::Error::Timeout))))
        );
    }

    #[test]
    fn test_connection_lost_fails_every_pending_operation() {
        let (mut session, mut out) = connected(options());
        for handler in 10..13 {
            session
                .publish("t", b"x", QoS::AtLeastOnce, false, Some(handler), 0, &mut out)
                .unwrap();
        }
        session.subscribe("s", QoS::AtMostOnce, Some(13), 0, &mut out).unwrap();
        out.take();

        let cause = Error::ConnectionLost(network::Error::ConnectionClosed);
        session.connection_lost(cause, &mut out);
        let (sent, events) = out.take();
        assert!(sent.is_empty());
        let failed: StdVec<_> = events.iter().filter_map(|(h, _)| *h).collect();
        assert_eq!(failed, [10, 11, 12, 13]);
        assert_eq!(events.last(), Some(&(None, Event::Failure(cause))));
        assert_eq!(session.inflight(), 0);
        assert_eq!(session.subscription("s"), None);
    }

    #[test]
    fn test_connection_lost_fails_in_issue_order() {
        let (mut session, mut out) = connected(options());
        let mut ids = StdVec::new();
        for handler in 10..14 {
            let id = session
                .publish("t", b"x", QoS::AtLeastOnce, false, Some(handler), 0, &mut out)
                .unwrap()
                .unwrap();
            ids.push(id);
        }
        session.handle_packet(Packet::Puback(ids[0]), 1, &mut out);
        out.take();

        session.connection_lost(Error::ConnectionLost(network::Error::ConnectionClosed), &mut out);
        let (_, events) = out.take();
        let failed: StdVec<_> = events.iter().filter_map(|(h, _)| *h).collect();
        assert_eq!(failed, [11, 12, 13]);
    }

    #[test]
    fn test_disconnect_cancels_pending() {
        let (mut session, mut out) = connected(options());
        session
            .publish("t", b"x", QoS::ExactlyOnce, false, Some(4), 0, &mut out)
            .unwrap();
        out.take();

        session.disconnect(Some(9), 1, &mut out).unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnecting);
        let (sent, events) = out.take();
        assert_eq!(sent, [Packet::Disconnect]);
        assert_eq!(events, [(Some(4), Event::Failure(Error::Cancelled))]);

        // Traffic after DISCONNECT is ignored
        session.handle_packet(Packet::Pubrec(1), 2, &mut out);
        assert!(out.events.is_empty());

        session.disconnected(&mut out);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(out.events, [(Some(9), Event::Success(Info::Disconnected))]);
        assert_eq!(
            session.disconnect(None, 3, &mut out),
            Err(Error::Precondition(Precondition::NotConnected))
        );
    }

    #[test]
    fn test_disconnect_while_connecting() {
        let mut session: Session<u32> = Session::new("tester", options()).unwrap();
        let mut out = Recorder::default();
        session
            .connect(&Credentials::anonymous(), Some(1), 0, &mut out)
            .unwrap();
        out.take();
        session.disconnect(Some(2), 1, &mut out).unwrap();
        let (sent, events) = out.take();
        assert!(sent.is_empty());
        assert_eq!(events, [(Some(1), Event::Failure(Error::Cancelled))]);
    }

    #[test]
    fn test_packet_ids_skip_inflight() {
        let (mut session, mut out) = connected(Options {
            keep_alive_secs: 0,
            ..options()
        });
        session.next_packet_id = u16::MAX;
        let first = session
            .publish("t", b"x", QoS::AtLeastOnce, false, None, 0, &mut out)
            .unwrap();
        let second = session
            .publish("t", b"x", QoS::AtLeastOnce, false, None, 0, &mut out)
            .unwrap();
        assert_eq!(first, Some(u16::MAX));
        assert_eq!(second, Some(1));

        session.next_packet_id = u16::MAX;
        let third = session
            .publish("t", b"x", QoS::AtLeastOnce, false, None, 0, &mut out)
            .unwrap();
        assert_eq!(third, Some(2));
    }

    #[test]
    fn test_inflight_limit() {
        let (mut session, mut out) = connected(options());
        for _ in 0..MAX_INFLIGHT {
            session
                .publish("t", b"x", QoS::AtLeastOnce, false, None, 0, &mut out)
                .unwrap();
        }
        assert_eq!(
            session.publish("t", b"x", QoS::AtLeastOnce, false, None, 0, &mut out),
            Err(Error::Precondition(Precondition::InflightFull))
        );
    }

    #[test]
    fn test_persistent_session_keeps_active_subscriptions() {
        let (mut session, mut out) = connected(Options {
            clean_session: false,
            ..options()
        });
        let id = session.subscribe("kept", QoS::AtMostOnce, Some(1), 0, &mut out).unwrap();
        session.handle_packet(suback(id, SubscribeReturnCode::Success(QoS::AtMostOnce)), 0, &mut out);
        session.subscribe("dropped", QoS::AtMostOnce, Some(2), 0, &mut out).unwrap();

        session.connection_lost(Error::ConnectionLost(network::Error::ConnectionClosed), &mut out);
        assert_eq!(session.subscription("kept"), Some(SubscriptionState::Active));
        assert_eq!(session.subscription("dropped"), None);
    }
}
