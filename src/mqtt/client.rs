//! Thread-backed MQTT client.
//!
//! [`Client`] wraps a [`Session`] and a [`Transport`]. Operation calls run on
//! the caller's thread: they lock the session, let it emit packets, write
//! them, and return without waiting for the broker. Acknowledgements are
//! read by one reader thread per connection, which also runs the session's
//! timers each time a read times out.
//!
//! Outcomes are delivered as [`Event`]s to the handler passed with each
//! operation, or to the handler registered with
//! [`Client::set_event_handler`] when an operation has none. Handlers run
//! after the client's lock is released, so they may call back into the
//! client.
//!
//! The client keeps its handlers, so a handler that owns a [`Client`] clone
//! keeps the client alive: it is never dropped, and never sends DISCONNECT.
//! Handlers that call back into the client should hold a [`WeakClient`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use libmqtt::mqtt::{client, Client, Credentials, Event, Options, QoS};
//!
//! let client = Client::tcp("tcp://broker.local:1883", None, Options::default()).unwrap();
//!
//! client.set_event_handler(client::handler(|event| println!("{:?}", event)));
//!
//! let weak = client.downgrade();
//! client.connect(
//!     &Credentials::anonymous(),
//!     client::handler(move |event| {
//!         if let (Event::Connected, Some(subscriber)) = (&event, weak.upgrade()) {
//!             subscriber.subscribe(
//!                 "sensors/+/temperature",
//!                 QoS::AtLeastOnce,
//!                 client::handler(|event| {
//!                     if let Event::Message(message) = event {
//!                         println!("{}: {:?}", message.topic, message.payload_str());
//!                     }
//!                 }),
//!             );
//!         }
//!     }),
//! );
//! ```

use super::error::{Error, Precondition};
use super::event::Event;
use super::options::{Credentials, Options};
use super::packet::{decode, publish_frame_len, CodecError, Packet, QoS};
use super::session::{ConnectionState, Outbox, Session};
use super::MAX_PACKET_LEN;
use crate::network::tcp::TcpConnector;
use crate::network::{self, Close, Read, ServerUri, Transport, Write};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Prefix of generated client identifiers.
pub const CLIENT_ID_PREFIX: &str = "libmqtt";

/// Number of random characters appended to [`CLIENT_ID_PREFIX`].
pub const CLIENT_ID_RANDOM_LEN: usize = 16;

const READ_CHUNK: usize = 1024;

/// Receives events from the client.
pub trait EventHandler: Send + Sync {
    /// Called once per event, never while the client's lock is held.
    fn on_event(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

/// Shared handler reference passed to client operations.
pub type Handler = Arc<dyn EventHandler>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Generate a client identifier: [`CLIENT_ID_PREFIX`] followed by
/// [`CLIENT_ID_RANDOM_LEN`] alphanumerics, 23 characters in total.
pub fn generate_client_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    let mut id = String::with_capacity(CLIENT_ID_PREFIX.len() + CLIENT_ID_RANDOM_LEN);
    id.push_str(CLIENT_ID_PREFIX);
    id.push_str(&suffix);
    id
}

/// MQTT client handle. Cheap to clone; all clones share one connection.
pub struct Client<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle to a [`Client`], for use inside handlers.
pub struct WeakClient<T: Transport> {
    inner: Weak<Inner<T>>,
}

impl<T: Transport> WeakClient<T> {
    /// The client, unless every [`Client`] handle has been dropped.
    pub fn upgrade(&self) -> Option<Client<T>> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl<T: Transport> Clone for WeakClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Transport> core::fmt::Debug for WeakClient<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<T: Transport> core::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("server_uri", &self.inner.server_uri)
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish()
    }
}

struct Inner<T: Transport> {
    server_uri: String,
    client_id: String,
    epoch: Instant,
    transport: Mutex<T>,
    shared: Mutex<Shared<T::Writer>>,
}

struct Shared<W> {
    session: Session<Handler>,
    writer: Option<W>,
    global: Option<Handler>,
    /// Incremented by every connect; a reader thread exits once it no longer matches
    generation: u64,
}

/// Side effects collected while the lock is held.
#[derive(Default)]
struct Effects {
    frames: Vec<u8>,
    events: Vec<(Option<Handler>, Event)>,
}

/// Bytes read from the broker and not yet decoded.
#[derive(Default)]
struct Inbound {
    buffer: Vec<u8>,
    /// Bytes of an oversized PUBLISH still to be discarded
    skip: usize,
}

impl Outbox<Handler> for Effects {
    fn transmit(&mut self, packet: &Packet) {
        let mut frame: heapless::Vec<u8, MAX_PACKET_LEN> = heapless::Vec::new();
        match packet.encode(&mut frame) {
            Ok(_) => self.frames.extend_from_slice(&frame),
            Err(e) => log::error!("cannot encode {}: {}", packet.packet_type().name(), e),
        }
    }

    fn notify(&mut self, handler: Option<Handler>, event: Event) {
        self.events.push((handler, event));
    }
}

impl Client<TcpConnector> {
    /// Create a client that connects over TCP, with timeouts taken from `options`.
    pub fn tcp(server_uri: &str, client_id: Option<&str>, options: Options) -> Result<Self, Error> {
        let connector = TcpConnector::new(
            Duration::from_millis(options.connect_timeout_ms.into()),
            Duration::from_millis(options.poll_interval_ms.into()),
        );
        Self::new(connector, server_uri, client_id, options)
    }
}

impl<T: Transport> Client<T> {
    /// Create a disconnected client.
    ///
    /// An absent or empty `client_id` is replaced by [`generate_client_id`].
    /// The server URI is validated when connecting.
    pub fn new(
        transport: T,
        server_uri: &str,
        client_id: Option<&str>,
        options: Options,
    ) -> Result<Self, Error> {
        let client_id = match client_id {
            Some(id) if !id.is_empty() => String::from(id),
            _ => generate_client_id(),
        };
        let session = Session::new(&client_id, options)?;

        Ok(Self {
            inner: Arc::new(Inner {
                server_uri: String::from(server_uri),
                client_id,
                epoch: Instant::now(),
                transport: Mutex::new(transport),
                shared: Mutex::new(Shared {
                    session,
                    writer: None,
                    global: None,
                    generation: 0,
                }),
            }),
        })
    }

    /// A handle that does not keep the client alive.
    pub fn downgrade(&self) -> WeakClient<T> {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Client identifier used in CONNECT.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Server URI given at construction.
    pub fn server_uri(&self) -> &str {
        &self.inner.server_uri
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().session.state()
    }

    /// `true` once CONNACK has been accepted and until the link ends.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register the handler for events that no operation handler claims:
    /// messages outside every subscription, inbound messages too large to
    /// hold, and loss of an established connection.
    ///
    /// The handler lives as long as the client; capture a [`WeakClient`]
    /// rather than a `Client` in it.
    pub fn set_event_handler(&self, handler: Handler) {
        self.inner.lock().global = Some(handler);
    }

    /// Connect to the broker.
    ///
    /// `handler` receives `Success(Info::Connected)` followed by
    /// `Event::Connected`, or one `Failure`.
    pub fn connect(&self, credentials: &Credentials, handler: Handler) {
        let remote = match self.inner.remote() {
            Ok(remote) => remote,
            Err(e) => return self.inner.dispatch_one(Some(handler), Event::Failure(e.into())),
        };

        let mut effects = Effects::default();
        let mut shared = self.inner.lock();
        let now = self.inner.now();
        if let Err(e) = shared
            .session
            .connect(credentials, Some(handler.clone()), now, &mut effects)
        {
            drop(shared);
            return self.inner.dispatch_one(Some(handler), Event::Failure(e));
        }
        shared.generation += 1;
        let generation = shared.generation;
        let connect_frame = core::mem::take(&mut effects.frames);

        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name(String::from("libmqtt-reader"))
            .spawn(move || run_reader(weak, remote, connect_frame, generation));
        if let Err(e) = spawned {
            log::error!("cannot spawn reader thread: {}", e);
            shared
                .session
                .connection_lost(Error::Network(network::Error::NotOpen), &mut effects);
        }
        self.inner.complete(shared, effects);
    }

    /// Subscribe to a topic filter. Matching messages are delivered to
    /// `handler` as `Event::Message`, as is the outcome of the subscribe.
    ///
    /// The handler is kept for the life of the subscription; capture a
    /// [`WeakClient`] rather than a `Client` in it.
    pub fn subscribe(&self, topic: &str, qos: QoS, handler: Handler) {
        self.operation(Some(handler), |session, handler, now, out| {
            session.subscribe(topic, qos, handler, now, out).map(|_| ())
        });
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, topic: &str, handler: Option<Handler>) {
        self.operation(handler, |session, handler, now, out| {
            session.unsubscribe(topic, handler, now, out).map(|_| ())
        });
    }

    /// Publish a message. QoS 0 completes as soon as it is written.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, handler: Handler) {
        self.operation(Some(handler), |session, handler, now, out| {
            session
                .publish(topic, payload, qos, false, handler, now, out)
                .map(|_| ())
        });
    }

    /// Disconnect from the broker. Pending operations fail with
    /// [`Error::Cancelled`].
    pub fn disconnect(&self, handler: Option<Handler>) {
        self.operation(handler, |session, handler, now, out| {
            session.disconnect(handler, now, out)
        });
    }

    fn operation<F>(&self, handler: Option<Handler>, op: F)
    where
        F: FnOnce(&mut Session<Handler>, Option<Handler>, u64, &mut Effects) -> Result<(), Error>,
    {
        let mut effects = Effects::default();
        let mut shared = self.inner.lock();
        let now = self.inner.now();
        match op(&mut shared.session, handler.clone(), now, &mut effects) {
            Ok(()) => {
                self.inner.complete(shared, effects);
            }
            Err(e) => {
                drop(shared);
                log::debug!("operation rejected: {}", e);
                self.inner.dispatch_one(handler, Event::Failure(e));
            }
        }
    }
}

impl<T: Transport> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Shared<T::Writer>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn remote(&self) -> Result<String, Precondition> {
        if self.server_uri.trim().is_empty() {
            return Err(Precondition::EmptyServerUri);
        }
        let uri = ServerUri::parse(&self.server_uri).map_err(|_| Precondition::InvalidServerUri)?;
        Ok(String::from(uri.remote().as_str()))
    }

    /// Write queued frames, settle a pending disconnect, release the lock,
    /// then run handlers. Returns the state the session was left in.
    fn complete(
        &self,
        mut shared: MutexGuard<'_, Shared<T::Writer>>,
        mut effects: Effects,
    ) -> ConnectionState {
        shared.flush(&mut effects);
        let state = shared.session.state();
        let global = shared.global.clone();
        drop(shared);
        dispatch(global, effects.events);
        state
    }

    fn dispatch_one(&self, handler: Option<Handler>, event: Event) {
        let global = self.lock().global.clone();
        let mut events = Vec::with_capacity(1);
        events.push((handler, event));
        dispatch(global, events);
    }

    /// Process one read result. Returns `false` when the reader should exit.
    fn on_read(
        &self,
        generation: u64,
        read: Result<usize, network::Error>,
        chunk: &[u8],
        inbound: &mut Inbound,
    ) -> bool {
        let mut effects = Effects::default();
        let mut shared = self.lock();
        if shared.generation != generation {
            return false;
        }
        let now = self.now();

        match read {
            Ok(0) => shared.session.connection_lost(
                Error::ConnectionLost(network::Error::ConnectionClosed),
                &mut effects,
            ),
            Ok(n) => {
                inbound.buffer.extend_from_slice(&chunk[..n]);
                shared.feed(inbound, now, &mut effects);
            }
            // Nothing arrived within the poll interval
            Err(network::Error::Timeout) => {}
            Err(e) => shared
                .session
                .connection_lost(Error::ConnectionLost(e), &mut effects),
        }
        shared.session.tick(now, &mut effects);

        self.complete(shared, effects) != ConnectionState::Disconnected
    }

    /// A connection attempt ended before the reader loop started.
    fn abort(&self, generation: u64, cause: Error) {
        let mut effects = Effects::default();
        let mut shared = self.lock();
        if shared.generation == generation {
            shared.session.connection_lost(cause, &mut effects);
        }
        self.complete(shared, effects);
    }
}

impl<W> Shared<W>
where
    W: Write<Error = network::Error> + Close<Error = network::Error>,
{
    /// Decode every complete packet in the buffer and hand it to the session.
    ///
    /// A PUBLISH too large for the client is skipped and reported to the
    /// registered handler; anything else malformed ends the connection.
    fn feed(&mut self, inbound: &mut Inbound, now: u64, effects: &mut Effects) {
        loop {
            if inbound.skip > 0 {
                let n = inbound.skip.min(inbound.buffer.len());
                inbound.buffer.drain(..n);
                inbound.skip -= n;
                if inbound.skip > 0 {
                    return;
                }
            }
            match decode(&inbound.buffer) {
                Ok((packet, used)) => {
                    inbound.buffer.drain(..used);
                    self.session.handle_packet(packet, now, effects);
                    if self.session.state() == ConnectionState::Disconnected {
                        inbound.buffer.clear();
                        return;
                    }
                }
                Err(CodecError::NeedMoreData) => return,
                Err(e) => {
                    let skip = match e {
                        CodecError::PacketTooLarge => publish_frame_len(&inbound.buffer),
                        _ => None,
                    };
                    if let Some(len) = skip {
                        log::warn!("discarding {} byte PUBLISH the client cannot hold", len);
                        inbound.skip = len;
                        effects.notify(None, Event::Failure(Error::Malformed(e)));
                        continue;
                    }
                    log::error!("malformed packet from broker: {}", e);
                    inbound.buffer.clear();
                    self.session.connection_lost(Error::Malformed(e), effects);
                    return;
                }
            }
        }
    }

    fn flush(&mut self, effects: &mut Effects) {
        if !effects.frames.is_empty() {
            let frames = core::mem::take(&mut effects.frames);
            let written = match self.writer.as_mut() {
                Some(writer) => writer.write_all(&frames).and_then(|()| writer.flush()),
                None => {
                    log::warn!("dropping {} bytes, no open connection", frames.len());
                    Ok(())
                }
            };
            if let Err(e) = written {
                log::warn!("write failed: {}", e);
                self.session.connection_lost(Error::ConnectionLost(e), effects);
            }
        }

        if self.session.state() == ConnectionState::Disconnecting {
            self.session.disconnected(effects);
        }
        if self.session.state() == ConnectionState::Disconnected {
            if let Some(writer) = self.writer.take() {
                if let Err(e) = writer.close() {
                    log::debug!("close failed: {}", e);
                }
            }
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        let now = self.now();
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut effects = Effects::default();
        if matches!(
            shared.session.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            let _ = shared.session.disconnect(None, now, &mut effects);
        }
        shared.flush(&mut effects);
        if let Some(writer) = shared.writer.take() {
            let _ = writer.close();
        }
        dispatch(shared.global.take(), effects.events);
    }
}

fn dispatch(global: Option<Handler>, events: Vec<(Option<Handler>, Event)>) {
    for (handler, event) in events {
        match handler.or_else(|| global.clone()) {
            Some(handler) => handler.on_event(event),
            None => log::debug!("no handler for {:?}", event),
        }
    }
}

fn run_reader<T: Transport>(
    weak: Weak<Inner<T>>,
    remote: String,
    connect_frame: Vec<u8>,
    generation: u64,
) {
    let mut reader = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let opened = inner
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open(&remote);
        let (reader, mut writer) = match opened {
            Ok(halves) => halves,
            Err(e) => {
                log::warn!("cannot open {}: {}", remote, e);
                inner.abort(generation, Error::Network(e));
                return;
            }
        };

        let mut effects = Effects::default();
        let mut shared = inner.lock();
        if shared.generation != generation || shared.session.state() != ConnectionState::Connecting {
            // Disconnected or reconnected while the transport was opening
            drop(shared);
            let _ = writer.close();
            return;
        }
        match writer.write_all(&connect_frame).and_then(|()| writer.flush()) {
            Ok(()) => shared.writer = Some(writer),
            Err(e) => {
                let _ = writer.close();
                shared
                    .session
                    .connection_lost(Error::ConnectionLost(e), &mut effects);
            }
        }
        if inner.complete(shared, effects) == ConnectionState::Disconnected {
            return;
        }
        log::debug!("connected to {}, waiting for CONNACK", remote);
        reader
    };

    let mut inbound = Inbound::default();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk);
        let Some(inner) = weak.upgrade() else {
            log::debug!("client dropped, reader exiting");
            return;
        };
        if !inner.on_read(generation, read, &chunk, &mut inbound) {
            log::debug!("reader for connection {} exiting", generation);
            return;
        }
    }
}
