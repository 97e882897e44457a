//! In-memory transport for client tests.
//!
//! Every `connect` creates a pair of channels and hands the broker side to
//! the test as a [`BrokerLink`], so a test can play the broker packet by
//! packet.

#![allow(dead_code)]

use heapless::Vec as HVec;
use libmqtt::mqtt::client::Handler;
use libmqtt::mqtt::packet::{decode, CodecError};
use libmqtt::mqtt::{client, Client, Event, Options, Packet, MAX_PACKET_LEN};
use libmqtt::network::error::Error;
use libmqtt::network::{Close, Connect, Connection, Read, Split, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// How long a test waits for something that should happen.
pub const WAIT: Duration = Duration::from_secs(2);

/// How long a test waits to make sure something does not happen.
pub const QUIET: Duration = Duration::from_millis(150);

const POLL: Duration = Duration::from_millis(10);

/// Mock connector: hands each opened connection's broker side to the test.
pub struct MockNetwork {
    links: Sender<BrokerLink>,
    refuse: bool,
}

impl MockNetwork {
    pub fn new() -> (Self, Receiver<BrokerLink>) {
        let (links, rx) = mpsc::channel();
        (Self { links, refuse: false }, rx)
    }

    /// A network on which every connection attempt is refused.
    pub fn refusing() -> Self {
        let (links, _) = mpsc::channel();
        Self { links, refuse: true }
    }
}

impl Connect for MockNetwork {
    type Connection = MockConnection;
    type Error = Error;

    fn connect(&mut self, _remote: &str) -> Result<Self::Connection, Self::Error> {
        if self.refuse {
            return Err(Error::ConnectionRefused);
        }
        let (to_client, from_broker) = mpsc::channel();
        let (to_broker, from_client) = mpsc::channel();
        self.links
            .send(BrokerLink {
                to_client: Some(to_client),
                from_client,
                buffer: Vec::new(),
            })
            .map_err(|_| Error::NotOpen)?;
        Ok(MockConnection {
            reader: MockReader {
                rx: from_broker,
                pending: Vec::new(),
            },
            writer: MockWriter { tx: to_broker },
        })
    }
}

pub struct MockConnection {
    reader: MockReader,
    writer: MockWriter,
}

impl Read for MockConnection {
    type Error = Error;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.reader.read(buf)
    }
}

impl Write for MockConnection {
    type Error = Error;
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for MockConnection {
    type Error = Error;
    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Connection for MockConnection {}

impl Split for MockConnection {
    type ReadHalf = MockReader;
    type WriteHalf = MockWriter;

    fn split(self) -> Result<(Self::ReadHalf, Self::WriteHalf), Error> {
        Ok((self.reader, self.writer))
    }
}

pub struct MockReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for MockReader {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(POLL) {
                Ok(bytes) => self.pending = bytes,
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

pub struct MockWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for MockWriter {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.send(buf.to_vec()).map_err(|_| Error::WriteError)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for MockWriter {
    type Error = Error;
    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The broker's end of one mock connection.
pub struct BrokerLink {
    to_client: Option<Sender<Vec<u8>>>,
    from_client: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
}

impl BrokerLink {
    /// Send a packet to the client.
    pub fn send(&self, packet: &Packet) {
        let mut frame: HVec<u8, MAX_PACKET_LEN> = HVec::new();
        packet.encode(&mut frame).unwrap();
        self.send_raw(&frame);
    }

    /// Send raw bytes to the client.
    pub fn send_raw(&self, bytes: &[u8]) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Drop the broker's sending side; the client sees end of stream.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Next packet from the client, waiting at most `timeout`.
    pub fn next_packet(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            match decode(&self.buffer) {
                Ok((packet, used)) => {
                    self.buffer.drain(..used);
                    return Some(packet);
                }
                Err(CodecError::NeedMoreData) => {}
                Err(e) => panic!("client sent a malformed packet: {:?}", e),
            }
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.from_client.recv_timeout(left) {
                Ok(bytes) => self.buffer.extend_from_slice(&bytes),
                Err(_) => return None,
            }
        }
    }

    /// Next packet from the client; panics if none arrives in time.
    pub fn expect_packet(&mut self) -> Packet {
        self.next_packet(WAIT).expect("client sent nothing")
    }

    /// Assert the client sends nothing for a short while.
    pub fn expect_silence(&mut self) {
        if let Some(packet) = self.next_packet(QUIET) {
            panic!("unexpected packet {:?}", packet);
        }
    }

    /// Wait until the client closes its side of the connection.
    pub fn expect_closed(&mut self) {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline
                .checked_duration_since(Instant::now())
                .expect("client did not close the connection");
            match self.from_client.recv_timeout(left) {
                Ok(bytes) => self.buffer.extend_from_slice(&bytes),
                Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => panic!("client did not close the connection"),
            }
        }
    }
}

/// A handler that forwards events into a channel.
pub fn recorder() -> (Handler, Receiver<Event>) {
    let (tx, rx) = mpsc::channel();
    let handler = client::handler(move |event| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

/// Next event, panicking if none arrives in time.
pub fn expect_event(events: &Receiver<Event>) -> Event {
    events.recv_timeout(WAIT).expect("no event delivered")
}

/// Assert no further event arrives for a short while.
pub fn expect_no_event(events: &Receiver<Event>) {
    if let Ok(event) = events.recv_timeout(QUIET) {
        panic!("unexpected event {:?}", event);
    }
}

pub const SERVER_URI: &str = "tcp://broker.test:1883";

pub fn new_client(options: Options) -> (Client<MockNetwork>, Receiver<BrokerLink>) {
    let (network, links) = MockNetwork::new();
    let client = Client::new(network, SERVER_URI, Some("test-client"), options).unwrap();
    (client, links)
}
