//! A transport abstraction layer for the MQTT client
//!
//! This module provides the traits a byte-stream transport must implement to
//! carry MQTT traffic, along with a server URI parser and, when the `std`
//! feature is enabled, a TCP implementation built on [`std::net::TcpStream`].
//!
//! The contract mirrors a classic socket:
//!
//! * [`Connect::connect`] opens a connection to a remote `host:port`.
//! * [`Read::read`] pulls bytes; `Ok(0)` means the peer closed the stream and
//!   `Err(Error::Timeout)` means nothing arrived within the poll interval.
//! * [`Write::write`] / [`Write::flush`] push bytes.
//! * [`Close::close`] tears the connection down.
//!
//! [`Split`] divides a connection into independent halves so that a reader
//! thread can block on the read half while callers keep writing.

#![allow(missing_docs)]
#![deny(unsafe_code)]

/// Common error types for network operations
pub mod error;

/// Server URI parsing
pub mod uri;

/// TCP transport over `std::net`
#[cfg(feature = "std")]
pub mod tcp;

pub use error::Error;
pub use uri::ServerUri;

/// Re-exports of common traits
pub mod prelude {
    pub use super::{Close, Connect, Connection, Read, Split, Transport, Write};
}

// Core synchronous traits
pub trait Read {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Read data from the connection
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

pub trait Write {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Write data to the connection
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;
    /// Flush the write buffer
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Write an entire buffer, retrying short writes.
    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), Self::Error>
    where
        Self::Error: From<Error>,
    {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::WriteError.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

pub trait Close {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Close the connection
    fn close(self) -> Result<(), Self::Error>;
}

/// A synchronous connection
pub trait Connection: Read + Write + Close {}

/// A synchronous connector (client)
pub trait Connect {
    /// Associated connection type
    type Connection: Connection;
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Open a connection
    fn connect(&mut self, remote: &str) -> Result<Self::Connection, Self::Error>;
}

/// A connection that can be divided into a read half and a write half.
///
/// The halves are moved to different threads: the read half to the client's
/// reader, the write half behind the client's lock. Closing the write half
/// must unblock a pending read on the read half (for sockets, a shutdown).
pub trait Split: Connection {
    /// The half that receives bytes from the peer
    type ReadHalf: Read<Error = Error> + Send + 'static;
    /// The half that sends bytes to the peer
    type WriteHalf: Write<Error = Error> + Close<Error = Error> + Send + 'static;
    /// Divide the connection
    fn split(self) -> Result<(Self::ReadHalf, Self::WriteHalf), Error>;
}

/// Everything the MQTT client needs from a transport: open a connection to a
/// remote address and hand back its two halves.
///
/// Implemented for every [`Connect`] whose connection is [`Split`].
pub trait Transport: Send + 'static {
    /// The half read by the client's reader thread
    type Reader: Read<Error = Error> + Send + 'static;
    /// The half written by operation calls
    type Writer: Write<Error = Error> + Close<Error = Error> + Send + 'static;
    /// Open a connection to `remote` (`host:port`)
    fn open(&mut self, remote: &str) -> Result<(Self::Reader, Self::Writer), Error>;
}

impl<C> Transport for C
where
    C: Connect + Send + 'static,
    C::Connection: Split,
    C::Error: Into<Error>,
{
    type Reader = <C::Connection as Split>::ReadHalf;
    type Writer = <C::Connection as Split>::WriteHalf;

    fn open(&mut self, remote: &str) -> Result<(Self::Reader, Self::Writer), Error> {
        let connection = self.connect(remote).map_err(Into::into)?;
        connection.split()
    }
}
