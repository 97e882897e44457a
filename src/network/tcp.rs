//! TCP transport built on [`std::net::TcpStream`].
//!
//! Reads use a socket read timeout equal to the configured poll interval; a
//! timed-out read surfaces as [`Error::Timeout`] so the client can service
//! its timers. Closing the write half shuts the socket down in both
//! directions, which wakes the reader.

use super::error::Error;
use super::{Close, Connect, Connection, Read, Split, Write};
use std::io::{self, Read as _, Write as _};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Opens TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the given connect timeout and read poll interval.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_millis(100))
    }
}

impl Connect for TcpConnector {
    type Connection = TcpConnection;
    type Error = Error;

    fn connect(&mut self, remote: &str) -> Result<Self::Connection, Self::Error> {
        let addrs = remote.to_socket_addrs().map_err(|e| {
            log::warn!("cannot resolve {}: {}", remote, e);
            Error::InvalidAddress
        })?;

        let mut last_error = Error::InvalidAddress;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(|_| Error::NotOpen)?;
                    stream
                        .set_read_timeout(Some(self.read_timeout))
                        .map_err(|_| Error::NotOpen)?;
                    log::debug!("tcp connected to {}", addr);
                    return Ok(TcpConnection { stream });
                }
                Err(e) => {
                    log::debug!("tcp connect to {} failed: {}", addr, e);
                    last_error = map_io_error(&e, Error::ConnectionRefused);
                }
            }
        }
        Err(last_error)
    }
}

/// An open TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl Read for TcpConnection {
    type Error = Error;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        read_stream(&mut self.stream, buf)
    }
}

impl Write for TcpConnection {
    type Error = Error;
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream.write(buf).map_err(|_| Error::WriteError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush().map_err(|_| Error::WriteError)
    }
}

impl Close for TcpConnection {
    type Error = Error;
    fn close(self) -> Result<(), Self::Error> {
        shutdown(&self.stream)
    }
}

impl Connection for TcpConnection {}

impl Split for TcpConnection {
    type ReadHalf = TcpReadHalf;
    type WriteHalf = TcpWriteHalf;

    fn split(self) -> Result<(Self::ReadHalf, Self::WriteHalf), Error> {
        let reader = self.stream.try_clone().map_err(|_| Error::NotOpen)?;
        Ok((TcpReadHalf { stream: reader }, TcpWriteHalf { stream: self.stream }))
    }
}

/// Receiving half of a [`TcpConnection`].
#[derive(Debug)]
pub struct TcpReadHalf {
    stream: TcpStream,
}

impl Read for TcpReadHalf {
    type Error = Error;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        read_stream(&mut self.stream, buf)
    }
}

/// Sending half of a [`TcpConnection`].
#[derive(Debug)]
pub struct TcpWriteHalf {
    stream: TcpStream,
}

impl Write for TcpWriteHalf {
    type Error = Error;
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream.write(buf).map_err(|_| Error::WriteError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush().map_err(|_| Error::WriteError)
    }
}

impl Close for TcpWriteHalf {
    type Error = Error;
    fn close(self) -> Result<(), Self::Error> {
        shutdown(&self.stream)
    }
}

fn read_stream(stream: &mut TcpStream, buf: &mut [u8]) -> Result<usize, Error> {
    stream
        .read(buf)
        .map_err(|e| map_io_error(&e, Error::ReadError))
}

fn shutdown(stream: &TcpStream) -> Result<(), Error> {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => Ok(()),
        // Already closed by the peer
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(_) => Err(Error::NotOpen),
    }
}

fn map_io_error(e: &io::Error, fallback: Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => fallback,
    }
}
