//! Server URI parsing.
//!
//! Accepts `tcp://host:port` and `mqtt://host:port` (port defaults to 1883)
//! as well as a bare `host[:port]`. Encrypted schemes are recognised and
//! rejected, since this crate only speaks plain TCP.

use super::error::Error;
use core::fmt::Write as _;
use heapless::String;

/// Maximum length of a host name (RFC 1035 limit).
pub const MAX_HOST_LEN: usize = 253;

/// Default port for unencrypted MQTT.
pub const DEFAULT_PORT: u16 = 1883;

/// A parsed broker address.
///
/// # Examples
///
/// ```rust
/// use libmqtt::network::ServerUri;
///
/// let uri = ServerUri::parse("tcp://192.168.1.11:1883").unwrap();
/// assert_eq!(uri.host(), "192.168.1.11");
/// assert_eq!(uri.port(), 1883);
/// assert_eq!(uri.remote().as_str(), "192.168.1.11:1883");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    host: String<MAX_HOST_LEN>,
    port: u16,
}

impl ServerUri {
    /// Parse a server URI.
    ///
    /// Returns [`Error::InvalidAddress`] for an empty host, an unparsable
    /// port, an unknown scheme or a TLS scheme (`ssl`, `tls`, `mqtts`).
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let uri = uri.trim();
        let rest = match uri.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => {
                log::warn!("unsupported URI scheme '{}'", scheme);
                return Err(Error::InvalidAddress);
            }
            None => uri,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // IPv6 literal, keep the brackets so the result is a valid socket address
            let (inner, after) = bracketed.split_once(']').ok_or(Error::InvalidAddress)?;
            let port = match after {
                "" => DEFAULT_PORT,
                p => parse_port(p.strip_prefix(':').ok_or(Error::InvalidAddress)?)?,
            };
            if inner.is_empty() {
                return Err(Error::InvalidAddress);
            }
            (&rest[..inner.len() + 2], port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (rest, DEFAULT_PORT),
            }
        };

        if host.is_empty() || host.contains('/') {
            return Err(Error::InvalidAddress);
        }

        Ok(Self {
            host: String::try_from(host).map_err(|_| Error::InvalidAddress)?,
            port,
        })
    }

    /// Host name or address literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for [`Connect::connect`](super::Connect::connect).
    pub fn remote(&self) -> String<{ MAX_HOST_LEN + 6 }> {
        let mut out = String::new();
        // Capacity covers the longest host plus ':' and five port digits
        let _ = write!(out, "{}:{}", self.host, self.port);
        out
    }
}

fn parse_port(port: &str) -> Result<u16, Error> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::InvalidAddress),
        Ok(port) => Ok(port),
    }
}
