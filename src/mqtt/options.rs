//! Client configuration.
//!
//! [`Options`] holds the timing and session knobs; [`Credentials`] carries
//! the optional user name and password sent in CONNECT.
//!
//! Options can be loaded from JSON without allocation:
//!
//! ```rust
//! use libmqtt::mqtt::Options;
//!
//! let options = Options::from_json(r#"{"keep_alive_secs": 30, "max_retries": 5}"#).unwrap();
//! assert_eq!(options.keep_alive_secs, 30);
//! assert_eq!(options.max_retries, 5);
//! // Fields not present keep their defaults
//! assert!(options.clean_session);
//! ```

use super::error::Precondition;
use super::{MAX_PASSWORD_LEN, MAX_USERNAME_LEN};
use heapless::String;
use serde::{Deserialize, Serialize};

/// Session timing and behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Keep-alive interval sent in CONNECT; 0 disables PINGREQ
    pub keep_alive_secs: u16,
    /// Ask the broker to discard previous session state
    pub clean_session: bool,
    /// How long to wait for CONNACK
    pub connect_timeout_ms: u32,
    /// Delay before an unacknowledged step is retransmitted
    pub retry_interval_ms: u32,
    /// Retransmissions before an operation fails with a timeout
    pub max_retries: u8,
    /// How long to wait for PINGRESP before declaring the link dead
    pub ping_timeout_ms: u32,
    /// Transport read timeout; bounds how late timers can fire
    pub poll_interval_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_alive_secs: 60,
            clean_session: true,
            connect_timeout_ms: 30_000,
            retry_interval_ms: 20_000,
            max_retries: 3,
            ping_timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

/// JSON configuration could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError;

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("invalid client configuration")
    }
}

impl Options {
    /// Parse options from a JSON object. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json_core::from_str(json)
            .map(|(options, _)| options)
            .map_err(|e| {
                log::warn!("invalid options JSON: {:?}", e);
                ConfigError
            })
    }

    /// Serialize options into `buf` as JSON, returning the number of bytes used.
    pub fn to_json(&self, buf: &mut [u8]) -> Result<usize, ConfigError> {
        serde_json_core::to_slice(self, buf).map_err(|_| ConfigError)
    }

    /// Keep-alive interval in milliseconds.
    pub fn keep_alive_ms(&self) -> u64 {
        u64::from(self.keep_alive_secs) * 1000
    }
}

/// User name and password for CONNECT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// User name, if any
    pub username: Option<String<MAX_USERNAME_LEN>>,
    /// Password, if any; requires a user name
    pub password: Option<String<MAX_PASSWORD_LEN>>,
}

impl Credentials {
    /// Build credentials. Empty strings mean "not set".
    ///
    /// ```rust
    /// use libmqtt::mqtt::{Credentials, Precondition};
    ///
    /// let creds = Credentials::new("user", "").unwrap();
    /// assert_eq!(creds.username.as_deref(), Some("user"));
    /// assert!(creds.password.is_none());
    ///
    /// assert_eq!(Credentials::new("", "secret"), Err(Precondition::PasswordWithoutUsername));
    /// ```
    pub fn new(username: &str, password: &str) -> Result<Self, Precondition> {
        let username = non_empty(username)?;
        let password = non_empty(password)?;
        if password.is_some() && username.is_none() {
            return Err(Precondition::PasswordWithoutUsername);
        }
        Ok(Self { username, password })
    }

    /// No user name and no password.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Parse credentials from a JSON object with optional `username` and
    /// `password` fields.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let (credentials, _): (Self, usize) =
            serde_json_core::from_str(json).map_err(|_| ConfigError)?;
        if credentials.password.is_some() && credentials.username.is_none() {
            return Err(ConfigError);
        }
        Ok(credentials)
    }
}

fn non_empty<const N: usize>(value: &str) -> Result<Option<String<N>>, Precondition> {
    if value.is_empty() {
        return Ok(None);
    }
    String::try_from(value)
        .map(Some)
        .map_err(|_| Precondition::CredentialsTooLong)
}
