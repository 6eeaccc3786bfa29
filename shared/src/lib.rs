//! Types shared between the connection orchestrator and its collaborators
//!
//! Sessions, clients and the server all read the same [`ProtocolConfig`], and
//! identify connections by [`ClientId`]. Keeping these in their own crate lets
//! collaborator crates depend on them without pulling in the server runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a [`ProtocolConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Immutable protocol settings handed to the server and to every session
///
/// All durations are stored in milliseconds so the JSON form stays flat.
/// Missing fields fall back to [`ProtocolConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest message a session will accept, in bytes
    pub max_message_size: u32,
    /// Ceiling for a connection that has not finished its handshake
    pub connect_timeout_ms: u64,
    /// Ceiling for an authenticated connection; `None` means unbounded
    pub session_timeout_ms: Option<u64>,
    /// Consecutive accept failures tolerated before the server gives up
    pub max_consecutive_accept_errors: u32,
    /// Pause after a failed accept
    pub accept_error_backoff_ms: u64,
    /// How often a blocked `stop()` reports clients that have not closed
    pub shutdown_report_interval_ms: u64,
    /// Period of the worker pool health check
    pub worker_monitor_interval_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            connect_timeout_ms: 30_000,
            session_timeout_ms: None,
            max_consecutive_accept_errors: 256,
            accept_error_backoff_ms: 100,
            shutdown_report_interval_ms: 5_000,
            worker_monitor_interval_ms: 1_000,
        }
    }
}

impl ProtocolConfig {
    /// Reads a JSON config file and validates it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: ProtocolConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.session_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "session_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        if self.max_consecutive_accept_errors == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_accept_errors must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    pub fn accept_error_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_error_backoff_ms)
    }

    pub fn shutdown_report_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_report_interval_ms.max(1))
    }

    pub fn worker_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.worker_monitor_interval_ms.max(1))
    }
}

/// Transport a client connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    Tcp,
    Tls,
    LocalSocket,
}

impl ConnectionType {
    /// Local sockets never leave the host, so they count as secure
    pub fn is_secure(self) -> bool {
        matches!(self, ConnectionType::Tls | ConnectionType::LocalSocket)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Tcp => write!(f, "tcp"),
            ConnectionType::Tls => write!(f, "tls"),
            ConnectionType::LocalSocket => write!(f, "socket"),
        }
    }
}

/// Phase of a client's life as seen by the supervision timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientState {
    /// Connection accepted, nothing received yet
    Accepted,
    /// Handshake or authentication in progress
    Authenticating,
    /// Authenticated and serving requests
    Running,
    /// Shutdown requested, releasing resources
    Closing,
    /// Resources released
    Closed,
}

impl ClientState {
    /// True while the client is still bound by the connect timeout
    pub fn is_handshaking(self) -> bool {
        matches!(self, ClientState::Accepted | ClientState::Authenticating)
    }

    pub fn is_closing(self) -> bool {
        matches!(self, ClientState::Closing | ClientState::Closed)
    }
}

/// Server-assigned identity of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}
