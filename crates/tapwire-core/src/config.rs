//! Relay configuration.
//!
//! Loaded from an optional JSON file; every field has a default so partial
//! files are valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Default address the local listener binds to.
pub const DEFAULT_LISTENER_HOST: &str = "localhost";

/// Default local listener port.
pub const DEFAULT_LISTENER_PORT: u16 = 499;

/// Default remote host.
pub const DEFAULT_SENDER_HOST: &str = "localhost";

/// Default remote port.
pub const DEFAULT_SENDER_PORT: u16 = 500;

/// Default size of a single receive.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Default time a disconnecting endpoint keeps flushing queued data.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5000;

/// Socket options applied by a [`ConnectionEndpoint`](crate::ConnectionEndpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointOptions {
    /// Maximum bytes delivered per data event.
    pub recv_buffer_size: usize,
    /// Whether to set TCP_NODELAY on established connections.
    pub nodelay: bool,
    /// Optional limit on how long an outbound connect may take.
    pub connect_timeout: Option<Duration>,
    /// How long a disconnect may spend writing data already queued.
    pub drain_timeout: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            nodelay: true,
            connect_timeout: None,
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host name or address the local listener binds to.
    pub listener_host: String,
    /// Local listener port.
    pub listener_port: u16,
    /// Host name or address of the remote service.
    pub sender_host: String,
    /// Remote service port.
    pub sender_port: u16,
    /// Maximum bytes delivered per data event.
    pub recv_buffer_size: usize,
    /// Whether to set TCP_NODELAY on established connections.
    pub nodelay: bool,
    /// Outbound connect timeout in milliseconds (None = OS default).
    pub connect_timeout_ms: Option<u64>,
    /// Time a disconnect may spend flushing queued data, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Path of the CSV traffic log (None = front end default).
    pub traffic_log: Option<PathBuf>,
    /// Connect to the remote service as soon as the local client connects.
    pub auto_start_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listener_host: DEFAULT_LISTENER_HOST.to_string(),
            listener_port: DEFAULT_LISTENER_PORT,
            sender_host: DEFAULT_SENDER_HOST.to_string(),
            sender_port: DEFAULT_SENDER_PORT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            nodelay: true,
            connect_timeout_ms: None,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            traffic_log: None,
            auto_start_sender: true,
        }
    }
}

impl RelayConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.recv_buffer_size == 0 {
            return Err(RelayError::Config(
                "recv_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.listener_host.trim().is_empty() || self.sender_host.trim().is_empty() {
            return Err(RelayError::Config("host names must not be empty".to_string()));
        }
        Ok(())
    }

    /// Sets the listener host and port.
    pub fn with_listener(mut self, host: impl Into<String>, port: u16) -> Self {
        self.listener_host = host.into();
        self.listener_port = port;
        self
    }

    /// Sets the remote host and port.
    pub fn with_sender(mut self, host: impl Into<String>, port: u16) -> Self {
        self.sender_host = host.into();
        self.sender_port = port;
        self
    }

    /// Sets the receive buffer size.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sets the traffic log path.
    pub fn with_traffic_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.traffic_log = Some(path.into());
        self
    }

    /// Disables connecting to the remote service when the local client connects.
    pub fn without_auto_start(mut self) -> Self {
        self.auto_start_sender = false;
        self
    }

    /// Socket options for the relay's endpoints.
    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            recv_buffer_size: self.recv_buffer_size.max(1),
            nodelay: self.nodelay,
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}
