//! Error types for the relay.
//!
//! None of these cross the relay's public contract. Endpoint and orchestrator
//! failures are converted into [`Notification`](crate::Notification)s, using
//! the error's display text and [`RelayError::severity`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::notification::Severity;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Failed to bind or listen on a local address.
    #[error("Failed to listen on {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// Failed to establish an outbound connection.
    #[error("Failed to connect to {0}: {1}")]
    Connect(SocketAddr, std::io::Error),

    /// Outbound connection did not complete within the configured timeout.
    #[error("Connection to {0} timed out after {1:?}")]
    ConnectTimeout(SocketAddr, Duration),

    /// Socket error on an established connection.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Host name does not resolve to an IPv4 address.
    #[error("Supplied Address: {0} does not resolve to a valid IPv4 address")]
    Unresolvable(String),

    /// Listener address is not assigned to this host.
    #[error("Supplied Listener Address: {0} is not local to this computer")]
    NotLocal(std::net::Ipv4Addr),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Returns the notification severity this error is reported at.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Unresolvable(_) | Self::NotLocal(_) | Self::Config(_) | Self::Json(_) => {
                Severity::Fatal
            }
            Self::Bind(..) | Self::Connect(..) | Self::ConnectTimeout(..) | Self::Io(_) => {
                Severity::Error
            }
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_fatal() {
        let err = RelayError::Unresolvable("nowhere.invalid".to_string());
        assert_eq!(err.severity(), Severity::Fatal);

        let err = RelayError::NotLocal([8, 8, 8, 8].into());
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(
            err.to_string(),
            "Supplied Listener Address: 8.8.8.8 is not local to this computer"
        );
    }

    #[test]
    fn socket_errors_are_errors() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = RelayError::Connect(addr, io);
        assert_eq!(err.severity(), Severity::Error);
        assert!(err.to_string().starts_with("Failed to connect to 127.0.0.1:9"));
    }
}
