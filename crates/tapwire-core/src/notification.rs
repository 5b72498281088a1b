//! Severity-tagged diagnostic messages.
//!
//! Notifications are the relay's only failure channel. They are emitted for
//! observability and never drive control flow.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::event::Side;

/// Notification severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    /// Fatal or validation error (unresolvable or non-local address).
    Fatal = 1,

    /// Protocol or socket error.
    Error = 2,

    /// Informational trace.
    Info = 5,
}

impl Severity {
    /// Returns the numeric level (1, 2 or 5).
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Returns the severity as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// A diagnostic message raised by an endpoint or the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Human-readable message.
    pub message: String,
    /// Severity level.
    pub severity: Severity,
    /// Endpoint that raised it, `None` for orchestrator-level validation.
    pub origin: Option<Side>,
    /// When the notification was raised.
    pub at: DateTime<Local>,
}

impl Notification {
    /// Creates a notification stamped with the current time.
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            origin: None,
            at: Local::now(),
        }
    }

    /// Creates an informational notification.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Info)
    }

    /// Creates a socket/protocol error notification.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Error)
    }

    /// Tags the notification with the endpoint that raised it.
    pub fn from_side(mut self, side: Side) -> Self {
        self.origin = Some(side);
        self
    }

    /// Returns true for severities 1 and 2.
    pub fn is_error(&self) -> bool {
        self.severity <= Severity::Error
    }
}

impl From<&crate::RelayError> for Notification {
    fn from(err: &crate::RelayError) -> Self {
        Self::new(err.to_string(), err.severity())
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]: {}",
            self.at.format("%H:%M:%S"),
            self.severity,
            self.message
        )
    }
}
