//! Event types raised by endpoints and republished by the relay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::notification::Notification;

/// Which half of the relay an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Listen-role endpoint facing the local client.
    Local,
    /// Connect-role endpoint facing the remote service.
    Remote,
}

impl Side {
    /// Returns the opposite side.
    pub fn peer(&self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }

    /// Returns the side as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Remote => "Remote",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an endpoint observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEventKind {
    /// Bytes read from the connection, exactly as delivered by the OS.
    Data(Bytes),
    /// Connection state transition.
    Connected(bool),
    /// Diagnostic message.
    Notice(Notification),
}

/// An event raised by a [`ConnectionEndpoint`](crate::ConnectionEndpoint),
/// tagged with the endpoint's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEvent {
    /// Endpoint that raised the event.
    pub side: Side,
    /// Event payload.
    pub kind: EndpointEventKind,
}

impl EndpointEvent {
    pub(crate) fn data(side: Side, data: Bytes) -> Self {
        Self {
            side,
            kind: EndpointEventKind::Data(data),
        }
    }

    pub(crate) fn connected(side: Side, connected: bool) -> Self {
        Self {
            side,
            kind: EndpointEventKind::Connected(connected),
        }
    }

    pub(crate) fn notice(side: Side, notification: Notification) -> Self {
        Self {
            side,
            kind: EndpointEventKind::Notice(notification.from_side(side)),
        }
    }
}

/// Observer-facing event published by the [`RelayOrchestrator`](crate::RelayOrchestrator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Bytes received from the local client (about to go to the remote peer).
    LocalData(Bytes),
    /// Bytes received from the remote peer (about to go to the local client).
    RemoteData(Bytes),
    /// Local client connected or disconnected.
    LocalConnected(bool),
    /// Remote peer connected or disconnected.
    RemoteConnected(bool),
    /// Merged notification stream from both endpoints and the relay.
    Notification(Notification),
}

impl RelayEvent {
    /// Builds the observer-facing form of an endpoint event.
    pub fn from_endpoint(event: EndpointEvent) -> Self {
        match (event.side, event.kind) {
            (Side::Local, EndpointEventKind::Data(data)) => Self::LocalData(data),
            (Side::Remote, EndpointEventKind::Data(data)) => Self::RemoteData(data),
            (Side::Local, EndpointEventKind::Connected(c)) => Self::LocalConnected(c),
            (Side::Remote, EndpointEventKind::Connected(c)) => Self::RemoteConnected(c),
            (_, EndpointEventKind::Notice(n)) => Self::Notification(n),
        }
    }
}
