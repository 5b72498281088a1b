//! Tapwire Core - intercepting TCP relay.
//!
//! Accepts a single local client, connects to a remote service, and copies
//! bytes in both directions while every chunk is published to observers.
//!
//! ## Features
//!
//! - Listen-role and connect-role [`ConnectionEndpoint`]s on non-blocking sockets
//! - Outbound data buffered while a side is not connected, flushed in order
//! - Local disconnect cascades into a remote disconnect
//! - One merged event stream for data, state changes and notifications
//!
//! ## Architecture
//!
//! ```text
//! local client ⇄ Local endpoint ⇄ RelayOrchestrator ⇄ Remote endpoint ⇄ remote service
//!                                        │
//!                                        ▼
//!                                 RelayEvent stream
//! ```

mod config;
mod endpoint;
mod error;
mod event;
mod notification;
mod relay;
mod resolve;

pub use config::{
    EndpointOptions, RelayConfig, DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_LISTENER_HOST,
    DEFAULT_LISTENER_PORT, DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SENDER_HOST, DEFAULT_SENDER_PORT,
};
pub use endpoint::{ConnectionEndpoint, EndpointMode, EventReceiver, EventSender};
pub use error::{RelayError, Result};
pub use event::{EndpointEvent, EndpointEventKind, RelayEvent, Side};
pub use notification::{Notification, Severity};
pub use relay::{RelayEvents, RelayOrchestrator, RelayStats};
pub use resolve::{AddressResolver, StaticResolver, SystemResolver};
