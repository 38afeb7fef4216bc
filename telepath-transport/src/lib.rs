//! # Telepath Transport
//!
//! Relay transports for Telepath secure channels. A channel is reachable over
//! two redundant paths addressed by the same channel id:
//!
//! - **Queuing service**: pull-based store-and-forward queues (durable)
//! - **Notification service**: socket-based push delivery (low latency),
//!   Socket.IO over WebSocket against a networked relay
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  POST/GET /<queue>   ┌─────────┐   GET/POST /<queue>  ┌──────────┐
//! │   App    │─────────────────────▶│  Relay  │◀─────────────────────│  Wallet  │
//! │(initiator│  identify/notify     │ (queue +│  identify/notify     │(responder│
//! │  side)   │◀════════════════════▶│ socket) │◀════════════════════▶│  side)   │
//! └──────────┘                      └─────────┘                      └──────────┘
//! ```
//!
//! Payloads are opaque to this crate; the channel layer encrypts them before
//! they get here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod notification;
pub mod queuing;
pub mod socket;
pub mod socket_io;

pub use memory::{IdentifyReply, MemoryRelay};
pub use notification::{
    NotificationClient, NotificationConfig, NotificationState, PushEvent, SetupCompletion,
    IDENTIFY_TIMEOUT,
};
pub use queuing::{QueueId, QueuingService, QueuingServiceClient};
pub use socket::{SocketCommand, SocketConnector, SocketDriver, SocketEvent, SocketHandle, NO_ACK};
pub use socket_io::SocketIoConnector;
pub use telepath_crypto::ChannelId;

use thiserror::Error;

/// Errors that can occur in the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The relay could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The relay answered with an unexpected HTTP status.
    #[error("Relay rejected request with status {status}")]
    Relay {
        /// HTTP status code returned by the relay.
        status: u16,
    },

    /// The relay URL cannot be used.
    #[error("Invalid relay url: {0}")]
    InvalidUrl(String),

    /// The identify handshake was explicitly refused.
    #[error("Notification setup failed")]
    SetupFailed,

    /// The socket reported an error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The relay reported a server-side problem.
    #[error("Server error: {0}")]
    ServerError(String),

    /// An inbound payload could not be decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The transport was closed.
    #[error("Transport closed")]
    Closed,
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
