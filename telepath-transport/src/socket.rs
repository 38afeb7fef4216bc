//! # Socket Abstraction
//!
//! The push path talks to a socket-style pub/sub connection (Socket.IO on the
//! production relay). Rather than registering callbacks on a socket object,
//! the connection is modelled as two channels: commands flow from the client
//! to the socket driver, events flow back.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::Result;

/// Acknowledgement sentinel meaning "the server did not acknowledge".
pub const NO_ACK: &str = "NO ACK";

/// Event used to join the channel's room.
pub const IDENTIFY_EVENT: &str = "identify";

/// Event carrying a base64url encoded payload.
pub const NOTIFICATION_EVENT: &str = "notification";

/// Event the relay uses to report server-side problems.
pub const SERVER_ERROR_EVENT: &str = "server error";

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket (re)connected.
    Connect,
    /// A `notification` event with its base64url payload.
    Notification(String),
    /// The socket reported an error.
    Error(String),
    /// A `server error` event from the relay.
    ServerError(String),
    /// The socket lost its connection.
    Disconnect,
}

/// Instruction for the socket driver.
#[derive(Debug)]
pub enum SocketCommand {
    /// Emit an event without waiting for acknowledgement.
    Emit {
        /// Event name.
        event: String,
        /// Event payload.
        payload: String,
    },
    /// Emit an event and report the acknowledgement items.
    EmitWithAck {
        /// Event name.
        event: String,
        /// Event payload.
        payload: String,
        /// Receives the acknowledgement items.
        ack: oneshot::Sender<Vec<Value>>,
    },
    /// Close the connection and drop all handlers.
    Disconnect,
}

/// Client-side ends of a socket connection.
#[derive(Debug)]
pub struct SocketHandle {
    /// Commands to the socket driver.
    pub commands: mpsc::UnboundedSender<SocketCommand>,
    /// Events from the socket driver.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Driver-side ends of a socket connection.
#[derive(Debug)]
pub struct SocketDriver {
    /// Commands issued by the client.
    pub commands: mpsc::UnboundedReceiver<SocketCommand>,
    /// Events to report to the client.
    pub events: mpsc::UnboundedSender<SocketEvent>,
}

impl SocketHandle {
    /// Create a connected handle/driver pair.
    pub fn channel() -> (SocketHandle, SocketDriver) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            SocketHandle {
                commands: command_tx,
                events: event_rx,
            },
            SocketDriver {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

/// Opens socket connections to the notification relay.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a new connection. The driver reports `SocketEvent::Connect` once
    /// the connection is up.
    async fn connect(&self) -> Result<SocketHandle>;
}
