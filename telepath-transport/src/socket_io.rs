//! # Socket.IO Connector
//!
//! Push path to a networked relay: Socket.IO v4 over a WebSocket at
//! `<relay>/socket.io/?EIO=4&transport=websocket`. Only the text packets the
//! notification client needs are spoken (namespace connect, events,
//! acknowledgements and the Engine.IO heartbeat).
//!
//! ```text
//!   relay                                  client
//!     │ 0{"sid":..}  ───────────────────────▶ │  open
//!     │ ◀─────────────────────────────── 40   │  join "/"
//!     │ 40{"sid":..} ───────────────────────▶ │  SocketEvent::Connect
//!     │ ◀──────────── 420["identify","<id>"]  │  EmitWithAck
//!     │ 430[]        ───────────────────────▶ │  ack items
//!     │ 2            ───────────────────────▶ │  ping
//!     │ ◀──────────────────────────────── 3   │  pong
//! ```
//!
//! A lost connection is reported as [`SocketEvent::Disconnect`] and retried
//! after the reconnect delay, so the notification client identifies again.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::socket::{
    SocketCommand, SocketConnector, SocketDriver, SocketEvent, SocketHandle, NOTIFICATION_EVENT,
    SERVER_ERROR_EVENT,
};
use crate::{Result, TransportError};

/// Path the relay serves Socket.IO on.
pub const SOCKET_IO_PATH: &str = "/socket.io/";

/// Wait before reconnecting a lost socket.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

type Acks = HashMap<u64, oneshot::Sender<Vec<Value>>>;
type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Engine.IO packet, with Socket.IO messages decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake with the session parameters.
    Open(Value),
    /// Engine.IO close.
    Close,
    /// Heartbeat from the relay.
    Ping,
    /// Heartbeat answer.
    Pong,
    /// Default namespace joined.
    Connect,
    /// Default namespace left.
    Disconnect,
    /// Named event, optionally asking for an acknowledgement.
    Event {
        /// Event name.
        name: String,
        /// Event arguments.
        args: Vec<Value>,
        /// Acknowledgement id.
        ack_id: Option<u64>,
    },
    /// Acknowledgement of an earlier event.
    Ack {
        /// Id the event was sent with.
        ack_id: u64,
        /// Acknowledgement items.
        args: Vec<Value>,
    },
    /// The relay refused the namespace.
    ConnectError(String),
    /// Engine.IO no-op.
    Noop,
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidPayload(reason.into())
}

impl Packet {
    /// Event with a single string argument.
    pub fn event(name: impl Into<String>, payload: impl Into<String>, ack_id: Option<u64>) -> Self {
        Self::Event {
            name: name.into(),
            args: vec![Value::String(payload.into())],
            ack_id,
        }
    }

    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or_else(|| invalid("empty packet"))?;
        let rest = chars.as_str();
        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(rest).unwrap_or(Value::Null))),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '4' => Self::parse_message(rest),
            '6' => Ok(Self::Noop),
            other => Err(invalid(format!("unknown engine packet type {other:?}"))),
        }
    }

    fn parse_message(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or_else(|| invalid("empty message"))?;
        let mut rest = chars.as_str();

        // only the default namespace is joined
        if rest.starts_with('/') {
            rest = rest.split_once(',').map_or("", |(_, tail)| tail);
        }

        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let (id, data) = rest.split_at(digits);
        let ack_id = if id.is_empty() {
            None
        } else {
            Some(id.parse::<u64>().map_err(|e| invalid(e.to_string()))?)
        };

        match kind {
            '0' => Ok(Self::Connect),
            '1' => Ok(Self::Disconnect),
            '2' => {
                let mut items: Vec<Value> =
                    serde_json::from_str(data).map_err(|e| invalid(e.to_string()))?;
                if items.is_empty() {
                    return Err(invalid("event without a name"));
                }
                match items.remove(0) {
                    Value::String(name) => Ok(Self::Event {
                        name,
                        args: items,
                        ack_id,
                    }),
                    other => Err(invalid(format!("event name {other} is not a string"))),
                }
            }
            '3' => Ok(Self::Ack {
                ack_id: ack_id.ok_or_else(|| invalid("acknowledgement without an id"))?,
                args: serde_json::from_str(data).map_err(|e| invalid(e.to_string()))?,
            }),
            '4' => {
                let message = serde_json::from_str::<Value>(data)
                    .ok()
                    .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
                    .unwrap_or_else(|| data.to_owned());
                Ok(Self::ConnectError(message))
            }
            other => Err(invalid(format!("unsupported message type {other:?}"))),
        }
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> String {
        match self {
            Self::Open(params) => format!("0{params}"),
            Self::Close => "1".into(),
            Self::Ping => "2".into(),
            Self::Pong => "3".into(),
            Self::Connect => "40".into(),
            Self::Disconnect => "41".into(),
            Self::Event { name, args, ack_id } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                let id = ack_id.map(|id| id.to_string()).unwrap_or_default();
                format!("42{id}{}", Value::Array(items))
            }
            Self::Ack { ack_id, args } => format!("43{ack_id}{}", Value::Array(args.clone())),
            Self::ConnectError(message) => format!("44{}", json!({ "message": message })),
            Self::Noop => "6".into(),
        }
    }
}

/// Opens Socket.IO connections to a relay.
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    url: Url,
    reconnect_delay: Duration,
}

impl SocketIoConnector {
    /// Connector for the relay at `service_url` (`http(s)` or `ws(s)`).
    pub fn new(service_url: &str) -> Result<Self> {
        let mut url =
            Url::parse(service_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "no socket transport for scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(service_url.to_owned()))?;
        url.set_path(SOCKET_IO_PATH);
        url.set_fragment(None);
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");

        Ok(Self {
            url,
            reconnect_delay: RECONNECT_DELAY,
        })
    }

    /// Override the wait before reconnecting.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// WebSocket endpoint.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SocketConnector for SocketIoConnector {
    async fn connect(&self) -> Result<SocketHandle> {
        let (handle, driver) = SocketHandle::channel();
        tokio::spawn(drive(self.url.clone(), self.reconnect_delay, driver));
        Ok(handle)
    }
}

enum SessionEnd {
    /// The client asked to disconnect.
    Closed,
    /// The connection dropped.
    Lost,
}

async fn drive(url: Url, reconnect_delay: Duration, driver: SocketDriver) {
    let SocketDriver {
        mut commands,
        events,
    } = driver;
    let mut acks = Acks::new();
    let mut next_ack = 0;

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                tracing::debug!("Socket connected to {}", url);
                let end = session(stream, &mut commands, &events, &mut acks, &mut next_ack).await;
                // pending acknowledgements die with the session
                acks.clear();
                if matches!(end, SessionEnd::Closed) {
                    return;
                }
                if events.send(SocketEvent::Disconnect).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Socket connection to {} failed: {}", url, e);
                if events.send(SocketEvent::Error(e.to_string())).is_err() {
                    return;
                }
            }
        }

        let sleep = tokio::time::sleep(reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(SocketCommand::Disconnect) | None => return,
                    Some(_) => tracing::debug!("Socket offline, command dropped"),
                },
            }
        }
    }
}

async fn session(
    stream: RelayStream,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &mpsc::UnboundedSender<SocketEvent>,
    acks: &mut Acks,
    next_ack: &mut u64,
) -> SessionEnd {
    let (mut sink, mut source) = stream.split();

    loop {
        let reply = tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Emit { event, payload }) => Packet::event(event, payload, None),
                Some(SocketCommand::EmitWithAck { event, payload, ack }) => {
                    let id = *next_ack;
                    *next_ack += 1;
                    acks.insert(id, ack);
                    Packet::event(event, payload, Some(id))
                }
                Some(SocketCommand::Disconnect) | None => {
                    let _ = sink.send(Message::Text(Packet::Disconnect.encode())).await;
                    let _ = sink.close().await;
                    return SessionEnd::Closed;
                }
            },
            frame = source.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = events.send(SocketEvent::Error(e.to_string()));
                        return SessionEnd::Lost;
                    }
                };
                let packet = match Packet::parse(&text) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!("Ignoring socket frame: {}", e);
                        continue;
                    }
                };
                match on_packet(packet, events, acks) {
                    Inbound::Reply(reply) => reply,
                    Inbound::Handled => continue,
                    Inbound::Lost => return SessionEnd::Lost,
                }
            }
        };

        if let Err(e) = sink.send(Message::Text(reply.encode())).await {
            let _ = events.send(SocketEvent::Error(e.to_string()));
            return SessionEnd::Lost;
        }
    }
}

enum Inbound {
    Reply(Packet),
    Handled,
    Lost,
}

fn on_packet(packet: Packet, events: &mpsc::UnboundedSender<SocketEvent>, acks: &mut Acks) -> Inbound {
    match packet {
        Packet::Open(_) => return Inbound::Reply(Packet::Connect),
        Packet::Ping => return Inbound::Reply(Packet::Pong),
        Packet::Close | Packet::Disconnect => return Inbound::Lost,
        Packet::Connect => {
            let _ = events.send(SocketEvent::Connect);
        }
        Packet::ConnectError(message) => {
            let _ = events.send(SocketEvent::Error(message));
        }
        Packet::Event { name, args, .. } if name == NOTIFICATION_EVENT => {
            match args.into_iter().next() {
                Some(Value::String(payload)) => {
                    let _ = events.send(SocketEvent::Notification(payload));
                }
                _ => tracing::debug!("Notification without a string payload"),
            }
        }
        Packet::Event { name, args, .. } if name == SERVER_ERROR_EVENT => {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("unknown server error");
            let _ = events.send(SocketEvent::ServerError(message.to_owned()));
        }
        Packet::Event { name, .. } => tracing::debug!("Ignoring socket event {:?}", name),
        Packet::Ack { ack_id, args } => match acks.remove(&ack_id) {
            Some(ack) => {
                let _ = ack.send(args);
            }
            None => tracing::debug!("Acknowledgement {} matches no event", ack_id),
        },
        Packet::Pong | Packet::Noop => {}
    }
    Inbound::Handled
}
