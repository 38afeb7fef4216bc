//! # In-Memory Relay
//!
//! A relay that lives inside the process: FIFO queues for the queuing service
//! and socket rooms for the notification service. Two endpoints sharing one
//! `MemoryRelay` can pair and talk without any network.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::queuing::{QueueId, QueuingService};
use crate::socket::{
    SocketCommand, SocketConnector, SocketEvent, SocketHandle, IDENTIFY_EVENT, NOTIFICATION_EVENT,
    NO_ACK,
};
use crate::{ChannelId, Result};

/// How the relay answers `identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifyReply {
    /// Join the room and acknowledge.
    #[default]
    Ack,
    /// Refuse with the `"NO ACK"` sentinel.
    NoAck,
    /// Join the room but never acknowledge.
    Silent,
}

#[derive(Default)]
struct RelayState {
    queues: HashMap<QueueId, VecDeque<Bytes>>,
    sockets: HashMap<u64, RelaySocket>,
    next_socket: u64,
    identify_reply: IdentifyReply,
}

struct RelaySocket {
    room: Option<ChannelId>,
    events: mpsc::UnboundedSender<SocketEvent>,
    /// Acknowledgements the relay chose not to answer.
    unanswered: Vec<oneshot::Sender<Vec<Value>>>,
}

/// In-process relay implementing both the queuing and the socket API.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose how future `identify` requests are answered.
    pub async fn set_identify_reply(&self, reply: IdentifyReply) {
        self.state.lock().await.identify_reply = reply;
    }

    /// Number of messages waiting in a queue.
    pub async fn queue_len(&self, queue_id: &QueueId) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue_id)
            .map_or(0, VecDeque::len)
    }

    /// Number of open sockets.
    pub async fn connected_sockets(&self) -> usize {
        self.state.lock().await.sockets.len()
    }

    /// Send a `server error` event to every socket in a room.
    pub async fn server_error(&self, room: &ChannelId, message: &str) {
        let state = self.state.lock().await;
        for socket in state.sockets.values() {
            if socket.room.as_ref() == Some(room) {
                let _ = socket.events.send(SocketEvent::ServerError(message.to_owned()));
            }
        }
    }

    async fn drive(
        state: Arc<Mutex<RelayState>>,
        socket_id: u64,
        mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    ) {
        while let Some(command) = commands.recv().await {
            let mut state = state.lock().await;
            match command {
                SocketCommand::Emit { event, payload } if event == NOTIFICATION_EVENT => {
                    let room = state.sockets.get(&socket_id).and_then(|s| s.room.clone());
                    let Some(room) = room else {
                        tracing::debug!("Socket {} sent a notification before identify", socket_id);
                        continue;
                    };
                    for (id, socket) in state.sockets.iter() {
                        if *id != socket_id && socket.room.as_ref() == Some(&room) {
                            let _ = socket.events.send(SocketEvent::Notification(payload.clone()));
                        }
                    }
                }
                SocketCommand::EmitWithAck {
                    event,
                    payload,
                    ack,
                } if event == IDENTIFY_EVENT => {
                    let reply = state.identify_reply;
                    let Some(socket) = state.sockets.get_mut(&socket_id) else {
                        break;
                    };
                    match reply {
                        IdentifyReply::Ack => {
                            socket.room = Some(ChannelId::new(payload));
                            let _ = ack.send(Vec::new());
                        }
                        IdentifyReply::NoAck => {
                            let _ = ack.send(vec![json!(NO_ACK)]);
                        }
                        IdentifyReply::Silent => {
                            socket.room = Some(ChannelId::new(payload));
                            socket.unanswered.push(ack);
                        }
                    }
                }
                SocketCommand::EmitWithAck { ack, .. } => {
                    let _ = ack.send(Vec::new());
                }
                SocketCommand::Emit { event, .. } => {
                    tracing::debug!("Memory relay ignoring event {:?}", event);
                }
                SocketCommand::Disconnect => break,
            }
        }

        state.lock().await.sockets.remove(&socket_id);
    }
}

#[async_trait]
impl QueuingService for MemoryRelay {
    async fn send(&self, queue_id: &QueueId, message: Bytes) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .entry(queue_id.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn receive(&self, queue_id: &QueueId) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().await;
        Ok(state.queues.get_mut(queue_id).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl SocketConnector for MemoryRelay {
    async fn connect(&self) -> Result<SocketHandle> {
        let (handle, driver) = SocketHandle::channel();

        let socket_id = {
            let mut state = self.state.lock().await;
            let socket_id = state.next_socket;
            state.next_socket += 1;
            state.sockets.insert(
                socket_id,
                RelaySocket {
                    room: None,
                    events: driver.events.clone(),
                    unanswered: Vec::new(),
                },
            );
            socket_id
        };

        let _ = driver.events.send(SocketEvent::Connect);
        tokio::spawn(Self::drive(self.state.clone(), socket_id, driver.commands));

        Ok(handle)
    }
}
