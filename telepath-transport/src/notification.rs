//! # Notification Client
//!
//! Push delivery over the relay socket. The client joins the channel's room
//! with an `identify` handshake and then exchanges base64url encoded
//! `notification` events.
//!
//! ```text
//!                 connect                 ack / timeout
//! Disconnected ───────────▶ Identifying ─────────────────▶ Ready
//!      ▲                        │                            │
//!      │                        │ "NO ACK"                   │
//!      │                        ▼                            │
//!      │                      Failed                         │
//!      └──────────────────── disconnect ◀────────────────────┘
//! ```
//!
//! Notifications sent before the client is `Ready` are buffered and flushed in
//! order once the handshake completes. All state lives in a spawned actor;
//! [`NotificationClient`] is only a handle to it.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use telepath_crypto::{base64url_decode, base64url_encode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::socket::{
    SocketCommand, SocketConnector, SocketEvent, SocketHandle, IDENTIFY_EVENT, NOTIFICATION_EVENT,
    NO_ACK,
};
use crate::{ChannelId, Result, TransportError};

/// How long the relay gets to acknowledge `identify`.
pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the notification client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Acknowledgement wait for the identify handshake.
    pub identify_timeout: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            identify_timeout: IDENTIFY_TIMEOUT,
        }
    }
}

/// Lifecycle of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationState {
    /// No socket connection.
    Disconnected,
    /// Connected, waiting for the identify acknowledgement.
    Identifying,
    /// Joined the channel room; notifications flow immediately.
    Ready,
    /// The relay refused the identify handshake.
    Failed,
    /// The client was closed.
    Closed,
}

/// Something the push path delivers to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// A decoded notification payload.
    Notification(Bytes),
    /// A non-fatal transport problem.
    Error(TransportError),
}

/// Resolves once the identify handshake has succeeded or failed.
pub type SetupCompletion = oneshot::Receiver<Result<()>>;

enum Command {
    Notify(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentifyOutcome {
    Acknowledged,
    Refused,
    TimedOut,
    Abandoned,
}

/// Handle to a running notification client.
///
/// Dropping the handle closes the socket.
pub struct NotificationClient {
    channel_id: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<NotificationState>,
    task: Option<JoinHandle<()>>,
}

impl NotificationClient {
    /// Connect through `connector` and start the client for `channel_id`.
    ///
    /// Inbound notifications and late errors are delivered on `events`.
    pub async fn start(
        connector: &dyn SocketConnector,
        channel_id: ChannelId,
        config: NotificationConfig,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Result<(Self, SetupCompletion)> {
        let socket = connector.connect().await?;
        Ok(Self::spawn(socket, channel_id, config, events))
    }

    /// Start the client on an already opened socket.
    pub fn spawn(
        socket: SocketHandle,
        channel_id: ChannelId,
        config: NotificationConfig,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> (Self, SetupCompletion) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NotificationState::Disconnected);
        let (completion_tx, completion_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let actor = PushActor {
            channel_id: channel_id.clone(),
            config,
            socket_commands: socket.commands,
            socket_events: socket.events,
            commands: command_rx,
            events,
            state: state_tx,
            completion: Some(completion_tx),
            pending: VecDeque::new(),
            setup_complete: false,
            ack_tx,
            ack_rx,
            identify_round: 0,
            identify_task: None,
        };
        let task = tokio::spawn(actor.run());

        let client = Self {
            channel_id,
            commands: command_tx,
            state: state_rx,
            task: Some(task),
        };
        (client, completion_rx)
    }

    /// Push a payload to the other endpoint.
    ///
    /// Buffered until the identify handshake completes.
    pub fn notify(&self, data: Bytes) -> Result<()> {
        self.commands
            .send(Command::Notify(data))
            .map_err(|_| TransportError::Closed)
    }

    /// Current connection state.
    pub fn state(&self) -> NotificationState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<NotificationState> {
        self.state.clone()
    }

    /// Channel this client identified for.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Close the socket and wait for the client to stop.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

struct PushActor {
    channel_id: ChannelId,
    config: NotificationConfig,
    socket_commands: mpsc::UnboundedSender<SocketCommand>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<PushEvent>,
    state: watch::Sender<NotificationState>,
    completion: Option<oneshot::Sender<Result<()>>>,
    pending: VecDeque<String>,
    setup_complete: bool,
    ack_tx: mpsc::UnboundedSender<(u64, IdentifyOutcome)>,
    ack_rx: mpsc::UnboundedReceiver<(u64, IdentifyOutcome)>,
    identify_round: u64,
    identify_task: Option<JoinHandle<()>>,
}

impl PushActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Notify(data)) => self.notify(&data),
                    Some(Command::Close) | None => break,
                },
                event = self.socket_events.recv() => match event {
                    Some(event) => self.on_socket_event(event),
                    None => {
                        tracing::debug!("Socket for {} went away", self.channel_id);
                        break;
                    }
                },
                Some((round, outcome)) = self.ack_rx.recv() => self.on_identify(round, outcome),
            }
        }
        self.shutdown();
    }

    fn set_state(&self, state: NotificationState) {
        self.state.send_replace(state);
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connect => self.identify(),
            SocketEvent::Notification(encoded) => match base64url_decode(&encoded) {
                Some(message) => {
                    let _ = self.events.send(PushEvent::Notification(Bytes::from(message)));
                }
                None => tracing::warn!("Dropping notification with invalid base64url payload"),
            },
            SocketEvent::Error(message) => {
                let error = TransportError::Socket(message);
                match self.completion.take().filter(|_| !self.setup_complete) {
                    Some(completion) => {
                        tracing::warn!("Notification setup for {} failed: {}", self.channel_id, error);
                        self.set_state(NotificationState::Failed);
                        let _ = completion.send(Err(error));
                    }
                    None => {
                        let _ = self.events.send(PushEvent::Error(error));
                    }
                }
            }
            SocketEvent::ServerError(message) => {
                let _ = self
                    .events
                    .send(PushEvent::Error(TransportError::ServerError(message)));
            }
            SocketEvent::Disconnect => {
                tracing::info!("Notification socket for {} disconnected", self.channel_id);
                self.abort_identify();
                self.setup_complete = false;
                self.set_state(NotificationState::Disconnected);
            }
        }
    }

    fn identify(&mut self) {
        self.abort_identify();
        self.identify_round += 1;
        self.set_state(NotificationState::Identifying);

        let (ack_tx, ack_rx) = oneshot::channel();
        let command = SocketCommand::EmitWithAck {
            event: IDENTIFY_EVENT.into(),
            payload: self.channel_id.to_string(),
            ack: ack_tx,
        };
        if self.socket_commands.send(command).is_err() {
            tracing::warn!("Socket closed before identify for {}", self.channel_id);
            return;
        }

        let round = self.identify_round;
        let timeout = self.config.identify_timeout;
        let outcomes = self.ack_tx.clone();
        self.identify_task = Some(tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, ack_rx).await {
                Ok(Ok(items)) if items.first().and_then(Value::as_str) == Some(NO_ACK) => {
                    IdentifyOutcome::Refused
                }
                Ok(Ok(_)) => IdentifyOutcome::Acknowledged,
                Ok(Err(_)) => IdentifyOutcome::Abandoned,
                Err(_) => IdentifyOutcome::TimedOut,
            };
            let _ = outcomes.send((round, outcome));
        }));
    }

    fn on_identify(&mut self, round: u64, outcome: IdentifyOutcome) {
        if round != self.identify_round || *self.state.borrow() != NotificationState::Identifying {
            return;
        }
        self.identify_task = None;

        match outcome {
            IdentifyOutcome::Acknowledged | IdentifyOutcome::TimedOut => {
                if outcome == IdentifyOutcome::TimedOut {
                    tracing::warn!(
                        "No identify acknowledgement for {} within {:?}, continuing",
                        self.channel_id,
                        self.config.identify_timeout
                    );
                }
                self.flush_pending();
                self.setup_complete = true;
                self.set_state(NotificationState::Ready);
                tracing::info!("Notification channel {} ready", self.channel_id);
                if let Some(completion) = self.completion.take() {
                    let _ = completion.send(Ok(()));
                }
            }
            IdentifyOutcome::Refused | IdentifyOutcome::Abandoned => {
                tracing::warn!("Relay refused identify for {}", self.channel_id);
                self.set_state(NotificationState::Failed);
                match self.completion.take() {
                    Some(completion) => {
                        let _ = completion.send(Err(TransportError::SetupFailed));
                    }
                    None => {
                        let _ = self.events.send(PushEvent::Error(TransportError::SetupFailed));
                    }
                }
            }
        }
    }

    fn notify(&mut self, data: &[u8]) {
        if *self.state.borrow() == NotificationState::Failed {
            tracing::debug!("Push path for {} failed, notification dropped", self.channel_id);
            return;
        }
        let encoded = base64url_encode(data);
        if self.setup_complete {
            self.emit(encoded);
        } else {
            self.pending.push_back(encoded);
        }
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(
                "Flushing {} pending notifications for {}",
                self.pending.len(),
                self.channel_id
            );
        }
        while let Some(encoded) = self.pending.pop_front() {
            self.emit(encoded);
        }
    }

    fn emit(&self, payload: String) {
        let command = SocketCommand::Emit {
            event: NOTIFICATION_EVENT.into(),
            payload,
        };
        if self.socket_commands.send(command).is_err() {
            tracing::debug!("Socket closed, notification for {} lost", self.channel_id);
        }
    }

    fn abort_identify(&mut self) {
        if let Some(task) = self.identify_task.take() {
            task.abort();
        }
    }

    fn shutdown(mut self) {
        self.abort_identify();
        let _ = self.socket_commands.send(SocketCommand::Disconnect);
        self.set_state(NotificationState::Closed);
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Err(TransportError::Closed));
        }
        tracing::debug!("Notification client for {} closed", self.channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketDriver;
    use serde_json::json;

    struct Harness {
        client: NotificationClient,
        completion: SetupCompletion,
        driver: SocketDriver,
        events: mpsc::UnboundedReceiver<PushEvent>,
    }

    fn start() -> Harness {
        let (socket, driver) = SocketHandle::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (client, completion) = NotificationClient::spawn(
            socket,
            ChannelId::new("channel-1"),
            NotificationConfig::default(),
            events_tx,
        );
        Harness {
            client,
            completion,
            driver,
            events,
        }
    }

    /// Connect the socket and return the identify acknowledgement sender.
    async fn connect(driver: &mut SocketDriver) -> oneshot::Sender<Vec<Value>> {
        driver.events.send(SocketEvent::Connect).unwrap();
        match driver.commands.recv().await {
            Some(SocketCommand::EmitWithAck { event, payload, ack }) => {
                assert_eq!(event, IDENTIFY_EVENT);
                assert_eq!(payload, "channel-1");
                ack
            }
            other => panic!("expected identify, got {other:?}"),
        }
    }

    async fn next_emitted(driver: &mut SocketDriver) -> String {
        match driver.commands.recv().await {
            Some(SocketCommand::Emit { event, payload }) => {
                assert_eq!(event, NOTIFICATION_EVENT);
                payload
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buffered_notifications_flushed_in_order() {
        let mut h = start();
        assert_eq!(h.client.state(), NotificationState::Disconnected);

        for data in ["a", "b", "c"] {
            h.client.notify(Bytes::from_static(data.as_bytes())).unwrap();
        }

        let ack = connect(&mut h.driver).await;
        ack.send(vec![]).unwrap();

        assert_eq!(h.completion.await.unwrap(), Ok(()));
        assert_eq!(h.client.state(), NotificationState::Ready);

        let mut delivered = Vec::new();
        for _ in 0..3 {
            let payload = next_emitted(&mut h.driver).await;
            delivered.push(base64url_decode(&payload).unwrap());
        }
        assert_eq!(delivered, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_notify_after_ready_is_immediate() {
        let mut h = start();
        let ack = connect(&mut h.driver).await;
        ack.send(vec![json!("ok")]).unwrap();
        h.completion.await.unwrap().unwrap();

        h.client.notify(Bytes::from_static(&[0xfb, 0xff])).unwrap();
        assert_eq!(next_emitted(&mut h.driver).await, "-_8");
    }

    #[tokio::test]
    async fn test_no_ack_fails_setup() {
        let mut h = start();
        h.client.notify(Bytes::from_static(b"held")).unwrap();

        let ack = connect(&mut h.driver).await;
        ack.send(vec![json!(NO_ACK)]).unwrap();

        assert_eq!(h.completion.await.unwrap(), Err(TransportError::SetupFailed));
        assert_eq!(h.client.state(), NotificationState::Failed);

        // Held and later payloads never reach the socket.
        h.client.notify(Bytes::from_static(b"dropped")).unwrap();
        h.client.close().await;
        assert!(matches!(
            h.driver.commands.recv().await,
            Some(SocketCommand::Disconnect)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_timeout_reaches_ready() {
        let mut h = start();
        h.client.notify(Bytes::from_static(b"late")).unwrap();

        let _ack = connect(&mut h.driver).await;

        assert_eq!(h.completion.await.unwrap(), Ok(()));
        assert_eq!(h.client.state(), NotificationState::Ready);
        assert_eq!(next_emitted(&mut h.driver).await, base64url_encode(b"late"));
    }

    #[tokio::test]
    async fn test_socket_error_before_setup_fails_completion() {
        let h = start();
        h.driver
            .events
            .send(SocketEvent::Error("connection refused".into()))
            .unwrap();

        assert_eq!(
            h.completion.await.unwrap(),
            Err(TransportError::Socket("connection refused".into()))
        );
    }

    #[tokio::test]
    async fn test_errors_after_setup_reach_error_handler() {
        let mut h = start();
        let ack = connect(&mut h.driver).await;
        ack.send(vec![]).unwrap();
        h.completion.await.unwrap().unwrap();

        h.driver.events.send(SocketEvent::Error("glitch".into())).unwrap();
        h.driver
            .events
            .send(SocketEvent::ServerError("queue full".into()))
            .unwrap();

        assert_eq!(
            h.events.recv().await,
            Some(PushEvent::Error(TransportError::Socket("glitch".into())))
        );
        assert_eq!(
            h.events.recv().await,
            Some(PushEvent::Error(TransportError::ServerError("queue full".into())))
        );
        assert_eq!(h.client.state(), NotificationState::Ready);
    }

    #[tokio::test]
    async fn test_inbound_notifications_are_decoded() {
        let mut h = start();
        h.driver
            .events
            .send(SocketEvent::Notification("not base64!".into()))
            .unwrap();
        h.driver
            .events
            .send(SocketEvent::Notification(base64url_encode(b"hello")))
            .unwrap();

        assert_eq!(
            h.events.recv().await,
            Some(PushEvent::Notification(Bytes::from_static(b"hello")))
        );
    }

    #[tokio::test]
    async fn test_reconnect_identifies_again() {
        let mut h = start();
        let ack = connect(&mut h.driver).await;
        ack.send(vec![]).unwrap();
        h.completion.await.unwrap().unwrap();

        h.driver.events.send(SocketEvent::Disconnect).unwrap();
        let mut state = h.client.watch_state();
        state
            .wait_for(|s| *s == NotificationState::Disconnected)
            .await
            .unwrap();

        h.client.notify(Bytes::from_static(b"queued")).unwrap();
        let ack = connect(&mut h.driver).await;
        ack.send(vec![]).unwrap();

        assert_eq!(next_emitted(&mut h.driver).await, base64url_encode(b"queued"));
    }

    #[tokio::test]
    async fn test_close_disconnects_and_rejects_setup() {
        let mut h = start();
        let mut state = h.client.watch_state();
        h.client.close().await;

        assert_eq!(h.completion.await.unwrap(), Err(TransportError::Closed));
        assert!(matches!(
            h.driver.commands.recv().await,
            Some(SocketCommand::Disconnect)
        ));
        assert_eq!(*state.borrow_and_update(), NotificationState::Closed);
        assert!(h.events.recv().await.is_none());
    }
}
