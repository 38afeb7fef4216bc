//! # Secure Channel
//!
//! An encrypted JSON-RPC session between two endpoints that share a
//! [`ChannelAddress`].
//!
//! Outbound messages are serialized, sealed with the channel key and sent
//! on both transports: the push path for latency and the relay queue as the
//! durable fallback. Inbound messages from either transport go through the
//! same path (decrypt, parse, classify) on a dispatcher task. Because both
//! transports may deliver the same message, recently seen request ids are
//! remembered and repeats are dropped.
//!
//! ```text
//!   send/respond/notify                         push events   queue polls
//!          │                                         │             │
//!          ▼                                         └──────┬──────┘
//!   serialize → encrypt ─┬─► NotificationClient             ▼
//!                        └─► QueuingService          decrypt → classify
//!                                                    ┌────────┼─────────┐
//!                                                 request  response  notification
//!                                                    │        │          │
//!                                                 handler  pending   subscribers
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use telepath_crypto::{ChannelAddress, ChannelCipher, ChannelId};
use telepath_transport::{
    MemoryRelay, NotificationClient, NotificationState, PushEvent, QueueId, QueuingService,
    SocketConnector, TransportError,
};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::TelepathConfig;
use crate::jsonrpc::{
    IdGenerator, InboundMessage, JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse,
};
use crate::service::RequestHandler;
use crate::ChannelError;

/// Lane carrying initiator to responder traffic.
pub const INITIATOR_LANE: &str = "red";
/// Lane carrying responder to initiator traffic.
pub const RESPONDER_LANE: &str = "blue";

/// Which side of the pairing an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    /// The application that scanned the pairing code.
    Initiator,
    /// The wallet that generated the pairing code.
    Responder,
}

impl ChannelRole {
    /// The other side.
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    fn lane(self) -> &'static str {
        match self {
            Self::Initiator => INITIATOR_LANE,
            Self::Responder => RESPONDER_LANE,
        }
    }

    /// Queue this side sends on.
    pub fn outbound_queue(self, channel: &ChannelId) -> QueueId {
        QueueId::for_channel(channel, self.lane())
    }

    /// Queue this side receives from.
    pub fn inbound_queue(self, channel: &ChannelId) -> QueueId {
        QueueId::for_channel(channel, self.peer().lane())
    }
}

/// Relay services a channel delivers through.
#[derive(Clone)]
pub struct ChannelTransports {
    /// Durable queue path.
    pub queuing: Arc<dyn QueuingService>,
    /// Push path; channels run queue-only without it.
    pub sockets: Option<Arc<dyn SocketConnector>>,
}

impl ChannelTransports {
    /// Queue-only transports.
    pub fn new(queuing: Arc<dyn QueuingService>) -> Self {
        Self {
            queuing,
            sockets: None,
        }
    }

    /// Add a push path.
    pub fn with_sockets(mut self, sockets: Arc<dyn SocketConnector>) -> Self {
        self.sockets = Some(sockets);
        self
    }

    /// Both paths served by one in-process relay.
    pub fn memory(relay: &MemoryRelay) -> Self {
        Self::new(Arc::new(relay.clone())).with_sockets(Arc::new(relay.clone()))
    }
}

impl fmt::Debug for ChannelTransports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransports")
            .field("push", &self.sockets.is_some())
            .finish_non_exhaustive()
    }
}

/// Receivers installed before a channel takes any traffic.
///
/// Requests already waiting in the relay queue are dispatched as soon as the
/// channel opens, so a wallet that must answer them passes its handler here
/// instead of calling [`SecureChannel::on_request`] afterwards.
#[derive(Clone, Default)]
pub struct ChannelHooks {
    handler: Option<Arc<dyn RequestHandler>>,
    notifications: Option<mpsc::UnboundedSender<JsonRpcRequest>>,
    errors: Option<mpsc::UnboundedSender<TransportError>>,
}

impl ChannelHooks {
    /// No handler and no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle inbound requests from the start.
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Deliver inbound notifications to `sender`.
    pub fn with_notifications(mut self, sender: mpsc::UnboundedSender<JsonRpcRequest>) -> Self {
        self.notifications = Some(sender);
        self
    }

    /// Deliver transport errors, including push setup failures, to `sender`.
    pub fn with_errors(mut self, sender: mpsc::UnboundedSender<TransportError>) -> Self {
        self.errors = Some(sender);
        self
    }
}

impl fmt::Debug for ChannelHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHooks")
            .field("handler", &self.handler.is_some())
            .field("notifications", &self.notifications.is_some())
            .field("errors", &self.errors.is_some())
            .finish()
    }
}

type Waiter = oneshot::Sender<Result<Value, ChannelError>>;

/// Forget waiters whose `PendingResponse` was dropped.
fn prune_abandoned(pending: &mut HashMap<JsonRpcId, Waiter>) {
    pending.retain(|_, waiter| !waiter.is_closed());
}

/// Bounded memory of recently dispatched request ids.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<JsonRpcId>,
    members: HashSet<JsonRpcId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `id`; false if it was already remembered.
    fn insert(&mut self, id: &JsonRpcId) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }
}

struct ChannelInner {
    address: ChannelAddress,
    app_name: String,
    role: ChannelRole,
    cipher: ChannelCipher,
    request_timeout: Option<Duration>,
    queuing: Arc<dyn QueuingService>,
    inbound_queue: QueueId,
    outbound_queue: QueueId,
    push: Mutex<Option<NotificationClient>>,
    pending: Mutex<HashMap<JsonRpcId, Waiter>>,
    seen_requests: Mutex<RecentIds>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    notification_subscribers: Mutex<Vec<mpsc::UnboundedSender<JsonRpcRequest>>>,
    error_subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportError>>>,
    ids: IdGenerator,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Seal `payload` and hand it to both transports.
    async fn transmit(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let sealed = Bytes::from(self.cipher.encrypt(payload)?);

        if let Some(push) = self.push.lock().await.as_ref() {
            if let Err(e) = push.notify(sealed.clone()) {
                debug!("Push path unavailable on {}: {}", self.address.id, e);
            }
        }

        self.queuing.send(&self.outbound_queue, sealed).await?;
        Ok(())
    }

    /// Seal `payload` for the push path, or the queue when push is
    /// unavailable.
    async fn transmit_push(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let sealed = Bytes::from(self.cipher.encrypt(payload)?);

        let pushed = match self.push.lock().await.as_ref() {
            Some(push) if push.state() != NotificationState::Failed => {
                push.notify(sealed.clone()).is_ok()
            }
            _ => false,
        };
        if !pushed {
            self.queuing.send(&self.outbound_queue, sealed).await?;
        }
        Ok(())
    }

    async fn receive(self: &Arc<Self>, sealed: &[u8]) {
        if self.is_closed() {
            return;
        }

        let plaintext = match self.cipher.decrypt(sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Dropping message on {}: {}", self.address.id, e);
                return;
            }
        };

        match InboundMessage::parse(&plaintext) {
            InboundMessage::Request(request) => self.dispatch_request(request).await,
            InboundMessage::Notification(notification) => self.publish(notification).await,
            InboundMessage::Response(response) => self.resolve(response).await,
            InboundMessage::Malformed(reason) => {
                warn!("Dropping malformed message on {}: {}", self.address.id, reason);
            }
        }
    }

    async fn dispatch_request(self: &Arc<Self>, request: JsonRpcRequest) {
        if !self.seen_requests.lock().await.insert(&request.id) {
            debug!("Ignoring duplicate request {} on {}", request.id, self.address.id);
            return;
        }

        let handler = self.handler.read().await.clone();
        let channel = SecureChannel {
            inner: Arc::clone(self),
        };
        tokio::spawn(async move {
            match handler {
                Some(handler) => handler.on_request(request, &channel).await,
                None => {
                    let error = JsonRpcError::method_not_found(&request.method);
                    if let Err(e) = channel.respond(request.id, Err(error)).await {
                        warn!("Could not reject {} on {}: {}", request.method, channel.id(), e);
                    }
                }
            }
        });
    }

    async fn publish(&self, notification: JsonRpcRequest) {
        let mut subscribers = self.notification_subscribers.lock().await;
        subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("No subscriber for notification {}", notification.method);
        }
    }

    async fn resolve(&self, response: JsonRpcResponse) {
        match self.pending.lock().await.remove(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(response.outcome.map_err(ChannelError::Rpc));
            }
            None => debug!(
                "Discarding response {} on {}: no pending request",
                response.id, self.address.id
            ),
        }
    }

    async fn report(&self, error: TransportError) {
        warn!("Transport error on {}: {}", self.address.id, error);
        let mut subscribers = self.error_subscribers.lock().await;
        subscribers.retain(|subscriber| subscriber.send(error.clone()).is_ok());
    }

    /// Dequeue and process everything waiting in the inbound queue.
    async fn drain(self: &Arc<Self>) -> Result<usize, ChannelError> {
        let mut processed = 0;
        while let Some(sealed) = self.queuing.receive(&self.inbound_queue).await? {
            self.receive(&sealed).await;
            processed += 1;
        }
        Ok(processed)
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}

/// Feeds inbound traffic from both transports into the channel.
async fn run_dispatcher(
    channel: Weak<ChannelInner>,
    mut push_events: mpsc::UnboundedReceiver<PushEvent>,
    poll_interval: Option<Duration>,
) {
    let mut ticker = poll_interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    let mut push_open = true;
    loop {
        if !push_open && ticker.is_none() {
            break;
        }
        tokio::select! {
            event = push_events.recv(), if push_open => {
                let Some(event) = event else {
                    push_open = false;
                    continue;
                };
                let Some(inner) = channel.upgrade() else { break };
                match event {
                    PushEvent::Notification(sealed) => inner.receive(&sealed).await,
                    PushEvent::Error(error) => inner.report(error).await,
                }
            }
            _ = next_tick(&mut ticker) => {
                let Some(inner) = channel.upgrade() else { break };
                if let Err(e) = inner.drain().await {
                    warn!("Polling {} failed: {}", inner.inbound_queue, e);
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves to the response of one outbound request.
///
/// Dropping it abandons the request; a late response is discarded.
#[must_use = "the response is only observed by awaiting `response()`"]
pub struct PendingResponse {
    id: JsonRpcId,
    receiver: oneshot::Receiver<Result<Value, ChannelError>>,
    timeout: Option<Duration>,
    channel: Weak<ChannelInner>,
}

impl PendingResponse {
    /// Id the request was sent with.
    pub fn id(&self) -> &JsonRpcId {
        &self.id
    }

    /// Wait for the correlated response.
    ///
    /// When the timeout expires first the request is forgotten and a late
    /// response is discarded.
    pub async fn response(self) -> Result<Value, ChannelError> {
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    if let Some(inner) = self.channel.upgrade() {
                        inner.pending.lock().await.remove(&self.id);
                    }
                    return Err(ChannelError::Timeout);
                }
            },
            None => self.receiver.await,
        };
        received.unwrap_or(Err(ChannelError::ChannelClosed))
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// An open, encrypted JSON-RPC session.
///
/// Cheap to clone; all clones share the session. Dropping the last clone
/// tears the session down.
#[derive(Clone)]
pub struct SecureChannel {
    inner: Arc<ChannelInner>,
}

impl SecureChannel {
    /// Open a channel on `address` as `role`.
    ///
    /// A push path that cannot be established is reported on
    /// [`subscribe_errors`](Self::subscribe_errors) receivers; the channel
    /// keeps working over the queue.
    pub async fn open(
        address: ChannelAddress,
        app_name: impl Into<String>,
        role: ChannelRole,
        transports: ChannelTransports,
        config: &TelepathConfig,
    ) -> Result<Self, ChannelError> {
        Self::open_with(address, app_name, role, transports, config, ChannelHooks::new()).await
    }

    /// Open a channel with its handler and subscribers already installed.
    pub async fn open_with(
        address: ChannelAddress,
        app_name: impl Into<String>,
        role: ChannelRole,
        transports: ChannelTransports,
        config: &TelepathConfig,
        hooks: ChannelHooks,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let cipher = ChannelCipher::new(&address.key)?;
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let push = match &transports.sockets {
            Some(sockets) => {
                match NotificationClient::start(
                    sockets.as_ref(),
                    address.id.clone(),
                    config.notification_config(),
                    push_tx.clone(),
                )
                .await
                {
                    Ok((client, completion)) => {
                        let errors = push_tx.clone();
                        tokio::spawn(async move {
                            if let Ok(Err(e)) = completion.await {
                                if e != TransportError::Closed {
                                    let _ = errors.send(PushEvent::Error(e));
                                }
                            }
                        });
                        Some(client)
                    }
                    Err(e) => {
                        warn!("Push path for {} unavailable: {}", address.id, e);
                        None
                    }
                }
            }
            None => None,
        };
        drop(push_tx);

        let inner = Arc::new(ChannelInner {
            inbound_queue: role.inbound_queue(&address.id),
            outbound_queue: role.outbound_queue(&address.id),
            address,
            app_name: app_name.into(),
            role,
            cipher,
            request_timeout: config.request_timeout,
            queuing: transports.queuing,
            push: Mutex::new(push),
            pending: Mutex::new(HashMap::new()),
            seen_requests: Mutex::new(RecentIds::new(config.dedup_window)),
            handler: RwLock::new(hooks.handler),
            notification_subscribers: Mutex::new(hooks.notifications.into_iter().collect()),
            error_subscribers: Mutex::new(hooks.errors.into_iter().collect()),
            ids: IdGenerator::new(),
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::downgrade(&inner),
            push_rx,
            config.poll_interval,
        ));
        *inner.dispatcher.lock().await = Some(dispatcher);

        info!(
            "Opened channel {} for {} as {:?}",
            inner.address.id, inner.app_name, inner.role
        );
        Ok(Self { inner })
    }

    /// Channel identifier.
    pub fn id(&self) -> &ChannelId {
        &self.inner.address.id
    }

    /// Address the channel was opened on.
    pub fn address(&self) -> &ChannelAddress {
        &self.inner.address
    }

    /// Name of the application this channel belongs to.
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// Side of the pairing this endpoint is.
    pub fn role(&self) -> ChannelRole {
        self.inner.role
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Push path state, if the channel has one.
    pub async fn push_state(&self) -> Option<NotificationState> {
        self.inner.push.lock().await.as_ref().map(NotificationClient::state)
    }

    /// Number of requests waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        let mut pending = self.inner.pending.lock().await;
        prune_abandoned(&mut pending);
        pending.len()
    }

    /// Install the handler for inbound requests, replacing any previous one.
    ///
    /// Requests dispatched before this call were answered with
    /// `method not found`; use [`open_with`](Self::open_with) to handle
    /// queued requests.
    pub async fn on_request(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.handler.write().await = Some(handler);
    }

    /// Receive inbound notifications.
    pub async fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<JsonRpcRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.notification_subscribers.lock().await.push(tx);
        rx
    }

    /// Receive transport errors the channel recovered from.
    pub async fn subscribe_errors(&self) -> mpsc::UnboundedReceiver<TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.error_subscribers.lock().await.push(tx);
        rx
    }

    /// Send a request with the configured timeout.
    ///
    /// A request without an id is given a fresh one.
    pub async fn send(&self, request: JsonRpcRequest) -> Result<PendingResponse, ChannelError> {
        self.send_with_timeout(request, self.inner.request_timeout)
            .await
    }

    /// Send a request, overriding the configured timeout.
    pub async fn send_with_timeout(
        &self,
        mut request: JsonRpcRequest,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        if request.id.is_none() {
            request.id = self.inner.ids.next_id();
        }
        let id = request.id.clone();
        let payload =
            serde_json::to_vec(&request).map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let (waiter, receiver) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            // close() drains under this lock after setting the flag
            if self.is_closed() {
                return Err(ChannelError::ChannelClosed);
            }
            prune_abandoned(&mut pending);
            if pending.contains_key(&id) {
                return Err(ChannelError::DuplicateRequestId(id));
            }
            pending.insert(id.clone(), waiter);
        }

        if let Err(e) = self.inner.transmit(&payload).await {
            self.inner.pending.lock().await.remove(&id);
            warn!("Sending {} on {} failed: {}", request.method, self.id(), e);
            return Err(e);
        }

        debug!("Sent request {} ({}) on {}", id, request.method, self.id());
        Ok(PendingResponse {
            id,
            receiver,
            timeout,
            channel: Arc::downgrade(&self.inner),
        })
    }

    /// Call `method` and wait for its result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ChannelError> {
        self.send(JsonRpcRequest::new(method, params))
            .await?
            .response()
            .await
    }

    /// Answer an inbound request.
    pub async fn respond(
        &self,
        id: JsonRpcId,
        outcome: Result<Value, JsonRpcError>,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let response = JsonRpcResponse { id, outcome };
        let payload = serde_json::to_vec(&response)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        self.inner.transmit(&payload).await
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let notification = JsonRpcRequest::new(method, params);
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        self.inner.transmit_push(&payload).await
    }

    /// Drain the inbound queue once; returns the number of messages taken.
    pub async fn poll(&self) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        self.inner.drain().await
    }

    /// Close the channel.
    ///
    /// Every pending request fails with [`ChannelError::ChannelClosed`] and
    /// the push connection is shut down. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let waiters: Vec<Waiter> = self
            .inner
            .pending
            .lock()
            .await
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(ChannelError::ChannelClosed));
        }

        if let Some(push) = self.inner.push.lock().await.take() {
            push.close().await;
        }
        if let Some(task) = self.inner.dispatcher.lock().await.take() {
            task.abort();
        }
        *self.inner.handler.write().await = None;
        self.inner.notification_subscribers.lock().await.clear();
        self.inner.error_subscribers.lock().await.clear();

        info!(
            "Closed channel {} ({} pending requests rejected)",
            self.id(),
            rejected
        );
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("id", self.id())
            .field("app_name", &self.inner.app_name)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
