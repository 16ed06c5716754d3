//! Connection Controller
//!
//! One tokio task per feed owns the socket, the subscription registry (inside
//! the [`ConnectionMachine`]), the pending-call table and the heartbeat
//! monitor. Everything that mutates them happens on that task, one event at a
//! time: commands from [`FeedClient`] handles, socket events, the connect
//! timeout, the reconnect timer, heartbeat ticks and request deadlines.
//!
//! ```text
//! FeedClient ──commands──► FeedActor ──frames──► Transport
//!     ▲                      │  ▲
//!     │ status (watch)       │  └── socket events, timers
//!     └──────────────────────┘
//!                            └──► MessageDispatcher ──► handlers
//! ```
//!
//! Requests while the feed is not connected are rejected with
//! [`RequestError::NotConnected`]; subscriptions made at any time are kept in
//! the registry and replayed on the next successful open.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::codec::JsonCodec;
use super::endpoints::{FeedKind, feed_url};
use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use super::pending::{Expired, PendingCallTable, PendingKind, RequestError, RequestResult};
use super::reconnect::{BackoffConfig, BackoffPolicy};
use super::transport::TungsteniteTransport;
use crate::application::ports::{SocketConnection, SocketEvent, Transport, TransportError};
use crate::application::services::{HandlerRegistration, MessageDispatcher};
use crate::domain::connection::{
    Action, ConnectionEvent, ConnectionMachine, DisconnectReason, FeedStatus, Lifecycle,
};
use crate::domain::streaming::{CorrelationId, InboundMessage, OutboundFrame, frame_type};
use crate::domain::subscription::{ChannelKey, SubscriptionRegistry};
use crate::infrastructure::config::{AuthToken, ClientConfig, ConfigError, FeedSettings};
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by [`FeedClient`] operations other than requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The connect attempt failed. Reconnection continues unless the reason
    /// is terminal.
    #[error("connect failed: {0}")]
    ConnectFailed(DisconnectReason),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The controller task has shut down.
    #[error("feed client stopped")]
    Stopped,
}

// =============================================================================
// Configuration
// =============================================================================

/// Everything one controller needs to run.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Which feed this controller serves.
    pub feed: FeedKind,
    /// Socket URL.
    pub url: String,
    /// Timeouts, heartbeat and backoff tuning.
    pub settings: FeedSettings,
}

impl ControllerConfig {
    /// Create a configuration for an explicit URL.
    #[must_use]
    pub fn new(feed: FeedKind, url: impl Into<String>, settings: FeedSettings) -> Self {
        Self {
            feed,
            url: url.into(),
            settings,
        }
    }

    /// Derive the configuration for `feed` from the client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL cannot be mapped to a socket URL.
    pub fn from_client_config(config: &ClientConfig, feed: FeedKind) -> Result<Self, ConfigError> {
        let url = feed_url(&config.base_url, &feed)?;
        Ok(Self::new(feed, url, config.feed.clone()))
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Correlation id to use instead of a fresh UUID.
    pub id: Option<CorrelationId>,
    /// Deadline to use instead of the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Use a specific correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Use a specific deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Point-in-time view of a controller's internal state.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    /// Current status.
    pub status: FeedStatus,
    /// Live subscription registry.
    pub subscriptions: SubscriptionRegistry,
    /// Correlation ids awaiting a reply, probes included.
    pub pending: Vec<CorrelationId>,
    /// Heartbeat probes awaiting a pong.
    pub outstanding_probes: usize,
}

impl ControllerSnapshot {
    /// Check whether `id` is still pending.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.iter().any(|pending| pending == id)
    }
}

// =============================================================================
// Client Handle
// =============================================================================

type StatusCallback = Arc<dyn Fn(&FeedStatus) + Send + Sync>;

enum Command {
    Connect(oneshot::Sender<Result<(), ClientError>>),
    Disconnect(oneshot::Sender<()>),
    Request {
        frame: OutboundFrame,
        timeout: Duration,
        reply: oneshot::Sender<Result<oneshot::Receiver<RequestResult>, RequestError>>,
    },
    Subscribe(ChannelKey),
    Unsubscribe(ChannelKey),
    Snapshot(oneshot::Sender<ControllerSnapshot>),
}

/// State shared between the handles and the actor.
struct FeedShared {
    feed: FeedKind,
    dispatcher: Arc<MessageDispatcher>,
    status_tx: watch::Sender<FeedStatus>,
    status_callbacks: RwLock<Vec<StatusCallback>>,
    request_timeout: Duration,
}

/// Cloneable handle to one feed's controller.
///
/// The controller task stops when the last handle is dropped or the
/// cancellation token fires; both paths tear down like [`FeedClient::disconnect`].
#[derive(Clone)]
pub struct FeedClient {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<FeedShared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("feed", &self.shared.feed)
            .field("status", &*self.shared.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl FeedClient {
    /// Spawn a controller on the current tokio runtime.
    #[must_use]
    pub fn spawn(config: ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::spawn_with_cancel(config, transport, CancellationToken::new())
    }

    /// Spawn a controller that also stops when `cancel` fires.
    #[must_use]
    pub fn spawn_with_cancel(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(FeedStatus::default());

        let shared = Arc::new(FeedShared {
            feed: config.feed.clone(),
            dispatcher: Arc::new(MessageDispatcher::new()),
            status_tx,
            status_callbacks: RwLock::new(Vec::new()),
            request_timeout: config.settings.request_timeout,
        });

        let span = tracing::info_span!("feed", feed = config.feed.label());
        let actor = FeedActor::new(config, transport, Arc::clone(&shared), commands_rx, cancel.clone());
        tokio::spawn(actor.run().instrument(span));

        Self {
            commands: commands_tx,
            shared,
            cancel,
        }
    }

    /// Spawn a controller over a real WebSocket.
    #[must_use]
    pub fn websocket(config: ControllerConfig, auth_token: Option<AuthToken>) -> Self {
        Self::spawn(
            config,
            Arc::new(TungsteniteTransport::with_auth_token(auth_token)),
        )
    }

    /// Feed served by this controller.
    #[must_use]
    pub fn feed(&self) -> &FeedKind {
        &self.shared.feed
    }

    fn send_command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Stopped)
    }

    /// Open the socket.
    ///
    /// Resolves immediately if already connected and joins the in-flight
    /// attempt if one is running, so a second call never opens a second
    /// socket. A failed attempt still schedules reconnection.
    ///
    /// # Errors
    ///
    /// Returns an error if this attempt fails or the controller has stopped.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Connect(tx))?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Close the socket and stop reconnecting.
    ///
    /// When this returns, every pending request has been rejected and the
    /// subscription registry and handler registrations are empty.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send_command(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a correlated request with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed is not connected, the reply does not
    /// arrive in time, the server answers with an `error` frame, or the
    /// connection drops first.
    pub async fn send_request(&self, msg_type: &str, payload: Value) -> RequestResult {
        self.send_request_with(msg_type, payload, RequestOptions::default())
            .await
    }

    /// Send a correlated request with explicit options.
    ///
    /// # Errors
    ///
    /// See [`FeedClient::send_request`].
    pub async fn send_request_with(
        &self,
        msg_type: &str,
        payload: Value,
        options: RequestOptions,
    ) -> RequestResult {
        let id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let timeout = options.timeout.unwrap_or(self.shared.request_timeout);
        let frame = OutboundFrame::request(msg_type, payload, id);

        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Request {
            frame,
            timeout,
            reply: tx,
        })
        .map_err(|_| RequestError::Stopped)?;

        let started = Instant::now();
        let outcome = rx.await.map_err(|_| RequestError::Stopped)??;
        let result = outcome.await.map_err(|_| RequestError::Stopped)?;

        if result.is_ok() {
            metrics::record_request_duration(self.shared.feed.label(), started.elapsed());
        }
        result
    }

    /// Register a handler for a message type (or `"*"` for every message).
    pub fn register_handler<F>(&self, msg_type: impl Into<String>, handler: F) -> HandlerRegistration
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(msg_type, handler)
    }

    /// Add a channel key to the registry, sending the subscribe frame now if
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller has stopped.
    pub fn subscribe(&self, key: ChannelKey) -> Result<(), ClientError> {
        self.send_command(Command::Subscribe(key))
    }

    /// Remove a channel key from the registry, sending the unsubscribe frame
    /// now if connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller has stopped.
    pub fn unsubscribe(&self, key: ChannelKey) -> Result<(), ClientError> {
        self.send_command(Command::Unsubscribe(key))
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receiver notified on every status transition.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<FeedStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Register a callback fired on every status transition.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&FeedStatus) + Send + Sync + 'static,
    {
        self.shared.status_callbacks.write().push(Arc::new(callback));
    }

    /// Inspect the controller's state.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller has stopped.
    pub async fn snapshot(&self) -> Result<ControllerSnapshot, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Stop the controller task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Connect every client at once; results come back in input order.
pub async fn connect_all(clients: &[FeedClient]) -> Vec<Result<(), ClientError>> {
    futures::future::join_all(clients.iter().map(FeedClient::connect)).await
}

// =============================================================================
// Actor
// =============================================================================

type OpenOutcome = Result<Result<SocketConnection, TransportError>, tokio::time::error::Elapsed>;
type OpenFuture = Pin<Box<dyn Future<Output = OpenOutcome> + Send>>;

/// Grace period for flushing a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct FeedActor {
    label: &'static str,
    url: String,
    settings: FeedSettings,
    transport: Arc<dyn Transport>,
    shared: Arc<FeedShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    codec: JsonCodec,
    machine: ConnectionMachine,
    backoff: BackoffPolicy,
    heartbeat: HeartbeatMonitor,
    pending: PendingCallTable,
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    opening: Option<OpenFuture>,
    socket: Option<SocketConnection>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
}

impl FeedActor {
    fn new(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        shared: Arc<FeedShared>,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = config.settings;
        Self {
            label: config.feed.label(),
            url: config.url,
            machine: ConnectionMachine::new(settings.max_reconnect_attempts),
            backoff: BackoffPolicy::new(BackoffConfig::from_feed_settings(&settings)),
            heartbeat: HeartbeatMonitor::new(HeartbeatConfig::from_feed_settings(&settings)),
            settings,
            transport,
            shared,
            commands,
            cancel,
            codec: JsonCodec::new(),
            pending: PendingCallTable::new(),
            connect_waiters: Vec::new(),
            opening: None,
            socket: None,
            reconnect_timer: None,
        }
    }

    async fn run(mut self) {
        tracing::debug!(url = %self.url, "Feed controller started");
        metrics::set_connection_state(self.label, self.machine.lifecycle().status());

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                outcome = poll_open(&mut self.opening) => {
                    self.opening = None;
                    self.on_open_outcome(outcome).await;
                }
                event = next_socket_event(&mut self.socket) => self.on_socket_event(event).await,
                () = wait_timer(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.apply(ConnectionEvent::ReconnectTimerFired).await;
                }
                () = self.heartbeat.tick() => self.send_probe().await,
                expired = self.pending.next_expired() => self.on_expired(expired).await,
            }

            metrics::set_subscriptions(self.label, self.machine.registry().len());
            metrics::set_pending_calls(self.label, self.pending.len());
        }

        self.apply(ConnectionEvent::DisconnectRequested).await;
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Stopped));
        }
        tracing::debug!("Feed controller stopped");
    }

    // -------------------------------------------------------------------------
    // State machine plumbing
    // -------------------------------------------------------------------------

    /// Feed one event through the machine, then any events its actions raise.
    async fn apply(&mut self, event: ConnectionEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            tracing::trace!(?event, lifecycle = ?self.machine.lifecycle(), "Connection event");
            for action in self.machine.handle_event(event) {
                if let Some(follow_up) = self.perform(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<ConnectionEvent> {
        match action {
            Action::OpenSocket => self.start_open(),
            Action::CancelOpen => {
                if self.opening.take().is_some() {
                    tracing::debug!("In-flight open cancelled");
                }
            }
            Action::CloseSocket => self.close_socket().await,
            Action::StartHeartbeat => self.heartbeat.start(),
            Action::StopHeartbeat => self.heartbeat.stop(),
            Action::Send(frame) => {
                if let Err(e) = self.send_frame(&frame).await {
                    tracing::warn!(error = %e, msg_type = %frame.msg_type, "Failed to send frame");
                    return Some(ConnectionEvent::TransportError(e.to_string()));
                }
            }
            Action::ScheduleReconnect { attempt } => {
                let delay = self.backoff.delay(attempt);
                tracing::info!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Reconnecting to feed"
                );
                metrics::record_reconnect(self.label);
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::CancelReconnect => self.reconnect_timer = None,
            Action::FailPending(reason) => {
                let error = match reason {
                    DisconnectReason::Requested => RequestError::ConnectionClosed,
                    other => RequestError::ConnectionLost(other.to_string()),
                };
                let failed = self.pending.expire_all(&error);
                if failed > 0 {
                    tracing::debug!(failed, error = %error, "Pending calls failed");
                }
            }
            Action::ClearHandlers => self.shared.dispatcher.clear(),
            Action::Status(status) => self.publish_status(status),
            Action::ConnectSucceeded => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Action::ConnectFailed(reason) => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(ClientError::ConnectFailed(reason.clone())));
                }
            }
        }
        None
    }

    fn start_open(&mut self) {
        tracing::info!(url = %self.url, attempt = self.machine.attempts(), "Connecting to feed");

        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        let timeout = self.settings.connect_timeout;
        self.opening = Some(Box::pin(async move {
            tokio::time::timeout(timeout, transport.open(&url)).await
        }));
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take()
            && tokio::time::timeout(CLOSE_GRACE, socket.sink.close())
                .await
                .is_err()
        {
            tracing::debug!("Socket close did not complete in time");
        }
    }

    fn publish_status(&self, status: FeedStatus) {
        let changed = self.shared.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if !changed {
            return;
        }

        match &status.last_error {
            Some(reason) if status.gave_up() => {
                tracing::warn!(reason = %reason, state = %status.state, "Feed gave up reconnecting");
            }
            Some(reason) => {
                tracing::info!(reason = %reason, state = %status.state, attempt = status.attempt, "Feed status changed");
            }
            None => tracing::info!(state = %status.state, "Feed status changed"),
        }
        metrics::set_connection_state(self.label, status.state);

        let callbacks: Vec<StatusCallback> = self.shared.status_callbacks.read().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&status))).is_err() {
                tracing::error!("Status callback panicked");
            }
        }
    }

    async fn send_frame(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::Closed);
        };
        let text = self
            .codec
            .encode(frame)
            .map_err(|e| TransportError::Send(e.to_string()))?;

        socket.sink.send(text).await?;
        metrics::record_frame_sent(self.label, &frame.msg_type);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Event sources
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.connect_waiters.push(reply);
                self.apply(ConnectionEvent::ConnectRequested).await;
            }
            Command::Disconnect(reply) => {
                tracing::info!("Disconnect requested");
                self.apply(ConnectionEvent::DisconnectRequested).await;
                let _ = reply.send(());
            }
            Command::Request {
                frame,
                timeout,
                reply,
            } => {
                let outcome = self.start_request(frame, timeout).await;
                let _ = reply.send(outcome);
            }
            Command::Subscribe(key) => {
                tracing::debug!(key = %key, "Subscribe");
                self.apply(ConnectionEvent::Subscribe(key)).await;
            }
            Command::Unsubscribe(key) => {
                tracing::debug!(key = %key, "Unsubscribe");
                self.apply(ConnectionEvent::Unsubscribe(key)).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(ControllerSnapshot {
                    status: self.machine.status(),
                    subscriptions: self.machine.registry().clone(),
                    pending: self.pending.ids(),
                    outstanding_probes: self.heartbeat.outstanding(),
                });
            }
        }
    }

    async fn start_request(
        &mut self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RequestResult>, RequestError> {
        if self.machine.lifecycle() != Lifecycle::Connected || self.socket.is_none() {
            return Err(RequestError::NotConnected);
        }

        let Some(id) = frame.id.clone() else {
            return Err(RequestError::Send("request frame has no id".to_string()));
        };
        let receiver = self.pending.create(id.clone(), timeout)?;

        if let Err(e) = self.send_frame(&frame).await {
            self.pending.settle(&id, Err(RequestError::Send(e.to_string())));
            self.apply(ConnectionEvent::TransportError(e.to_string())).await;
        } else {
            tracing::debug!(id = %id, msg_type = %frame.msg_type, "Request sent");
        }
        Ok(receiver)
    }

    async fn on_open_outcome(&mut self, outcome: OpenOutcome) {
        match outcome {
            Ok(Ok(socket)) => {
                self.socket = Some(socket);
                self.apply(ConnectionEvent::Opened).await;
            }
            Ok(Err(e)) if e.is_auth_rejection() => {
                tracing::warn!(error = %e, "Feed handshake rejected");
                self.apply(ConnectionEvent::AuthRejected(e.to_string())).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Feed connection failed");
                self.apply(ConnectionEvent::OpenFailed(e.to_string())).await;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.settings.connect_timeout.as_millis(),
                    "Feed connection timed out"
                );
                self.apply(ConnectionEvent::OpenTimedOut(self.settings.connect_timeout))
                    .await;
            }
        }
    }

    async fn on_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Frame(text)) => self.on_frame(&text).await,
            Some(SocketEvent::Closed { code, reason }) => {
                tracing::info!(code, reason = %reason, "Server closed feed socket");
                self.socket = None;
                self.apply(ConnectionEvent::Closed { code, reason }).await;
            }
            Some(SocketEvent::Error(message)) => {
                tracing::warn!(error = %message, "Feed socket error");
                self.apply(ConnectionEvent::TransportError(message)).await;
            }
            None => {
                tracing::info!("Feed socket stream ended");
                self.socket = None;
                self.apply(ConnectionEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
                .await;
            }
        }
    }

    async fn on_frame(&mut self, text: &str) {
        for decoded in self.codec.decode(text) {
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed message");
                    metrics::record_protocol_error(self.label);
                    continue;
                }
            };

            metrics::record_frame_received(self.label, message.routing_key());

            if let Some(event) = self.correlate(&message) {
                self.apply(event).await;
            }
            self.shared.dispatcher.dispatch(&message);
        }
    }

    /// Settle any pending call this message answers. Returns an event when
    /// the message affects the connection itself.
    fn correlate(&mut self, message: &InboundMessage) -> Option<ConnectionEvent> {
        if message.msg_type == frame_type::PONG {
            let id = message
                .id
                .clone()
                .or_else(|| self.heartbeat.oldest_outstanding().map(str::to_string));
            if let Some(id) = id {
                self.heartbeat.acknowledge(&id);
                self.pending.settle(&id, Ok(message.clone()));
            }
            return None;
        }

        let error = message.error_payload();

        if let Some(id) = &message.id {
            let outcome = error.clone().map_or_else(
                || Ok(message.clone()),
                |e| {
                    Err(RequestError::Server {
                        code: e.code,
                        message: e.message,
                    })
                },
            );
            if self.pending.settle(id, outcome).is_some() {
                return None;
            }
        }

        match error {
            Some(e) if e.is_auth_failure() => {
                tracing::warn!(code = e.code, message = %e.message, "Server rejected credentials");
                Some(ConnectionEvent::AuthRejected(e.message))
            }
            Some(e) => {
                tracing::warn!(code = e.code, message = %e.message, "Server error frame");
                None
            }
            None => None,
        }
    }

    async fn send_probe(&mut self) {
        if self.socket.is_none() {
            return;
        }

        let id = self.heartbeat.next_probe();
        let timeout = self.heartbeat.config().pong_timeout;
        if let Err(e) = self.pending.create_probe(id.clone(), timeout) {
            tracing::debug!(error = %e, "Skipping heartbeat probe");
            self.heartbeat.acknowledge(&id);
            return;
        }

        tracing::trace!(id = %id, "Heartbeat probe");
        if let Err(e) = self.send_frame(&OutboundFrame::ping(id)).await {
            self.apply(ConnectionEvent::TransportError(e.to_string())).await;
        }
    }

    async fn on_expired(&mut self, expired: Expired) {
        match expired.kind {
            PendingKind::Probe => {
                self.heartbeat.acknowledge(&expired.id);
                tracing::warn!(
                    timeout_ms = expired.after.as_millis(),
                    "Heartbeat timed out"
                );
                metrics::record_heartbeat_lost(self.label);
                self.apply(ConnectionEvent::HeartbeatLost).await;
            }
            PendingKind::Request => {
                tracing::warn!(id = %expired.id, timeout_ms = expired.after.as_millis(), "Request timed out");
                metrics::record_request_timeout(self.label);
            }
        }
    }
}

async fn poll_open(opening: &mut Option<OpenFuture>) -> OpenOutcome {
    match opening {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_socket_event(socket: &mut Option<SocketConnection>) -> Option<SocketEvent> {
    match socket {
        Some(socket) => socket.events.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
