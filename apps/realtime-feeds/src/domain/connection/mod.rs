//! Connection Lifecycle State Machine
//!
//! The reconnection logic of a feed, with no sockets or timers attached.
//! Every input (a caller request, a socket event, a timer firing) is a
//! [`ConnectionEvent`] fed to [`ConnectionMachine::handle_event`], which
//! mutates the lifecycle and returns the [`Action`]s the runtime must
//! perform, in order.
//!
//! ```text
//! Idle ──connect──► Connecting ──opened──► Connected
//!   ▲                  │  ▲                    │
//!   │          failure │  │ timer        close / error / heartbeat lost
//!   │                  ▼  │                    │
//!   │            ReconnectScheduled ◄──────────┘
//!   │                  │
//!   │     attempts > max, or auth rejected
//!   │                  ▼
//!   └── disconnect ── GaveUp
//! ```
//!
//! The machine owns the [`SubscriptionRegistry`] so that a replay after
//! reconnect always reflects the live set at the moment the socket opens.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::domain::streaming::OutboundFrame;
use crate::domain::subscription::{ChannelGroup, ChannelKey, SubscriptionRegistry};

/// Close codes the server uses to signal rejected credentials.
pub const AUTH_CLOSE_CODES: [u16; 5] = [1008, 4001, 4003, 4401, 4403];

/// Check whether a close code signals an authentication failure.
#[must_use]
pub fn is_auth_close(code: u16) -> bool {
    AUTH_CLOSE_CODES.contains(&code)
}

// =============================================================================
// States
// =============================================================================

/// Connectivity as observed by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No socket is open.
    Disconnected,
    /// A socket open is in flight.
    Connecting,
    /// The socket is open.
    Connected,
}

impl ConnectionStatus {
    /// Get the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Never connected, or explicitly disconnected.
    #[default]
    Idle,
    /// Waiting for the socket to open.
    Connecting,
    /// Socket open, heartbeat running.
    Connected,
    /// Waiting for the backoff delay before the next attempt.
    ReconnectScheduled,
    /// Stopped retrying; only an explicit connect restarts.
    GaveUp,
}

impl Lifecycle {
    /// Map the lifecycle onto the externally visible status.
    #[must_use]
    pub const fn status(self) -> ConnectionStatus {
        match self {
            Self::Idle | Self::ReconnectScheduled | Self::GaveUp => ConnectionStatus::Disconnected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
        }
    }
}

/// Why a connection ended or an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The caller asked to disconnect.
    Requested,
    /// The server closed the socket.
    Closed {
        /// Close code, if the server sent one.
        code: Option<u16>,
        /// Close reason text.
        reason: String,
    },
    /// Socket-level error.
    TransportError {
        /// Error detail.
        message: String,
    },
    /// No pong arrived within the heartbeat timeout.
    HeartbeatLost,
    /// The socket could not be opened.
    OpenFailed {
        /// Error detail.
        message: String,
    },
    /// The socket did not open within the connect timeout.
    OpenTimedOut {
        /// Configured connect timeout.
        after: Duration,
    },
    /// The server rejected the credentials.
    AuthRejected {
        /// Server-supplied detail.
        message: String,
    },
    /// Reconnect attempts exceeded the configured maximum.
    MaxAttemptsExceeded {
        /// Configured maximum.
        attempts: u32,
    },
}

impl DisconnectReason {
    /// Check whether this reason stops automatic reconnection.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Requested | Self::AuthRejected { .. } | Self::MaxAttemptsExceeded { .. }
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnect requested"),
            Self::Closed {
                code: Some(code),
                reason,
            } if !reason.is_empty() => write!(f, "closed by server ({code}: {reason})"),
            Self::Closed {
                code: Some(code), ..
            } => write!(f, "closed by server ({code})"),
            Self::Closed { .. } => write!(f, "closed by server"),
            Self::TransportError { message } => write!(f, "transport error: {message}"),
            Self::HeartbeatLost => write!(f, "heartbeat lost"),
            Self::OpenFailed { message } => write!(f, "open failed: {message}"),
            Self::OpenTimedOut { after } => {
                write!(f, "open timed out after {}ms", after.as_millis())
            }
            Self::AuthRejected { message } => write!(f, "authentication rejected: {message}"),
            Self::MaxAttemptsExceeded { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

/// Snapshot published on every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStatus {
    /// Externally visible connectivity.
    pub state: ConnectionStatus,
    /// Internal lifecycle stage.
    pub lifecycle: Lifecycle,
    /// Reconnect attempt counter.
    pub attempt: u32,
    /// Most recent failure, cleared on a successful open.
    pub last_error: Option<DisconnectReason>,
}

impl FeedStatus {
    /// Check whether the controller has stopped retrying.
    #[must_use]
    pub const fn gave_up(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::GaveUp)
    }
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self {
            state: ConnectionStatus::Disconnected,
            lifecycle: Lifecycle::Idle,
            attempt: 0,
            last_error: None,
        }
    }
}

// =============================================================================
// Events and Actions
// =============================================================================

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked to connect.
    ConnectRequested,
    /// Caller asked to disconnect.
    DisconnectRequested,
    /// The socket opened.
    Opened,
    /// The socket failed to open.
    OpenFailed(String),
    /// The connect timeout elapsed before the socket opened.
    OpenTimedOut(Duration),
    /// The server closed the socket.
    Closed {
        /// Close code.
        code: Option<u16>,
        /// Close reason text.
        reason: String,
    },
    /// Socket-level error while connected.
    TransportError(String),
    /// A heartbeat probe went unanswered.
    HeartbeatLost,
    /// The server signalled invalid credentials in-band.
    AuthRejected(String),
    /// The backoff delay elapsed.
    ReconnectTimerFired,
    /// Caller subscribed to a channel key.
    Subscribe(ChannelKey),
    /// Caller unsubscribed from a channel key.
    Unsubscribe(ChannelKey),
}

/// Side effects the runtime must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Start opening a socket.
    OpenSocket,
    /// Abandon the in-flight open.
    CancelOpen,
    /// Close the open socket.
    CloseSocket,
    /// Start the heartbeat monitor.
    StartHeartbeat,
    /// Stop the heartbeat monitor.
    StopHeartbeat,
    /// Send a frame on the open socket.
    Send(OutboundFrame),
    /// Arm the reconnect timer for the given zero-based attempt.
    ScheduleReconnect {
        /// Attempt index fed to the backoff policy.
        attempt: u32,
    },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Reject every pending call.
    FailPending(DisconnectReason),
    /// Drop every message handler registration.
    ClearHandlers,
    /// Publish a status snapshot.
    Status(FeedStatus),
    /// Resolve outstanding connect waiters successfully.
    ConnectSucceeded,
    /// Resolve outstanding connect waiters with a failure.
    ConnectFailed(DisconnectReason),
}

// =============================================================================
// Machine
// =============================================================================

/// Reconnection state machine for one feed.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    lifecycle: Lifecycle,
    attempts: u32,
    max_attempts: u32,
    registry: SubscriptionRegistry,
    last_error: Option<DisconnectReason>,
}

impl ConnectionMachine {
    /// Create an idle machine. `max_attempts` of zero retries forever.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            lifecycle: Lifecycle::Idle,
            attempts: 0,
            max_attempts,
            registry: SubscriptionRegistry::new(),
            last_error: None,
        }
    }

    /// Current lifecycle stage.
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Current reconnect attempt counter.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Live subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self.lifecycle.status(),
            lifecycle: self.lifecycle,
            attempt: self.attempts,
            last_error: self.last_error.clone(),
        }
    }

    /// Apply one event and return the resulting actions.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> Vec<Action> {
        match event {
            ConnectionEvent::ConnectRequested => self.on_connect_requested(),
            ConnectionEvent::DisconnectRequested => self.on_disconnect_requested(),
            ConnectionEvent::Opened => self.on_opened(),
            ConnectionEvent::OpenFailed(message) => {
                self.on_open_failure(DisconnectReason::OpenFailed { message })
            }
            ConnectionEvent::OpenTimedOut(after) => {
                self.on_open_failure(DisconnectReason::OpenTimedOut { after })
            }
            ConnectionEvent::Closed { code, reason } => match code {
                Some(code) if is_auth_close(code) => self.on_auth_rejected(if reason.is_empty() {
                    format!("close code {code}")
                } else {
                    reason
                }),
                _ => self.on_connection_lost(DisconnectReason::Closed { code, reason }, false),
            },
            ConnectionEvent::TransportError(message) => {
                self.on_connection_lost(DisconnectReason::TransportError { message }, true)
            }
            ConnectionEvent::HeartbeatLost => {
                self.on_connection_lost(DisconnectReason::HeartbeatLost, true)
            }
            ConnectionEvent::AuthRejected(message) => self.on_auth_rejected(message),
            ConnectionEvent::ReconnectTimerFired => self.on_reconnect_timer(),
            ConnectionEvent::Subscribe(key) => self.on_subscribe(&key),
            ConnectionEvent::Unsubscribe(key) => self.on_unsubscribe(&key),
        }
    }

    fn on_connect_requested(&mut self) -> Vec<Action> {
        match self.lifecycle {
            Lifecycle::Connecting => Vec::new(),
            Lifecycle::Connected => vec![Action::ConnectSucceeded],
            Lifecycle::ReconnectScheduled => {
                self.lifecycle = Lifecycle::Connecting;
                vec![
                    Action::CancelReconnect,
                    Action::Status(self.status()),
                    Action::OpenSocket,
                ]
            }
            Lifecycle::Idle | Lifecycle::GaveUp => {
                self.attempts = 0;
                self.lifecycle = Lifecycle::Connecting;
                vec![Action::Status(self.status()), Action::OpenSocket]
            }
        }
    }

    fn on_disconnect_requested(&mut self) -> Vec<Action> {
        let mut actions = match self.lifecycle {
            Lifecycle::Connecting => vec![Action::CancelOpen],
            Lifecycle::Connected => vec![Action::StopHeartbeat, Action::CloseSocket],
            Lifecycle::ReconnectScheduled => vec![Action::CancelReconnect],
            Lifecycle::Idle | Lifecycle::GaveUp => Vec::new(),
        };

        self.registry.clear();
        self.attempts = 0;
        self.last_error = None;
        self.lifecycle = Lifecycle::Idle;

        actions.extend([
            Action::FailPending(DisconnectReason::Requested),
            Action::ClearHandlers,
            Action::Status(self.status()),
            Action::ConnectFailed(DisconnectReason::Requested),
        ]);
        actions
    }

    fn on_opened(&mut self) -> Vec<Action> {
        if self.lifecycle != Lifecycle::Connecting {
            return vec![Action::CloseSocket];
        }

        self.lifecycle = Lifecycle::Connected;
        self.attempts = 0;
        self.last_error = None;

        // Waiters resolve before replay; a failed replay send is a connection loss.
        let mut actions = vec![
            Action::Status(self.status()),
            Action::ConnectSucceeded,
            Action::StartHeartbeat,
        ];
        actions.extend(
            self.registry
                .replay_all()
                .iter()
                .map(|group| Action::Send(OutboundFrame::subscribe(group))),
        );
        actions
    }

    fn on_open_failure(&mut self, reason: DisconnectReason) -> Vec<Action> {
        if self.lifecycle != Lifecycle::Connecting {
            return Vec::new();
        }

        let mut actions = vec![Action::ConnectFailed(reason.clone())];
        actions.extend(self.schedule_retry(reason));
        actions
    }

    fn on_connection_lost(&mut self, reason: DisconnectReason, close_socket: bool) -> Vec<Action> {
        if self.lifecycle != Lifecycle::Connected {
            return Vec::new();
        }

        let mut actions = vec![Action::StopHeartbeat];
        if close_socket {
            actions.push(Action::CloseSocket);
        }
        actions.push(Action::FailPending(reason.clone()));
        actions.extend(self.schedule_retry(reason));
        actions
    }

    fn on_auth_rejected(&mut self, message: String) -> Vec<Action> {
        let reason = DisconnectReason::AuthRejected { message };
        let mut actions = match self.lifecycle {
            Lifecycle::Connected => vec![Action::StopHeartbeat, Action::CloseSocket],
            Lifecycle::Connecting => vec![Action::CancelOpen],
            Lifecycle::Idle | Lifecycle::ReconnectScheduled | Lifecycle::GaveUp => {
                return Vec::new();
            }
        };

        self.lifecycle = Lifecycle::GaveUp;
        self.last_error = Some(reason.clone());

        actions.extend([
            Action::FailPending(reason.clone()),
            Action::Status(self.status()),
            Action::ConnectFailed(reason),
        ]);
        actions
    }

    fn on_reconnect_timer(&mut self) -> Vec<Action> {
        if self.lifecycle != Lifecycle::ReconnectScheduled {
            return Vec::new();
        }

        self.lifecycle = Lifecycle::Connecting;
        vec![Action::Status(self.status()), Action::OpenSocket]
    }

    fn on_subscribe(&mut self, key: &ChannelKey) -> Vec<Action> {
        if self.registry.add(key) && self.lifecycle == Lifecycle::Connected {
            vec![Action::Send(OutboundFrame::subscribe(&ChannelGroup::from(
                key,
            )))]
        } else {
            Vec::new()
        }
    }

    fn on_unsubscribe(&mut self, key: &ChannelKey) -> Vec<Action> {
        if self.registry.remove(key) && self.lifecycle == Lifecycle::Connected {
            vec![Action::Send(OutboundFrame::unsubscribe(
                &ChannelGroup::from(key),
            ))]
        } else {
            Vec::new()
        }
    }

    /// Count a failure and either arm the reconnect timer or give up.
    fn schedule_retry(&mut self, reason: DisconnectReason) -> Vec<Action> {
        self.attempts = self.attempts.saturating_add(1);

        if self.max_attempts > 0 && self.attempts > self.max_attempts {
            self.lifecycle = Lifecycle::GaveUp;
            self.last_error = Some(DisconnectReason::MaxAttemptsExceeded {
                attempts: self.max_attempts,
            });
            return vec![Action::Status(self.status())];
        }

        self.lifecycle = Lifecycle::ReconnectScheduled;
        self.last_error = Some(reason);
        vec![
            Action::Status(self.status()),
            Action::ScheduleReconnect {
                attempt: self.attempts - 1,
            },
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
