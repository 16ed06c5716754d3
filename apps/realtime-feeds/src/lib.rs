#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Realtime Feeds - Resilient WebSocket Messaging Core
//!
//! Keeps the dashboard's real-time feeds alive over an unreliable socket:
//! one controller per feed reconnects with exponential backoff, replays
//! subscriptions after every reconnect, correlates requests with replies and
//! detects dead connections with an application-level heartbeat.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and logic
//!   - `subscription`: Channel keys and the subscription registry
//!   - `streaming`: Wire frames and typed payloads
//!   - `connection`: Reconnection state machine and status
//!
//! - **Application**: Port definitions and services
//!   - `ports`: Socket transport interface
//!   - `services`: Message dispatch to registered handlers
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: Feed controller, tungstenite transport, codec, timers
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OpenTelemetry export
//!
//! # Data Flow
//!
//! ```text
//! FeedClient ──► controller task ──► socket ──► server
//!                      │
//!      server ──► socket ──► codec ──┬──► pending-call table ──► awaiting request
//!                                    └──► dispatcher ──► handlers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionStatus, DisconnectReason, FeedStatus, Lifecycle};
pub use domain::streaming::{
    Bar, ConnectionStatusPayload, CorrelationId, ErrorPayload, InboundMessage, MarketData,
    Notification, OutboundFrame, PortfolioMetrics, Quote, Trade, UnreadCount,
};
pub use domain::subscription::{
    ChannelGroup, ChannelKey, DataKind, SubscriptionRegistry, SubscriptionStats, Symbol,
};

// Application services
pub use application::ports::{SocketConnection, SocketEvent, Transport, TransportError};
pub use application::services::{HandlerRegistration, MessageDispatcher};

// Infrastructure config
pub use infrastructure::config::{AuthToken, ClientConfig, ConfigError, FeedSettings};

// Feed clients
pub use infrastructure::websocket::{
    ClientError, ControllerConfig, ControllerSnapshot, FeedClient, FeedKind, RequestError,
    RequestOptions, RequestResult,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
