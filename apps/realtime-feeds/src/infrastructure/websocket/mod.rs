//! WebSocket Feed Clients
//!
//! Resilient clients for the server's real-time feeds. Each feed runs its own
//! controller task that keeps one socket open, replays subscriptions after a
//! reconnect, correlates requests with replies and probes liveness.
//!
//! # Components
//!
//! - [`controller`]: per-feed actor and the [`FeedClient`] handle
//! - [`transport`]: `tokio-tungstenite` socket adapter
//! - [`codec`]: JSON frame encoding and decoding
//! - [`pending`]: correlation-id table with deadlines
//! - [`heartbeat`]: ping scheduling and pong tracking
//! - [`reconnect`]: exponential backoff with jitter
//! - [`endpoints`]: socket URLs per feed

pub mod codec;
pub mod controller;
pub mod endpoints;
pub mod heartbeat;
pub mod pending;
pub mod reconnect;
pub mod transport;

pub use codec::{CodecError, JsonCodec};
pub use controller::{
    ClientError, ControllerConfig, ControllerSnapshot, FeedClient, RequestOptions, connect_all,
};
pub use endpoints::{FeedKind, feed_url};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use pending::{PendingCallTable, RequestError, RequestResult};
pub use reconnect::{BackoffConfig, BackoffPolicy};
pub use transport::TungsteniteTransport;
