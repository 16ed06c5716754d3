//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: opens a socket and yields a frame sink plus an event
//!   stream. The connection controller never sees the concrete socket type,
//!   so tests drive it with an in-memory transport.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

/// Errors raised by a transport adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server refused the handshake (HTTP 401/403).
    #[error("handshake rejected with HTTP {status}")]
    Rejected {
        /// HTTP status returned by the server.
        status: u16,
    },

    /// The URL could not be turned into a handshake request.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The socket is closed.
    #[error("socket closed")]
    Closed,
}

impl TransportError {
    /// Check whether the handshake failed on credentials.
    #[must_use]
    pub const fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Rejected { status: 401 | 403 })
    }
}

/// Events observed on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame arrived.
    Frame(String),
    /// The peer closed the socket.
    Closed {
        /// Close code, if one was sent.
        code: Option<u16>,
        /// Close reason text.
        reason: String,
    },
    /// The socket failed.
    Error(String),
}

/// Outgoing half of an open socket.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half of an open socket. The stream ending means the socket is gone.
pub type FrameStream = Pin<Box<dyn Stream<Item = SocketEvent> + Send>>;

/// An open socket split into its two halves.
pub struct SocketConnection {
    /// Frame writer.
    pub sink: FrameSink,
    /// Event reader.
    pub events: FrameStream,
}

impl SocketConnection {
    /// Bundle a sink and an event stream.
    #[must_use]
    pub fn new(sink: FrameSink, events: FrameStream) -> Self {
        Self { sink, events }
    }
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection").finish_non_exhaustive()
    }
}

/// Opens sockets to a URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    async fn open(&self, url: &str) -> Result<SocketConnection, TransportError>;
}
