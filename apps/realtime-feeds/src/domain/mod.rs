//! Domain Layer - Core feed types and connection logic.
//!
//! Pure types with no I/O: channel keys and the subscription registry,
//! wire frames and typed payloads, and the reconnection state machine.

/// Reconnection state machine and connection status types.
pub mod connection;

/// Wire framing and typed feed payloads.
pub mod streaming;

/// Channel keys and subscription bookkeeping.
pub mod subscription;
