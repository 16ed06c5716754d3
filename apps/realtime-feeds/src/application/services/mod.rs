//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MessageDispatcher`: Fans inbound messages out to registered handlers

/// Type-keyed fan-out of inbound messages.
pub mod dispatcher;

pub use dispatcher::{HandlerId, HandlerRegistration, MessageDispatcher, WILDCARD};
