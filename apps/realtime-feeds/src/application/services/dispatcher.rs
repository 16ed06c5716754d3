//! Message Dispatcher
//!
//! Routes every inbound message to the handlers registered for its frame
//! `type`, then (for market data) to those registered for its `data_type`,
//! then to the wildcard handlers. Handlers for one key run in registration
//! order. A panicking handler is logged and skipped; the rest
//! still run.
//!
//! Dispatch snapshots the handler list before invoking anything, so a
//! handler may register or unregister handlers without deadlocking.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::domain::streaming::InboundMessage;

/// Routing key that matches every message.
pub const WILDCARD: &str = "*";

/// Identifier of one handler registration.
pub type HandlerId = u64;

/// Callback invoked for matching inbound messages.
pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Type-keyed fan-out of inbound messages.
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl MessageDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_type` (or [`WILDCARD`]).
    ///
    /// The returned registration removes exactly this handler when
    /// [`HandlerRegistration::unregister`] is called. Dropping it leaves the
    /// handler in place.
    pub fn on<F>(self: &Arc<Self>, msg_type: impl Into<String>, handler: F) -> HandlerRegistration
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let msg_type = msg_type.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.handlers
            .write()
            .entry(msg_type.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::debug!(msg_type = %msg_type, handler_id = id, "Handler registered");

        HandlerRegistration {
            dispatcher: Arc::downgrade(self),
            msg_type,
            id,
        }
    }

    /// Remove one handler. Returns `false` if it was already gone.
    pub fn remove(&self, msg_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(msg_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;

        if list.is_empty() {
            handlers.remove(msg_type);
        }
        removed
    }

    /// Invoke type handlers, then `data_type` handlers, then wildcard
    /// handlers, for `message`.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let key = message.routing_key();
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.read();
            message
                .routing_keys()
                .filter(|route| *route != WILDCARD)
                .chain(std::iter::once(WILDCARD))
                .filter_map(|route| handlers.get(route))
                .flatten()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let mut completed = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(
                        msg_type = %message.msg_type,
                        routing_key = %key,
                        panic = %detail,
                        "Message handler panicked"
                    );
                }
            }
        }
        completed
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Total number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Number of handlers registered for exactly `msg_type`.
    #[must_use]
    pub fn handlers_for(&self, msg_type: &str) -> usize {
        self.handlers.read().get(msg_type).map_or(0, Vec::len)
    }
}

/// Handle for removing one registered handler.
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    dispatcher: Weak<MessageDispatcher>,
    msg_type: String,
    id: HandlerId,
}

impl HandlerRegistration {
    /// Routing key the handler was registered under.
    #[must_use]
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Registration id.
    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the handler. Returns `false` if it was already removed or
    /// the dispatcher is gone.
    pub fn unregister(&self) -> bool {
        self.dispatcher
            .upgrade()
            .is_some_and(|dispatcher| dispatcher.remove(&self.msg_type, self.id))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Value;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = Arc::clone(&log);
        let make = move |label: &'static str| -> Handler {
            let log = Arc::clone(&log_for);
            Arc::new(move |_: &InboundMessage| log.lock().unwrap().push(label.to_string()))
        };
        (log, make)
    }

    fn bars_message() -> InboundMessage {
        let mut msg = InboundMessage::new("market_data", Value::Null);
        msg.data_type = Some("bars".to_string());
        msg
    }

    #[test]
    fn fan_out_hits_exact_then_wildcard_only() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let (log, make) = recorder();

        let wildcard = make("wildcard");
        let bars_a = make("bars-a");
        let trades = make("trades");
        let bars_b = make("bars-b");
        dispatcher.on(WILDCARD, move |m| wildcard(m));
        dispatcher.on("bars", move |m| bars_a(m));
        dispatcher.on("trades", move |m| trades(m));
        dispatcher.on("bars", move |m| bars_b(m));

        let invoked = dispatcher.dispatch(&bars_message());

        assert_eq!(invoked, 3);
        assert_eq!(*log.lock().unwrap(), vec!["bars-a", "bars-b", "wildcard"]);
    }

    #[test]
    fn market_data_reaches_type_then_data_type_handlers() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let (log, make) = recorder();

        let wildcard = make("wildcard");
        let bars = make("bars");
        let market = make("market_data");
        let quotes = make("quotes");
        dispatcher.on(WILDCARD, move |m| wildcard(m));
        dispatcher.on("bars", move |m| bars(m));
        dispatcher.on("market_data", move |m| market(m));
        dispatcher.on("quotes", move |m| quotes(m));

        let invoked = dispatcher.dispatch(&bars_message());

        assert_eq!(invoked, 3);
        assert_eq!(*log.lock().unwrap(), vec!["market_data", "bars", "wildcard"]);
    }

    #[test]
    fn unregister_removes_exactly_one_handler() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let (log, make) = recorder();

        let first = make("first");
        let second = make("second");
        let registration = dispatcher.on("notification", move |m| first(m));
        dispatcher.on("notification", move |m| second(m));

        assert!(registration.unregister());
        assert!(!registration.unregister());

        dispatcher.dispatch(&InboundMessage::new("notification", Value::Null));
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(dispatcher.handlers_for("notification"), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let (log, make) = recorder();

        let after = make("after");
        dispatcher.on("error", |_| panic!("handler failure"));
        dispatcher.on("error", move |m| after(m));

        let invoked = dispatcher.dispatch(&InboundMessage::new("error", Value::Null));

        assert_eq!(invoked, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn handler_can_register_during_dispatch() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let inner = Arc::clone(&dispatcher);

        dispatcher.on("pong", move |_| {
            inner.on("pong", |_| {});
        });

        dispatcher.dispatch(&InboundMessage::new("pong", Value::Null));
        assert_eq!(dispatcher.handlers_for("pong"), 2);
    }

    #[test]
    fn clear_drops_everything_and_stale_registrations_are_harmless() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let registration = dispatcher.on(WILDCARD, |_| {});
        dispatcher.on("bars", |_| {});

        dispatcher.clear();

        assert_eq!(dispatcher.handler_count(), 0);
        assert!(!registration.unregister());
    }

    #[test]
    fn unregister_after_dispatcher_dropped() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let registration = dispatcher.on("bars", |_| {});
        drop(dispatcher);

        assert!(!registration.unregister());
    }
}
