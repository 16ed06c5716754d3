//! Pending-Call Table
//!
//! Tracks correlated requests awaiting a reply. Every entry ends in exactly
//! one terminal event: settled by a reply, expired by its deadline, or
//! failed in bulk when the connection goes away. The entry is removed at
//! that moment, so it can never be settled twice.
//!
//! Deadlines live in a [`DelayQueue`] owned by the table; the controller
//! polls [`PendingCallTable::next_expired`] from its event loop. Heartbeat
//! probes share the table so their pong timeout uses the same machinery.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::domain::streaming::{CorrelationId, InboundMessage};

/// Outcome delivered to a request caller.
pub type RequestResult = Result<InboundMessage, RequestError>;

/// Why a correlated request did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The feed is not connected.
    #[error("not connected")]
    NotConnected,

    /// No reply arrived before the deadline.
    #[error("request {id} timed out after {}ms", after.as_millis())]
    Timeout {
        /// Correlation id of the request.
        id: CorrelationId,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// The caller disconnected the feed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection dropped while the request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server answered with an `error` frame.
    #[error("server error{}: {message}", code.map(|c| format!(" {c}")).unwrap_or_default())]
    Server {
        /// Server error code.
        code: Option<i64>,
        /// Server error message.
        message: String,
    },

    /// A live entry already uses this correlation id.
    #[error("correlation id {0} is already pending")]
    DuplicateId(CorrelationId),

    /// The request could not be serialized or written.
    #[error("failed to send request: {0}")]
    Send(String),

    /// The controller has shut down.
    #[error("feed client stopped")]
    Stopped,
}

/// What kind of entry a correlation id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// A caller's request.
    Request,
    /// A heartbeat probe.
    Probe,
}

/// An entry whose deadline elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    /// Correlation id.
    pub id: CorrelationId,
    /// Entry kind.
    pub kind: PendingKind,
    /// Timeout that elapsed.
    pub after: Duration,
}

#[derive(Debug)]
enum Waiter {
    Caller(oneshot::Sender<RequestResult>),
    Probe,
}

#[derive(Debug)]
struct PendingCall {
    waiter: Waiter,
    key: delay_queue::Key,
    timeout: Duration,
}

impl PendingCall {
    const fn kind(&self) -> PendingKind {
        match self.waiter {
            Waiter::Caller(_) => PendingKind::Request,
            Waiter::Probe => PendingKind::Probe,
        }
    }

    fn resolve(self, outcome: RequestResult) {
        if let Waiter::Caller(tx) = self.waiter {
            // The caller may have stopped waiting.
            let _ = tx.send(outcome);
        }
    }
}

/// Correlation id to waiter map with per-entry deadlines.
#[derive(Debug)]
pub struct PendingCallTable {
    calls: HashMap<CorrelationId, PendingCall>,
    expiries: DelayQueue<CorrelationId>,
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCallTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            expiries: DelayQueue::new(),
        }
    }

    /// Register a request and return the receiver its outcome arrives on.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::DuplicateId`] if `id` is already live.
    pub fn create(
        &mut self,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RequestResult>, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Waiter::Caller(tx), timeout)?;
        Ok(rx)
    }

    /// Register a heartbeat probe.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::DuplicateId`] if `id` is already live.
    pub fn create_probe(&mut self, id: CorrelationId, timeout: Duration) -> Result<(), RequestError> {
        self.insert(id, Waiter::Probe, timeout)
    }

    fn insert(&mut self, id: CorrelationId, waiter: Waiter, timeout: Duration) -> Result<(), RequestError> {
        if self.calls.contains_key(&id) {
            return Err(RequestError::DuplicateId(id));
        }

        let key = self.expiries.insert(id.clone(), timeout);
        self.calls.insert(
            id,
            PendingCall {
                waiter,
                key,
                timeout,
            },
        );
        Ok(())
    }

    /// Settle the entry for `id`. Returns `None` if no entry is live.
    pub fn settle(&mut self, id: &str, outcome: RequestResult) -> Option<PendingKind> {
        let call = self.calls.remove(id)?;
        self.expiries.try_remove(&call.key);

        let kind = call.kind();
        call.resolve(outcome);
        Some(kind)
    }

    /// Fail every live entry with `error`. Returns how many were failed.
    pub fn expire_all(&mut self, error: &RequestError) -> usize {
        self.expiries.clear();

        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            call.resolve(Err(error.clone()));
        }
        count
    }

    /// Wait for the next deadline to elapse.
    ///
    /// The expired entry is removed and its caller receives
    /// [`RequestError::Timeout`]. Never resolves while the table is empty.
    pub async fn next_expired(&mut self) -> Expired {
        loop {
            let Some(expired) = std::future::poll_fn(|cx| self.expiries.poll_expired(cx)).await
            else {
                return std::future::pending().await;
            };

            let id = expired.into_inner();
            let Some(call) = self.calls.remove(&id) else {
                continue;
            };

            let kind = call.kind();
            let after = call.timeout;
            call.resolve(Err(RequestError::Timeout {
                id: id.clone(),
                after,
            }));
            return Expired { id, kind, after };
        }
    }

    /// Check whether `id` is live.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Check whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Live correlation ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<_> = self.calls.keys().cloned().collect();
        ids.sort();
        ids
    }
}
