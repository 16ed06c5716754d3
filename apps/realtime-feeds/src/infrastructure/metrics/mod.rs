//! Prometheus Metrics Module
//!
//! Exposes feed client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Counts of frames received and sent by type
//! - **Connections**: Connection state per feed, reconnect attempts
//! - **Requests**: Pending calls, timeouts and round-trip latency
//! - **Errors**: Protocol errors and heartbeat losses
//!
//! # Integration
//!
//! With a non-zero port, metrics are served at `/metrics` by the exporter's
//! own HTTP listener. Otherwise the recorder is installed and rendered
//! through the returned handle.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// With `port > 0` an HTTP listener serving `/metrics` is started on that
/// port and no handle is returned. Calling this more than once is a no-op
/// that returns the first result.
///
/// # Errors
///
/// Returns an error if the recorder or listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<Option<PrometheusHandle>, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let builder = PrometheusBuilder::new();
    let handle = if port > 0 {
        builder
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()?;
        None
    } else {
        Some(builder.install_recorder()?)
    };

    register_metrics();
    tracing::info!(port, "Metrics recorder installed");

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized or are served by the
/// HTTP listener.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned().flatten()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "realtime_feeds_frames_received_total",
        "Total frames received from feed servers"
    );
    describe_counter!(
        "realtime_feeds_frames_sent_total",
        "Total frames sent to feed servers"
    );
    describe_counter!(
        "realtime_feeds_protocol_errors_total",
        "Total inbound frames dropped as malformed"
    );

    // Connection gauges
    describe_gauge!(
        "realtime_feeds_connection_state",
        "Connection state per feed (0 = disconnected, 1 = connecting, 2 = connected)"
    );
    describe_counter!(
        "realtime_feeds_reconnects_total",
        "Total reconnection attempts scheduled"
    );
    describe_counter!(
        "realtime_feeds_heartbeat_lost_total",
        "Total connections dropped after an unanswered heartbeat"
    );

    // Subscription and request gauges
    describe_gauge!(
        "realtime_feeds_subscriptions",
        "Number of channel keys in the subscription registry"
    );
    describe_gauge!(
        "realtime_feeds_pending_calls",
        "Number of correlated requests awaiting a reply"
    );
    describe_counter!(
        "realtime_feeds_request_timeouts_total",
        "Total correlated requests that timed out"
    );

    // Latency histograms
    describe_histogram!(
        "realtime_feeds_request_duration_seconds",
        "Round-trip time of correlated requests"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Numeric gauge value for a connection status.
#[must_use]
pub const fn connection_state_value(status: ConnectionStatus) -> f64 {
    match status {
        ConnectionStatus::Disconnected => 0.0,
        ConnectionStatus::Connecting => 1.0,
        ConnectionStatus::Connected => 2.0,
    }
}

/// Record a frame received on a feed.
pub fn record_frame_received(feed: &'static str, msg_type: &str) {
    counter!(
        "realtime_feeds_frames_received_total",
        "feed" => feed,
        "message_type" => msg_type.to_string()
    )
    .increment(1);
}

/// Record a frame sent on a feed.
pub fn record_frame_sent(feed: &'static str, msg_type: &str) {
    counter!(
        "realtime_feeds_frames_sent_total",
        "feed" => feed,
        "message_type" => msg_type.to_string()
    )
    .increment(1);
}

/// Record a malformed inbound frame.
pub fn record_protocol_error(feed: &'static str) {
    counter!("realtime_feeds_protocol_errors_total", "feed" => feed).increment(1);
}

/// Update the connection state gauge for a feed.
pub fn set_connection_state(feed: &'static str, status: ConnectionStatus) {
    gauge!("realtime_feeds_connection_state", "feed" => feed).set(connection_state_value(status));
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect(feed: &'static str) {
    counter!("realtime_feeds_reconnects_total", "feed" => feed).increment(1);
}

/// Record a heartbeat loss.
pub fn record_heartbeat_lost(feed: &'static str) {
    counter!("realtime_feeds_heartbeat_lost_total", "feed" => feed).increment(1);
}

/// Update the subscription count for a feed.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(feed: &'static str, count: usize) {
    gauge!("realtime_feeds_subscriptions", "feed" => feed).set(count as f64);
}

/// Update the pending-call count for a feed.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_calls(feed: &'static str, count: usize) {
    gauge!("realtime_feeds_pending_calls", "feed" => feed).set(count as f64);
}

/// Record a request timeout.
pub fn record_request_timeout(feed: &'static str) {
    counter!("realtime_feeds_request_timeouts_total", "feed" => feed).increment(1);
}

/// Record a request round-trip.
pub fn record_request_duration(feed: &'static str, duration: Duration) {
    histogram!("realtime_feeds_request_duration_seconds", "feed" => feed)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_values() {
        assert!(connection_state_value(ConnectionStatus::Disconnected).abs() < f64::EPSILON);
        assert!((connection_state_value(ConnectionStatus::Connecting) - 1.0).abs() < f64::EPSILON);
        assert!((connection_state_value(ConnectionStatus::Connected) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_frame_received("market_data", "bars");
        record_frame_sent("market_data", "subscribe");
        set_connection_state("market_data", ConnectionStatus::Connected);
        record_request_duration("trading", Duration::from_millis(12));
    }
}
