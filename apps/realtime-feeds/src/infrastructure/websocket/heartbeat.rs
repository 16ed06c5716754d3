//! Heartbeat Monitor
//!
//! Paces liveness probes while a feed is connected. Each tick yields a
//! fresh probe id; the controller sends `{"type":"ping","id":...}` and
//! registers the id in the pending-call table with the pong timeout. A
//! probe that expires there means the connection is dead.
//!
//! Servers that answer with an uncorrelated `pong` are matched against the
//! oldest outstanding probe.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Timeout for pong response before connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Probe pacing and bookkeeping for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    interval: Option<Interval>,
    outstanding: VecDeque<String>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub const fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            interval: None,
            outstanding: VecDeque::new(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start ticking. The first tick fires one full interval from now.
    pub fn start(&mut self) {
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.interval = Some(interval);
        self.outstanding.clear();
    }

    /// Stop ticking and forget outstanding probes.
    pub fn stop(&mut self) {
        self.interval = None;
        self.outstanding.clear();
    }

    /// Check whether the monitor is ticking.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait for the next tick. Never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Allocate the id for a new probe and track it as outstanding.
    pub fn next_probe(&mut self) -> String {
        let id = format!("hb-{}", uuid::Uuid::new_v4());
        self.outstanding.push_back(id.clone());
        id
    }

    /// Oldest probe still waiting for a pong.
    #[must_use]
    pub fn oldest_outstanding(&self) -> Option<&str> {
        self.outstanding.front().map(String::as_str)
    }

    /// Mark a probe as answered (or expired). Returns `false` for unknown ids.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.outstanding.iter().position(|probe| probe == id) {
            Some(index) => {
                self.outstanding.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of probes waiting for a pong.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
