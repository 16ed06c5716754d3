//! Backoff Policy
//!
//! Exponential backoff with additive jitter for reconnect attempts:
//!
//! ```text
//! delay(attempt) = min(base * growth^attempt, cap) + uniform(0, jitter_window)
//! ```
//!
//! The policy itself is stateless; the attempt counter lives in the
//! connection state machine. Randomness comes from a [`JitterSource`] so the
//! deterministic part can be tested on its own.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt (ignoring jitter).
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub growth: f64,
    /// Upper bound on the deterministic part of the delay.
    pub cap: Duration,
    /// Width of the uniform jitter added on top.
    pub jitter_window: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            growth: 1.5,
            cap: Duration::from_secs(30),
            jitter_window: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(base: Duration, growth: f64, cap: Duration, jitter_window: Duration) -> Self {
        Self {
            base,
            growth,
            cap,
            jitter_window,
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            base: settings.backoff_base,
            growth: settings.backoff_growth,
            cap: settings.backoff_cap,
            jitter_window: settings.backoff_jitter,
        }
    }
}

/// Source of the random jitter term.
#[cfg_attr(test, mockall::automock)]
pub trait JitterSource: Send + Sync {
    /// Sample a duration uniformly from `[0, window]`.
    fn sample(&self, window: Duration) -> Duration;
}

/// Jitter drawn from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self, window: Duration) -> Duration {
        if window.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        let nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rng.random_range(0..=nanos))
    }
}

/// Reconnect delay calculator.
///
/// # Example
///
/// ```rust
/// use realtime_feeds::infrastructure::websocket::reconnect::{BackoffConfig, BackoffPolicy};
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(BackoffConfig::default());
///
/// assert_eq!(policy.base_delay(0), Duration::from_secs(1));
/// assert_eq!(policy.base_delay(1), Duration::from_millis(1500));
/// assert_eq!(policy.base_delay(50), Duration::from_secs(30));
/// ```
pub struct BackoffPolicy {
    config: BackoffConfig,
    jitter: Box<dyn JitterSource>,
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackoffPolicy {
    /// Create a policy that draws jitter from the thread RNG.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_jitter(config, Box::new(ThreadRngJitter))
    }

    /// Create a policy with a custom jitter source.
    #[must_use]
    pub fn with_jitter(config: BackoffConfig, jitter: Box<dyn JitterSource>) -> Self {
        Self { config, jitter }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Deterministic part of the delay: `min(base * growth^attempt, cap)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let growth = if self.config.growth.is_finite() {
            self.config.growth.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.config.base.as_secs_f64() * growth.powi(exponent);

        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.config.cap)
            .min(self.config.cap)
    }

    /// Full delay for the given zero-based attempt, jitter included.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = self
            .jitter
            .sample(self.config.jitter_window)
            .min(self.config.jitter_window);
        self.base_delay(attempt).saturating_add(jitter)
    }
}
