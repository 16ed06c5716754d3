//! Feed Client Configuration Settings
//!
//! Configuration types for the feed clients, loaded from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `FEED_BASE_URL` | required |
//! | `FEED_ACCOUNT_ID` | none |
//! | `FEED_AUTH_TOKEN` | none |
//! | `FEED_SYMBOLS` | empty |
//! | `FEED_METRICS_PORT` | 9090 (0 = no HTTP listener) |
//! | `FEED_CONNECT_TIMEOUT_MS` | 10000 |
//! | `FEED_REQUEST_TIMEOUT_MS` | 10000 |
//! | `FEED_HEARTBEAT_INTERVAL_SECS` | 30 |
//! | `FEED_HEARTBEAT_TIMEOUT_SECS` | 10 |
//! | `FEED_RECONNECT_BASE_MS` | 1000 |
//! | `FEED_RECONNECT_GROWTH` | 1.5 |
//! | `FEED_RECONNECT_CAP_SECS` | 30 |
//! | `FEED_RECONNECT_JITTER_MS` | 1000 |
//! | `FEED_MAX_RECONNECT_ATTEMPTS` | 10 (0 = unlimited) |

use std::time::Duration;

/// Bearer token presented on the socket handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the raw token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Connection, request and reconnect tuning for one feed client.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    /// Deadline for a socket to open.
    pub connect_timeout: Duration,
    /// Default deadline for a correlated request.
    pub request_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Reconnect delay for the first attempt.
    pub backoff_base: Duration,
    /// Reconnect delay multiplier per attempt.
    pub backoff_growth: f64,
    /// Maximum reconnect delay before jitter.
    pub backoff_cap: Duration,
    /// Width of the random jitter added to each reconnect delay.
    pub backoff_jitter: Duration,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_growth: 1.5,
            backoff_cap: Duration::from_secs(30),
            backoff_jitter: Duration::from_secs(1),
            max_reconnect_attempts: 10,
        }
    }
}

impl FeedSettings {
    /// Load settings from environment variables, defaulting anything unset
    /// or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            connect_timeout: parse_duration_millis(
                lookup,
                "FEED_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            ),
            request_timeout: parse_duration_millis(
                lookup,
                "FEED_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
            ),
            heartbeat_interval: parse_duration_secs(
                lookup,
                "FEED_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                lookup,
                "FEED_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            backoff_base: parse_duration_millis(
                lookup,
                "FEED_RECONNECT_BASE_MS",
                defaults.backoff_base,
            ),
            backoff_growth: parse_or(lookup, "FEED_RECONNECT_GROWTH", defaults.backoff_growth),
            backoff_cap: parse_duration_secs(lookup, "FEED_RECONNECT_CAP_SECS", defaults.backoff_cap),
            backoff_jitter: parse_duration_millis(
                lookup,
                "FEED_RECONNECT_JITTER_MS",
                defaults.backoff_jitter,
            ),
            max_reconnect_attempts: parse_or(
                lookup,
                "FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Page origin the feed URLs derive from (`http(s)://` or `ws(s)://`).
    pub base_url: String,
    /// Account id for account-scoped feeds.
    pub account_id: Option<String>,
    /// Bearer token for the handshake.
    pub auth_token: Option<AuthToken>,
    /// Symbols the binary subscribes to.
    pub symbols: Vec<String>,
    /// Prometheus metrics port (0 = no HTTP listener).
    pub metrics_port: u16,
    /// Per-feed tuning.
    pub feed: FeedSettings,
}

impl ClientConfig {
    /// Create a configuration for `base_url` with default settings.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            account_id: None,
            auth_token: None,
            symbols: Vec::new(),
            metrics_port: 9090,
            feed: FeedSettings::default(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url =
            lookup("FEED_BASE_URL").ok_or_else(|| ConfigError::MissingEnvVar("FEED_BASE_URL".to_string()))?;

        if base_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("FEED_BASE_URL".to_string()));
        }

        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let symbols = non_empty("FEED_SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_uppercase)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            base_url: base_url.trim().to_string(),
            account_id: non_empty("FEED_ACCOUNT_ID"),
            auth_token: non_empty("FEED_AUTH_TOKEN").map(AuthToken::new),
            symbols,
            metrics_port: parse_or(lookup, "FEED_METRICS_PORT", 9090),
            feed: FeedSettings::from_lookup(lookup),
        })
    }

    /// Get the account id.
    ///
    /// # Errors
    ///
    /// Returns an error if no account id is configured.
    pub fn require_account_id(&self) -> Result<&str, ConfigError> {
        self.account_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("FEED_ACCOUNT_ID".to_string()))
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Base URL cannot be turned into a socket URL.
    #[error("invalid base URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_or<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
