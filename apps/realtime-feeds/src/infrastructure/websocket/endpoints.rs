//! Feed Endpoints
//!
//! Builds socket URLs from the page origin. The scheme mirrors the origin
//! (`http` becomes `ws`, `https` becomes `wss`); the path and query are
//! specific to each feed.
//!
//! - Market data: `/ws/market-data`
//! - Trading: `/ws/trading?account_id=...`
//! - Notifications: `/ws/notifications`
//! - Portfolio: `/ws/portfolio?account_id=...`

use std::fmt;

use crate::infrastructure::config::ConfigError;

/// Logical feed served by its own socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Bars, quotes and trades.
    MarketData,
    /// Order and account updates for one account.
    Trading {
        /// Account id.
        account_id: String,
    },
    /// User notifications and unread counts.
    Notifications,
    /// Portfolio metrics for one account.
    Portfolio {
        /// Account id.
        account_id: String,
    },
}

impl FeedKind {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Trading { .. } => "trading",
            Self::Notifications => "notifications",
            Self::Portfolio { .. } => "portfolio",
        }
    }

    /// Path and query for this feed.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::MarketData => "/ws/market-data".to_string(),
            Self::Trading { account_id } => {
                format!("/ws/trading?account_id={}", urlencoding::encode(account_id))
            }
            Self::Notifications => "/ws/notifications".to_string(),
            Self::Portfolio { account_id } => {
                format!("/ws/portfolio?account_id={}", urlencoding::encode(account_id))
            }
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Build the socket URL for `kind` from a page origin.
///
/// # Errors
///
/// Returns an error if the origin has no host or an unsupported scheme.
pub fn feed_url(base_url: &str, kind: &FeedKind) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, rest) = base_url
        .trim()
        .split_once("://")
        .ok_or_else(|| invalid("missing scheme"))?;

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("scheme must be http, https, ws or wss")),
    };

    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok(format!("{ws_scheme}://{host}{}", kind.path()))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("http://localhost:8000", FeedKind::MarketData, "ws://localhost:8000/ws/market-data" ; "http maps to ws")]
    #[test_case("https://app.example.com", FeedKind::Notifications, "wss://app.example.com/ws/notifications" ; "https maps to wss")]
    #[test_case("https://app.example.com/dashboard?tab=1", FeedKind::MarketData, "wss://app.example.com/ws/market-data" ; "page path is dropped")]
    #[test_case("wss://feeds.example.com", FeedKind::MarketData, "wss://feeds.example.com/ws/market-data" ; "socket scheme kept")]
    #[test_case("HTTPS://app.example.com", FeedKind::MarketData, "wss://app.example.com/ws/market-data" ; "scheme is case insensitive")]
    fn builds_urls(base: &str, kind: FeedKind, expected: &str) {
        assert_eq!(feed_url(base, &kind).unwrap(), expected);
    }

    #[test]
    fn account_feeds_encode_account_id() {
        let trading = FeedKind::Trading {
            account_id: "acct 1/2".to_string(),
        };
        assert_eq!(
            feed_url("https://app.example.com", &trading).unwrap(),
            "wss://app.example.com/ws/trading?account_id=acct%201%2F2"
        );

        let portfolio = FeedKind::Portfolio {
            account_id: "42".to_string(),
        };
        assert_eq!(portfolio.path(), "/ws/portfolio?account_id=42");
    }

    #[test_case("ftp://example.com" ; "unsupported scheme")]
    #[test_case("example.com" ; "no scheme")]
    #[test_case("https://" ; "no host")]
    fn rejects_bad_origins(base: &str) {
        assert!(matches!(
            feed_url(base, &FeedKind::MarketData),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn labels() {
        assert_eq!(FeedKind::MarketData.to_string(), "market_data");
        assert_eq!(
            FeedKind::Trading {
                account_id: "a".into()
            }
            .label(),
            "trading"
        );
    }
}
