//! Wire Framing and Feed Payloads
//!
//! Every frame on the socket, in either direction, is a JSON object:
//!
//! ```json
//! {"type": "subscribe", "data": {...}, "id": "optional-correlation-id", "timestamp": 1718035200000}
//! ```
//!
//! Outbound frames are built with [`OutboundFrame`]. Inbound frames decode
//! into [`InboundMessage`], whose `data` stays an untyped JSON value until a
//! consumer asks for one of the typed payloads below.
//!
//! # Inbound Types
//!
//! - `market_data`: with a `data_type` discriminator (`bars` | `quotes` | `trades`)
//! - `notification`, `unread_count`, `portfolio_metrics`
//! - `connection_status`, `error`, `pong`

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::subscription::{ChannelGroup, DataKind};

/// Opaque token linking a request frame to its reply.
pub type CorrelationId = String;

/// Frame types the messaging core itself interprets.
pub mod frame_type {
    /// Subscription control.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Subscription control.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Liveness reply.
    pub const PONG: &str = "pong";
    /// Server-side error.
    pub const ERROR: &str = "error";
    /// Market data envelope, discriminated by `data_type`.
    pub const MARKET_DATA: &str = "market_data";
    /// Notification feed item.
    pub const NOTIFICATION: &str = "notification";
    /// Notification badge counter.
    pub const UNREAD_COUNT: &str = "unread_count";
    /// Portfolio metrics snapshot.
    pub const PORTFOLIO_METRICS: &str = "portfolio_metrics";
    /// Server-reported connection status.
    pub const CONNECTION_STATUS: &str = "connection_status";
}

// =============================================================================
// Outbound Frames
// =============================================================================

/// A frame sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    /// Frame type.
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Frame payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Correlation id, present when a reply is expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,

    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl OutboundFrame {
    /// Create an uncorrelated frame.
    #[must_use]
    pub fn new(msg_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            id: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create a correlated request frame.
    #[must_use]
    pub fn request(msg_type: impl Into<String>, data: Value, id: CorrelationId) -> Self {
        Self {
            id: Some(id),
            ..Self::new(msg_type, Some(data))
        }
    }

    /// Create a correlated liveness probe.
    #[must_use]
    pub fn ping(id: CorrelationId) -> Self {
        Self {
            id: Some(id),
            ..Self::new(frame_type::PING, None)
        }
    }

    /// Create a subscribe frame for one channel group.
    #[must_use]
    pub fn subscribe(group: &ChannelGroup) -> Self {
        Self::new(
            frame_type::SUBSCRIBE,
            Some(SubscriptionPayload::from(group).to_value()),
        )
    }

    /// Create an unsubscribe frame for one channel group.
    #[must_use]
    pub fn unsubscribe(group: &ChannelGroup) -> Self {
        Self::new(
            frame_type::UNSUBSCRIBE,
            Some(SubscriptionPayload::from(group).to_value()),
        )
    }
}

/// Payload of `subscribe` / `unsubscribe` frames.
///
/// # Wire Format (JSON)
/// ```json
/// {"symbols": ["BTC/USD"], "data_types": ["quotes", "bars"]}
/// {"channels": ["notifications"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionPayload {
    /// Market data subscription.
    Market {
        /// Symbols to (un)subscribe.
        symbols: Vec<String>,
        /// Data kinds to (un)subscribe.
        data_types: Vec<DataKind>,
    },
    /// Named channel subscription.
    Channels {
        /// Channel names.
        channels: Vec<String>,
    },
}

impl SubscriptionPayload {
    fn to_value(&self) -> Value {
        match self {
            Self::Market {
                symbols,
                data_types,
            } => serde_json::json!({
                "symbols": symbols,
                "data_types": data_types.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            }),
            Self::Channels { channels } => serde_json::json!({ "channels": channels }),
        }
    }
}

impl From<&ChannelGroup> for SubscriptionPayload {
    fn from(group: &ChannelGroup) -> Self {
        match group {
            ChannelGroup::Market { symbol, kinds } => Self::Market {
                symbols: vec![symbol.clone()],
                data_types: kinds.clone(),
            },
            ChannelGroup::Channel(name) => Self::Channels {
                channels: vec![name.clone()],
            },
        }
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// A decoded frame received from the server.
///
/// Transient: decoded, dispatched and dropped. Nothing retains history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Frame type.
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Data discriminator for `market_data` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    /// Frame payload (`null` when absent).
    #[serde(default, rename = "data")]
    pub payload: Value,

    /// Correlation id echoed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,

    /// Server timestamp in milliseconds since the Unix epoch.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_millis"
    )]
    pub timestamp: Option<i64>,
}

impl InboundMessage {
    /// Create a message with a type and payload.
    #[must_use]
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data_type: None,
            payload,
            id: None,
            timestamp: None,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Most specific routing key: the `data_type` of a market data frame,
    /// otherwise the frame `type`.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        self.sub_type().unwrap_or(&self.msg_type)
    }

    /// The `data_type` of a market data frame (`bars`, `quotes`, ...).
    #[must_use]
    pub fn sub_type(&self) -> Option<&str> {
        match (&self.data_type, self.msg_type.as_str()) {
            (Some(data_type), frame_type::MARKET_DATA) => Some(data_type),
            _ => None,
        }
    }

    /// Keys the dispatcher serves, in order: the frame `type`, then the
    /// market data `data_type` when there is one.
    pub fn routing_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.msg_type.as_str())
            .chain(self.sub_type().filter(|sub| *sub != self.msg_type))
    }

    /// Check whether this is a server error frame.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.msg_type == frame_type::ERROR
    }

    /// Decode the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Decode a `market_data` frame into its typed form.
    ///
    /// Returns `None` for frames that are not market data or carry an
    /// unrecognised `data_type`.
    #[must_use]
    pub fn market_data(&self) -> Option<Result<MarketData, serde_json::Error>> {
        if self.msg_type != frame_type::MARKET_DATA {
            return None;
        }

        match self.data_type.as_deref()? {
            "bars" | "bar" => Some(self.decode_payload().map(MarketData::Bar)),
            "quotes" | "quote" => Some(self.decode_payload().map(MarketData::Quote)),
            "trades" | "trade" => Some(self.decode_payload().map(MarketData::Trade)),
            _ => None,
        }
    }

    /// Decode an `error` frame payload.
    #[must_use]
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if !self.is_error() {
            return None;
        }

        match &self.payload {
            Value::String(message) => Some(ErrorPayload {
                code: None,
                message: message.clone(),
            }),
            other => ErrorPayload::deserialize(other).ok(),
        }
    }
}

/// Accept a timestamp as integer millis, float millis, or an RFC 3339 string.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            #[allow(clippy::cast_possible_truncation)]
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64));
            millis
                .map(Some)
                .ok_or_else(|| de::Error::custom("timestamp out of range"))
        }
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.timestamp_millis()))
            .map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!(
            "expected numeric or RFC 3339 timestamp, got {other}"
        ))),
    }
}

// =============================================================================
// Typed Payloads
// =============================================================================

/// Market data decoded from a `market_data` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketData {
    /// OHLCV bar.
    Bar(Bar),
    /// Quote.
    Quote(Quote),
    /// Trade.
    Trade(Trade),
}

impl MarketData {
    /// Symbol the data belongs to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Bar(b) => &b.symbol,
            Self::Quote(q) => &q.symbol,
            Self::Trade(t) => &t.symbol,
        }
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Symbol.
    pub symbol: String,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Volume traded in the bar.
    pub volume: Decimal,
    /// Bar start time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Best bid/ask quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Symbol.
    pub symbol: String,
    /// Bid price.
    pub bid_price: Decimal,
    /// Bid size.
    #[serde(default)]
    pub bid_size: Decimal,
    /// Ask price.
    pub ask_price: Decimal,
    /// Ask size.
    #[serde(default)]
    pub ask_size: Decimal,
    /// Quote time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Quote {
    /// Ask minus bid.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }
}

/// Executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Symbol.
    pub symbol: String,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Trade time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Notification feed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification id.
    pub id: String,
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub message: String,
    /// Category, e.g. `order_filled` or `price_alert`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Whether the user has read it.
    #[serde(default)]
    pub read: bool,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Unread notification counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    /// Number of unread notifications.
    pub count: u64,
}

/// Portfolio metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    /// Total account value.
    pub total_value: Decimal,
    /// Available cash.
    #[serde(default)]
    pub cash: Decimal,
    /// Profit and loss for the day.
    #[serde(default)]
    pub day_pnl: Decimal,
    /// Day P&L as a percentage.
    #[serde(default)]
    pub day_pnl_percent: Decimal,
    /// Unrealized P&L across positions.
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    /// Number of open positions.
    #[serde(default)]
    pub positions_count: u32,
}

/// Server-reported connection status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusPayload {
    /// Status string, e.g. `connected` or `authenticated`.
    pub status: String,
    /// Optional detail.
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric error code (HTTP-like, e.g. 401).
    #[serde(default)]
    pub code: Option<i64>,
    /// Human readable message.
    #[serde(default, alias = "error")]
    pub message: String,
}

impl ErrorPayload {
    /// Check whether the error signals invalid or missing credentials.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.code, Some(401 | 403))
    }
}

// =============================================================================
// Tests
// =============================================================================
