//! Subscription Registry
//!
//! Domain types for tracking which logical feeds the client currently wants.
//!
//! # Design
//!
//! The registry tracks two families of channel keys:
//! - Market data keys: `(symbol, data kind)`, grouped by symbol
//! - Named channels: opaque account/notification stream names
//!
//! The registry is the single source of truth for replay. After every
//! successful (re)connect the controller walks [`SubscriptionRegistry::replay_all`]
//! and re-issues one subscribe message per group, so the replay always reflects
//! the live set rather than whatever was wanted when the socket dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// A symbol string (ticker or crypto pair such as `BTC/USD`).
pub type Symbol = String;

/// Kind of market data carried by a symbol subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Top-of-book quotes.
    Quotes,
    /// Executed trades.
    Trades,
    /// OHLCV bars.
    Bars,
    /// Order book depth.
    Orderbook,
}

impl DataKind {
    /// Get all data kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Quotes, Self::Trades, Self::Bars, Self::Orderbook]
    }

    /// Wire name of the data kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quotes => "quotes",
            Self::Trades => "trades",
            Self::Bars => "bars",
            Self::Orderbook => "orderbook",
        }
    }

    /// Parse a data kind, ignoring case. Returns `None` for unknown names.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "quotes" | "quote" => Some(Self::Quotes),
            "trades" | "trade" => Some(Self::Trades),
            "bars" | "bar" => Some(Self::Bars),
            "orderbook" => Some(Self::Orderbook),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one logical subscribable feed.
///
/// Equality is structural: two keys naming the same symbol and kind (or the
/// same channel) are the same subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    /// Market data for one symbol and data kind.
    Market {
        /// Instrument symbol.
        symbol: Symbol,
        /// Kind of data wanted for the symbol.
        kind: DataKind,
    },
    /// Opaque account or notification channel.
    Channel(String),
}

impl ChannelKey {
    /// Create a market data key.
    #[must_use]
    pub fn market(symbol: impl Into<Symbol>, kind: DataKind) -> Self {
        Self::Market {
            symbol: symbol.into(),
            kind,
        }
    }

    /// Create a named channel key.
    #[must_use]
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market { symbol, kind } => write!(f, "{symbol}:{kind}"),
            Self::Channel(name) => write!(f, "#{name}"),
        }
    }
}

/// A replayable group of channel keys: one symbol with all its kinds, or
/// one named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelGroup {
    /// One symbol and every data kind wanted for it.
    Market {
        /// Instrument symbol.
        symbol: Symbol,
        /// Data kinds, in stable order.
        kinds: Vec<DataKind>,
    },
    /// One named channel.
    Channel(String),
}

impl From<&ChannelKey> for ChannelGroup {
    fn from(key: &ChannelKey) -> Self {
        match key {
            ChannelKey::Market { symbol, kind } => Self::Market {
                symbol: symbol.clone(),
                kinds: vec![*kind],
            },
            ChannelKey::Channel(name) => Self::Channel(name.clone()),
        }
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Desired subscriptions for one connection controller.
///
/// Survives reconnects; only an explicit disconnect clears it. A symbol whose
/// last data kind is removed is dropped entirely, never kept with an empty set.
///
/// # Example
///
/// ```rust
/// use realtime_feeds::domain::subscription::{ChannelKey, DataKind, SubscriptionRegistry};
///
/// let mut registry = SubscriptionRegistry::new();
/// let key = ChannelKey::market("BTC/USD", DataKind::Quotes);
///
/// assert!(registry.add(&key));
/// assert!(!registry.add(&key)); // already present
///
/// assert!(registry.remove(&key));
/// assert!(!registry.remove(&key)); // idempotent
/// assert!(registry.is_empty());
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    symbols: BTreeMap<Symbol, BTreeSet<DataKind>>,
    channels: BTreeSet<String>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel key.
    ///
    /// Returns `true` if the key was not already present.
    pub fn add(&mut self, key: &ChannelKey) -> bool {
        match key {
            ChannelKey::Market { symbol, kind } => {
                self.symbols.entry(symbol.clone()).or_default().insert(*kind)
            }
            ChannelKey::Channel(name) => self.channels.insert(name.clone()),
        }
    }

    /// Remove a channel key.
    ///
    /// Returns `true` if the key was present. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &ChannelKey) -> bool {
        match key {
            ChannelKey::Market { symbol, kind } => {
                let Some(kinds) = self.symbols.get_mut(symbol) else {
                    return false;
                };

                let removed = kinds.remove(kind);

                if kinds.is_empty() {
                    self.symbols.remove(symbol);
                }

                removed
            }
            ChannelKey::Channel(name) => self.channels.remove(name),
        }
    }

    /// Check whether a key is currently wanted.
    #[must_use]
    pub fn contains(&self, key: &ChannelKey) -> bool {
        match key {
            ChannelKey::Market { symbol, kind } => {
                self.symbols.get(symbol).is_some_and(|k| k.contains(kind))
            }
            ChannelKey::Channel(name) => self.channels.contains(name),
        }
    }

    /// Data kinds currently wanted for a symbol.
    #[must_use]
    pub fn kinds_for(&self, symbol: &str) -> Vec<DataKind> {
        self.symbols
            .get(symbol)
            .map(|k| k.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Groups to re-subscribe after a reconnect, built from the live state.
    ///
    /// Symbols come first in lexical order, then named channels.
    #[must_use]
    pub fn replay_all(&self) -> Vec<ChannelGroup> {
        let markets = self.symbols.iter().map(|(symbol, kinds)| ChannelGroup::Market {
            symbol: symbol.clone(),
            kinds: kinds.iter().copied().collect(),
        });
        let channels = self.channels.iter().cloned().map(ChannelGroup::Channel);

        markets.chain(channels).collect()
    }

    /// Total number of channel keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.values().map(BTreeSet::len).sum::<usize>() + self.channels.len()
    }

    /// Check if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.channels.is_empty()
    }

    /// Forget every subscription.
    pub fn clear(&mut self) {
        self.symbols.clear();
        self.channels.clear();
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            symbol_count: self.symbols.len(),
            channel_count: self.channels.len(),
            key_count: self.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry size summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of distinct symbols.
    pub symbol_count: usize,
    /// Number of named channels.
    pub channel_count: usize,
    /// Number of channel keys across both families.
    pub key_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn quotes(symbol: &str) -> ChannelKey {
        ChannelKey::market(symbol, DataKind::Quotes)
    }

    #[test]
    fn add_groups_kinds_by_symbol() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(&ChannelKey::market("AAPL", DataKind::Quotes));
        registry.add(&ChannelKey::market("AAPL", DataKind::Bars));
        registry.add(&ChannelKey::market("MSFT", DataKind::Trades));

        assert_eq!(
            registry.kinds_for("AAPL"),
            vec![DataKind::Quotes, DataKind::Bars]
        );
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.stats().symbol_count, 2);
    }

    #[test]
    fn removing_last_kind_drops_symbol_entry() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(&quotes("AAPL"));
        registry.remove(&quotes("AAPL"));

        assert!(registry.is_empty());
        assert!(registry.replay_all().is_empty());
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[test]
    fn unsubscribe_twice_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(&quotes("BTC/USD"));

        assert!(registry.remove(&quotes("BTC/USD")));
        assert!(!registry.remove(&quotes("BTC/USD")));
        assert!(!registry.contains(&quotes("BTC/USD")));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_kind_keeps_other_kinds() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(&quotes("AAPL"));

        assert!(!registry.remove(&ChannelKey::market("AAPL", DataKind::Trades)));
        assert_eq!(registry.kinds_for("AAPL"), vec![DataKind::Quotes]);
    }

    #[test]
    fn replay_of_empty_registry_is_empty() {
        assert!(SubscriptionRegistry::new().replay_all().is_empty());
    }

    #[test]
    fn replay_lists_symbols_then_channels() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(&ChannelKey::channel("notifications"));
        registry.add(&ChannelKey::market("MSFT", DataKind::Bars));
        registry.add(&quotes("AAPL"));

        assert_eq!(
            registry.replay_all(),
            vec![
                ChannelGroup::Market {
                    symbol: "AAPL".to_string(),
                    kinds: vec![DataKind::Quotes],
                },
                ChannelGroup::Market {
                    symbol: "MSFT".to_string(),
                    kinds: vec![DataKind::Bars],
                },
                ChannelGroup::Channel("notifications".to_string()),
            ]
        );
    }

    #[test]
    fn replay_reflects_latest_state() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(&quotes("AAPL"));
        registry.add(&quotes("MSFT"));
        let before = registry.replay_all();

        registry.remove(&quotes("AAPL"));
        let after = registry.replay_all();

        assert_eq!(before.len(), 2);
        assert_eq!(
            after,
            vec![ChannelGroup::Market {
                symbol: "MSFT".to_string(),
                kinds: vec![DataKind::Quotes],
            }]
        );
    }

    #[test]
    fn data_kind_parsing() {
        assert_eq!(
            DataKind::from_str_case_insensitive("Quotes"),
            Some(DataKind::Quotes)
        );
        assert_eq!(
            DataKind::from_str_case_insensitive("bar"),
            Some(DataKind::Bars)
        );
        assert_eq!(DataKind::from_str_case_insensitive("news"), None);
    }

    #[test]
    fn channel_key_display() {
        assert_eq!(quotes("BTC/USD").to_string(), "BTC/USD:quotes");
        assert_eq!(ChannelKey::channel("orders").to_string(), "#orders");
    }

    fn arb_key() -> impl Strategy<Value = ChannelKey> {
        let symbol = prop::sample::select(vec!["AAPL", "MSFT", "BTC/USD", "ETH/USD"]);
        let kind = prop::sample::select(DataKind::all().to_vec());
        let channel = prop::sample::select(vec!["orders", "notifications", "portfolio"]);

        prop_oneof![
            (symbol, kind).prop_map(|(s, k)| ChannelKey::market(s, k)),
            channel.prop_map(ChannelKey::channel),
        ]
    }

    proptest! {
        #[test]
        fn add_then_remove_leaves_no_residue(
            existing in prop::collection::vec(arb_key(), 0..12),
            key in arb_key(),
        ) {
            let mut registry = SubscriptionRegistry::new();
            for k in &existing {
                registry.add(k);
            }
            prop_assume!(!registry.contains(&key));

            let before = registry.clone();
            registry.add(&key);
            registry.remove(&key);

            prop_assert_eq!(registry, before);
        }

        #[test]
        fn replay_never_contains_empty_groups(
            ops in prop::collection::vec((any::<bool>(), arb_key()), 0..40),
        ) {
            let mut registry = SubscriptionRegistry::new();
            for (subscribe, key) in &ops {
                if *subscribe {
                    registry.add(key);
                } else {
                    registry.remove(key);
                }
            }

            for group in registry.replay_all() {
                if let ChannelGroup::Market { kinds, .. } = group {
                    prop_assert!(!kinds.is_empty());
                }
            }
        }
    }
}
