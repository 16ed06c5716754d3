//! Configuration Module
//!
//! Environment-driven configuration for the feed clients.

mod settings;

pub use settings::{AuthToken, ClientConfig, ConfigError, FeedSettings};
