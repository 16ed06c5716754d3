//! Realtime Feeds Binary
//!
//! Connects to the dashboard's real-time feeds and logs what arrives.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin realtime-feeds
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_BASE_URL`: Page origin the socket URLs derive from, e.g. `https://app.example.com`
//!
//! ## Optional
//! - `FEED_AUTH_TOKEN`: Bearer token sent on the handshake
//! - `FEED_ACCOUNT_ID`: Enables the trading and portfolio feeds
//! - `FEED_SYMBOLS`: Comma-separated symbols for quotes and bars (default: none)
//! - `FEED_METRICS_PORT`: Prometheus port, 0 disables the listener (default: 9090)
//! - `FEED_CONNECT_TIMEOUT_MS`, `FEED_REQUEST_TIMEOUT_MS`: Timeouts (default: 10000)
//! - `FEED_HEARTBEAT_INTERVAL_SECS` / `FEED_HEARTBEAT_TIMEOUT_SECS`: Liveness probes (default: 30 / 10)
//! - `FEED_RECONNECT_BASE_MS`, `FEED_RECONNECT_GROWTH`, `FEED_RECONNECT_CAP_SECS`,
//!   `FEED_RECONNECT_JITTER_MS`, `FEED_MAX_RECONNECT_ATTEMPTS`: Backoff tuning
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter (default: `realtime_feeds=info`)

use std::time::Duration;

use anyhow::Context;
use realtime_feeds::infrastructure::telemetry;
use realtime_feeds::infrastructure::websocket::{
    ControllerConfig, FeedClient, FeedKind, connect_all,
};
use realtime_feeds::{
    ChannelKey, ClientConfig, DataKind, FeedStatus, InboundMessage, MarketData, init_metrics,
};
use tokio::signal;

/// Upper bound on the disconnect phase of shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting realtime feeds");

    let config = ClientConfig::from_env().context("invalid feed configuration")?;
    log_config(&config);

    let _metrics_handle = init_metrics(config.metrics_port).context("metrics init failed")?;

    let mut clients = vec![spawn_market_data(&config)?, spawn_notifications(&config)?];
    if let Some(account_id) = &config.account_id {
        clients.push(spawn_account_feed(
            &config,
            FeedKind::Trading {
                account_id: account_id.clone(),
            },
        )?);
        clients.push(spawn_account_feed(
            &config,
            FeedKind::Portfolio {
                account_id: account_id.clone(),
            },
        )?);
    }

    let connects = connect_all(&clients).await;
    for (client, result) in clients.iter().zip(connects) {
        if let Err(e) = result {
            tracing::warn!(feed = %client.feed(), error = %e, "Initial connect failed, retrying in background");
        }
    }

    tracing::info!(feeds = clients.len(), "Realtime feeds ready");

    await_shutdown().await?;

    let disconnects = futures::future::join_all(clients.iter().map(FeedClient::disconnect));
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, disconnects).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Feeds did not disconnect in time"
        );
    }

    tracing::info!("Realtime feeds stopped");
    Ok(())
}

fn spawn_client(config: &ClientConfig, feed: FeedKind) -> anyhow::Result<FeedClient> {
    let controller_config = ControllerConfig::from_client_config(config, feed)?;
    tracing::debug!(feed = %controller_config.feed, url = %controller_config.url, "Feed endpoint");

    let client = FeedClient::websocket(controller_config, config.auth_token.clone());
    client.on_status(log_status);
    Ok(client)
}

fn spawn_market_data(config: &ClientConfig) -> anyhow::Result<FeedClient> {
    let client = spawn_client(config, FeedKind::MarketData)?;

    for symbol in &config.symbols {
        for kind in [DataKind::Quotes, DataKind::Bars] {
            client.subscribe(ChannelKey::market(symbol.clone(), kind))?;
        }
    }

    let _ = client.register_handler("*", log_market_data);
    Ok(client)
}

fn spawn_notifications(config: &ClientConfig) -> anyhow::Result<FeedClient> {
    let client = spawn_client(config, FeedKind::Notifications)?;

    let _ = client.register_handler("notification", |message| {
        tracing::info!(payload = %message.payload, "Notification");
    });
    let _ = client.register_handler("unread_count", |message| {
        tracing::info!(payload = %message.payload, "Unread count");
    });
    Ok(client)
}

fn spawn_account_feed(config: &ClientConfig, feed: FeedKind) -> anyhow::Result<FeedClient> {
    let client = spawn_client(config, feed)?;
    let _ = client.register_handler("*", |message| {
        tracing::info!(msg_type = %message.msg_type, payload = %message.payload, "Account update");
    });
    Ok(client)
}

fn log_market_data(message: &InboundMessage) {
    match message.market_data() {
        Some(Ok(MarketData::Quote(quote))) => {
            tracing::debug!(symbol = %quote.symbol, bid = %quote.bid_price, ask = %quote.ask_price, "Quote");
        }
        Some(Ok(MarketData::Trade(trade))) => {
            tracing::debug!(symbol = %trade.symbol, price = %trade.price, size = %trade.size, "Trade");
        }
        Some(Ok(MarketData::Bar(bar))) => {
            tracing::debug!(symbol = %bar.symbol, close = %bar.close, volume = %bar.volume, "Bar");
        }
        Some(Err(e)) => tracing::warn!(error = %e, "Undecodable market data"),
        None => tracing::trace!(msg_type = %message.msg_type, "Market feed message"),
    }
}

fn log_status(status: &FeedStatus) {
    if status.gave_up() {
        tracing::error!(state = %status.state, reason = ?status.last_error, "Feed stopped reconnecting");
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        base_url = %config.base_url,
        account = config.account_id.is_some(),
        authenticated = config.auth_token.is_some(),
        symbols = config.symbols.len(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(settings = ?config.feed, "Feed settings");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
    Ok(())
}
