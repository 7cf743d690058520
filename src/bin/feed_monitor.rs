//! Feed Monitor Binary
//!
//! Connects to a market feed, keeps the configured channels subscribed across
//! reconnects, and serves the live connection status over HTTP.
//!
//! Usage:
//!   feed-monitor --endpoint wss://feed.example.com/ws --channels BTCUSDT@kline_1m,BTCUSDT@trade
//!
//! Environment:
//!   FEED_WS_URL - Feed endpoint
//!   FEED_CHANNELS - Comma-separated channels to subscribe
//!   FEED_RECONNECT_INTERVAL_MS - Delay between retries (default: 5000)
//!   FEED_MAX_RECONNECT_ATTEMPTS - Retry bound (default: 5)
//!   FEED_CONNECT_TIMEOUT_MS - Per-attempt open timeout (optional)
//!   FEED_STATUS_PORT - Status HTTP port (default: 9091)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use betterbot_feed::metrics::ConnectionMetricsSnapshot;
use betterbot_feed::router::RouterStatsSnapshot;
use betterbot_feed::{ConnectionState, FeedClient, MarketStore, TransportConfig};

#[derive(Parser, Debug)]
#[command(name = "feed-monitor")]
#[command(about = "Market feed monitor - resilient subscription and status endpoint")]
struct Args {
    /// Feed WebSocket endpoint
    #[arg(long, env = "FEED_WS_URL")]
    endpoint: Option<String>,

    /// TOML transport config (overrides endpoint and retry flags)
    #[arg(long, env = "FEED_CONFIG")]
    config: Option<PathBuf>,

    /// Channels to subscribe to (comma-separated)
    #[arg(long, env = "FEED_CHANNELS", default_value = "")]
    channels: String,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, env = "FEED_RECONNECT_INTERVAL_MS", default_value = "5000")]
    reconnect_interval_ms: u64,

    /// Max consecutive automatic reconnect attempts
    #[arg(long, env = "FEED_MAX_RECONNECT_ATTEMPTS", default_value = "5")]
    max_reconnect_attempts: u32,

    /// Per-attempt connect timeout in milliseconds (optional)
    #[arg(long, env = "FEED_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Status HTTP port
    #[arg(long, env = "FEED_STATUS_PORT", default_value = "9091")]
    status_port: u16,
}

impl Args {
    fn transport_config(&self) -> Result<TransportConfig> {
        if let Some(path) = &self.config {
            return TransportConfig::load(path);
        }

        let endpoint = self
            .endpoint
            .clone()
            .context("--endpoint or FEED_WS_URL is required without --config")?;
        let mut config = TransportConfig::new(endpoint)
            .with_reconnect_interval_ms(self.reconnect_interval_ms)
            .with_max_reconnect_attempts(self.max_reconnect_attempts);
        if let Some(ms) = self.connect_timeout_ms {
            config = config.with_connect_timeout_ms(ms);
        }
        config.validate()?;
        Ok(config)
    }

    fn channel_list(&self) -> Vec<String> {
        self.channels
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    state: ConnectionState,
    channels: Vec<String>,
    connection: ConnectionMetricsSnapshot,
    router: RouterStatsSnapshot,
    prices: Vec<ChannelPrice>,
}

#[derive(Debug, Serialize)]
struct ChannelPrice {
    channel: String,
    last_price: Option<f64>,
    klines: usize,
    updated_at_ms: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("betterbot_feed=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.transport_config()?;
    let channels = args.channel_list();

    info!("Starting Feed Monitor");
    info!("  Endpoint: {}", config.endpoint());
    info!("  Channels: {:?}", channels);
    info!(
        "  Reconnect: every {}ms, up to {} attempts",
        config.reconnect_interval().as_millis(),
        config.max_reconnect_attempts()
    );

    let store = Arc::new(MarketStore::new());
    let client = FeedClient::new(config, store.clone())?;

    // Log every transition, including the instantaneous ERRORED ones
    let mut changes = client.status_changes();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => info!(
                    "Feed status {} -> {} ({}, attempt {})",
                    change.from, change.to, change.reason, change.attempt
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status_changes_lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for channel in &channels {
        client.subscribe(channel.as_str()).await;
    }

    let status_client = client.clone();
    let status_store = store.clone();
    let status_port = args.status_port;
    tokio::spawn(async move {
        if let Err(e) = start_status_server(status_port, status_client, status_store).await {
            warn!(error = %e, "status_server_failed");
        }
    });

    if let Err(e) = client.connect().await {
        // Retry policy keeps going in the background
        warn!(error = %e, "initial_connect_failed");
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
    client.shutdown().await;

    let metrics = client.metrics();
    info!(
        "Feed monitor stopped: {} connects, {} failures, {} drops",
        metrics.connect_successes, metrics.connect_failures, metrics.unplanned_disconnects
    );
    Ok(())
}

async fn start_status_server(port: u16, client: FeedClient, store: Arc<MarketStore>) -> Result<()> {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/status",
            get(move || {
                let client = client.clone();
                let store = store.clone();
                async move { Json(status_report(&client, &store).await) }
            }),
        );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("failed to bind status port {}", port))?;

    info!("Status server listening on port {}", port);
    axum::serve(listener, app).await.context("status server error")?;
    Ok(())
}

async fn status_report(client: &FeedClient, store: &MarketStore) -> StatusReport {
    let mut seen = store.channels();
    seen.sort();
    let prices = seen
        .into_iter()
        .map(|channel| ChannelPrice {
            last_price: store.last_price(&channel),
            klines: store.klines(&channel).len(),
            updated_at_ms: store.last_update_ms(&channel),
            channel,
        })
        .collect();

    StatusReport {
        state: client.status(),
        channels: client.channels().await,
        connection: client.metrics(),
        router: client.router_stats(),
        prices,
    }
}
