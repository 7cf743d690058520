//! Public feed client
//!
//! [`FeedClient`] is a cheap, cloneable handle onto the connection manager
//! task. Every mutating call is a message to that task; status reads come
//! straight off a `watch` channel and never wait on it.
//!
//! ```ignore
//! let store = Arc::new(MarketStore::new());
//! let client = FeedClient::new(TransportConfig::from_env()?, store.clone())?;
//! client.subscribe("BTCUSDT@kline_1m").await;
//! client.connect().await?;
//! ```

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::warn;

use crate::config::TransportConfig;
use crate::manager::{Command, ConnectionManager, ManagerEvent, ManagerOutputs};
use crate::metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
use crate::router::{MessageRouter, RouterStats, RouterStatsSnapshot};
use crate::sink::MarketSink;
use crate::state::{ConnectionState, StatusChange};
use crate::transport::{Connector, WsConnector};

/// Buffered status changes per subscriber before it starts lagging
const STATUS_CHANGE_CAPACITY: usize = 64;

/// Why a `connect` call did not end up connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The open attempt failed; a retry may already be scheduled
    Open(String),
    /// A disconnect arrived while the attempt was in flight
    Aborted,
    /// The client has been shut down
    Shutdown,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Open(reason) => write!(f, "connect failed: {}", reason),
            ConnectError::Aborted => write!(f, "connect aborted by disconnect"),
            ConnectError::Shutdown => write!(f, "feed client shut down"),
        }
    }
}

impl std::error::Error for ConnectError {}

#[derive(Clone)]
pub struct FeedClient {
    inbox: mpsc::UnboundedSender<ManagerEvent>,
    status: watch::Receiver<ConnectionState>,
    changes: broadcast::Sender<StatusChange>,
    metrics: Arc<ConnectionMetrics>,
    router_stats: Arc<RouterStats>,
}

impl FeedClient {
    /// WebSocket-backed client. Must be called inside a Tokio runtime.
    pub fn new(config: TransportConfig, sink: Arc<dyn MarketSink>) -> Result<Self> {
        Self::with_connector(config, Arc::new(WsConnector::new()), sink)
    }

    /// Client over an arbitrary [`Connector`]
    pub fn with_connector(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn MarketSink>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .context("FeedClient must be created inside a Tokio runtime")?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, status) = watch::channel(ConnectionState::Closed);
        let (changes, _) = broadcast::channel(STATUS_CHANGE_CAPACITY);
        let metrics = Arc::new(ConnectionMetrics::new());
        let router = MessageRouter::new(sink);
        let router_stats = router.stats().clone();

        let manager = ConnectionManager::new(
            config,
            connector,
            router,
            ManagerOutputs {
                state_tx,
                changes: changes.clone(),
                metrics: metrics.clone(),
            },
            inbox_tx.downgrade(),
        );
        runtime.spawn(manager.run(inbox_rx));

        Ok(Self {
            inbox: inbox_tx,
            status,
            changes,
            metrics,
            router_stats,
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(ManagerEvent::Command(build(tx))).ok()?;
        rx.await.ok()
    }

    /// Resolves once connected, or with the reason this attempt failed.
    /// Concurrent callers share a single attempt.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.request(Command::Connect)
            .await
            .unwrap_or(Err(ConnectError::Shutdown))
    }

    /// Close the connection and cancel any pending retry. Subscriptions are
    /// kept for the next `connect`.
    pub async fn disconnect(&self) {
        let _ = self.request(Command::Disconnect).await;
    }

    /// `true` when the channel is live on the wire now. `false` still records
    /// it; it is sent on the next successful connect.
    pub async fn subscribe(&self, channel: impl Into<String>) -> bool {
        let channel = channel.into();
        self.request(|reply| Command::Subscribe { channel, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn unsubscribe(&self, channel: impl Into<String>) -> bool {
        let channel = channel.into();
        self.request(|reply| Command::Unsubscribe { channel, reply })
            .await
            .unwrap_or(false)
    }

    /// Raw text frame. Dropped (returns `false`) unless connected.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.request(|reply| Command::Send { text, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn send_json<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send(text).await,
            Err(e) => {
                warn!(error = %e, "outbound_encode_failed");
                false
            }
        }
    }

    /// Desired channel set, sorted
    pub async fn channels(&self) -> Vec<String> {
        self.request(Command::Channels).await.unwrap_or_default()
    }

    /// Tear everything down. Later calls fail fast.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Every transition from now on, including instantaneous ones
    pub fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    pub fn metrics(&self) -> ConnectionMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn router_stats(&self) -> RouterStatsSnapshot {
        self.router_stats.snapshot()
    }
}

impl fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedClient")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
