//! BetterBot Market Feed Client
//!
//! Resilient client for a push-style market data feed: one long-lived
//! WebSocket, a desired-subscription set that survives reconnects, a bounded
//! fixed-interval retry policy, and routing of typed inbound messages
//! (price updates, trades, depth, tickers) into a [`sink::MarketSink`].
//!
//! Entry point is [`FeedClient`].

pub mod backoff;
pub mod client;
pub mod config;
mod manager;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod sink;
pub mod state;
pub mod transport;

pub use client::{ConnectError, FeedClient};
pub use config::TransportConfig;
pub use protocol::{Depth, Kline, MarketEvent, MessageKind, Trade};
pub use sink::{EventForwarder, MarketSink, MarketStore};
pub use state::{ConnectionState, StatusChange, TransitionReason};
pub use transport::{Connector, Link, Transport, TransportEvent, WsConnector};
