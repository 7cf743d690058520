//! State-update sinks
//!
//! The router forwards every decoded envelope to exactly one entry point of a
//! [`MarketSink`]. How the sink stores or renders the data is its own business;
//! [`MarketStore`] is an in-memory store for consumers that just want the
//! latest view per channel.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{Depth, Kline, MarketEvent, Trade};

/// Receiver of routed market data, one method per message category
pub trait MarketSink: Send + Sync {
    fn on_price_update(&self, channel: &str, kline: Kline);
    fn on_trade(&self, channel: &str, trade: Trade);
    fn on_depth_update(&self, channel: &str, depth: Depth);
    fn on_ticker(&self, channel: &str, ticker: Value);
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

pub const MAX_KLINES_PER_CHANNEL: usize = 1000;
pub const MAX_TRADES_PER_CHANNEL: usize = 100;

#[derive(Debug, Default)]
struct ChannelBook {
    klines: VecDeque<Kline>,
    /// Newest first
    trades: VecDeque<Trade>,
    depth: Option<Depth>,
    ticker: Option<Value>,
    last_price: Option<f64>,
    updated_at_ms: i64,
}

/// Latest market view per channel
#[derive(Debug, Default)]
pub struct MarketStore {
    channels: RwLock<HashMap<String, ChannelBook>>,
}

impl MarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut ChannelBook)>(&self, channel: &str, f: F) {
        let mut channels = self.channels.write();
        let book = channels.entry(channel.to_string()).or_default();
        f(book);
        book.updated_at_ms = chrono::Utc::now().timestamp_millis();
    }

    pub fn klines(&self, channel: &str) -> Vec<Kline> {
        self.channels
            .read()
            .get(channel)
            .map(|b| b.klines.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Recent trades, newest first
    pub fn trades(&self, channel: &str) -> Vec<Trade> {
        self.channels
            .read()
            .get(channel)
            .map(|b| b.trades.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, channel: &str) -> Option<Depth> {
        self.channels.read().get(channel)?.depth.clone()
    }

    pub fn ticker(&self, channel: &str) -> Option<Value> {
        self.channels.read().get(channel)?.ticker.clone()
    }

    pub fn last_price(&self, channel: &str) -> Option<f64> {
        self.channels.read().get(channel)?.last_price
    }

    pub fn last_update_ms(&self, channel: &str) -> Option<i64> {
        self.channels.read().get(channel).map(|b| b.updated_at_ms)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }
}

impl MarketSink for MarketStore {
    fn on_price_update(&self, channel: &str, kline: Kline) {
        self.update(channel, |book| {
            // Same bar time replaces the open bar, anything else starts a new one
            match book.klines.back_mut() {
                Some(last) if last.time == kline.time => *last = kline,
                _ => {
                    book.klines.push_back(kline);
                    if book.klines.len() > MAX_KLINES_PER_CHANNEL {
                        book.klines.pop_front();
                    }
                }
            }
        });
    }

    fn on_trade(&self, channel: &str, trade: Trade) {
        self.update(channel, |book| {
            book.last_price = Some(trade.price);
            book.trades.push_front(trade);
            book.trades.truncate(MAX_TRADES_PER_CHANNEL);
        });
    }

    fn on_depth_update(&self, channel: &str, depth: Depth) {
        self.update(channel, |book| book.depth = Some(depth));
    }

    fn on_ticker(&self, channel: &str, ticker: Value) {
        self.update(channel, |book| book.ticker = Some(ticker));
    }
}

// =============================================================================
// CHANNEL FORWARDER
// =============================================================================

/// Forwards routed events into an unbounded channel for async consumers
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<(String, MarketEvent)>,
}

impl EventForwarder {
    /// Returns the sink and the receiver side of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, MarketEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, channel: &str, event: MarketEvent) {
        // Receiver gone: consumer stopped listening, nothing to do
        let _ = self.tx.send((channel.to_string(), event));
    }
}

impl MarketSink for EventForwarder {
    fn on_price_update(&self, channel: &str, kline: Kline) {
        self.forward(channel, MarketEvent::PriceUpdate(kline));
    }

    fn on_trade(&self, channel: &str, trade: Trade) {
        self.forward(channel, MarketEvent::Trade(trade));
    }

    fn on_depth_update(&self, channel: &str, depth: Depth) {
        self.forward(channel, MarketEvent::DepthUpdate(depth));
    }

    fn on_ticker(&self, channel: &str, ticker: Value) {
        self.forward(channel, MarketEvent::Ticker(ticker));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(time: i64, close: f64) -> Kline {
        Kline {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn trade(id: usize, price: f64) -> Trade {
        Trade {
            id: format!("t-{}", id),
            price,
            quantity: 1.0,
            time: id as i64,
            is_buyer_maker: false,
        }
    }

    #[test]
    fn test_kline_same_time_replaces_last_bar() {
        let store = MarketStore::new();
        store.on_price_update("BTCUSDT", kline(60_000, 100.0));
        store.on_price_update("BTCUSDT", kline(60_000, 101.0));
        store.on_price_update("BTCUSDT", kline(120_000, 102.0));

        let klines = store.klines("BTCUSDT");
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].close, 101.0);
        assert_eq!(klines[1].close, 102.0);
    }

    #[test]
    fn test_kline_history_is_capped() {
        let store = MarketStore::new();
        for i in 0..(MAX_KLINES_PER_CHANNEL as i64 + 5) {
            store.on_price_update("BTCUSDT", kline(i, i as f64));
        }
        let klines = store.klines("BTCUSDT");
        assert_eq!(klines.len(), MAX_KLINES_PER_CHANNEL);
        assert_eq!(klines[0].time, 5);
    }

    #[test]
    fn test_trades_newest_first_and_capped() {
        let store = MarketStore::new();
        for i in 0..(MAX_TRADES_PER_CHANNEL + 10) {
            store.on_trade("ETHUSDT", trade(i, 3000.0 + i as f64));
        }

        let trades = store.trades("ETHUSDT");
        assert_eq!(trades.len(), MAX_TRADES_PER_CHANNEL);
        assert_eq!(trades[0].id, format!("t-{}", MAX_TRADES_PER_CHANNEL + 9));
        assert_eq!(
            store.last_price("ETHUSDT"),
            Some(3000.0 + (MAX_TRADES_PER_CHANNEL + 9) as f64)
        );
    }

    #[test]
    fn test_depth_and_ticker_replace() {
        let store = MarketStore::new();
        store.on_depth_update(
            "BTCUSDT",
            Depth {
                bids: vec![(1.0, 1.0)],
                asks: vec![],
            },
        );
        store.on_depth_update(
            "BTCUSDT",
            Depth {
                bids: vec![(2.0, 1.0)],
                asks: vec![(3.0, 1.0)],
            },
        );
        store.on_ticker("BTCUSDT", serde_json::json!({"last": 2.5}));

        let depth = store.depth("BTCUSDT").unwrap();
        assert_eq!(depth.bids, vec![(2.0, 1.0)]);
        assert_eq!(store.ticker("BTCUSDT"), Some(serde_json::json!({"last": 2.5})));
        assert!(store.last_update_ms("BTCUSDT").is_some());
        assert!(store.depth("ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn test_forwarder_delivers_in_order() {
        let (sink, mut rx) = EventForwarder::new();
        sink.on_trade("a", trade(1, 1.0));
        sink.on_ticker("b", Value::Null);

        let (channel, event) = rx.recv().await.unwrap();
        assert_eq!(channel, "a");
        assert!(matches!(event, MarketEvent::Trade(_)));
        let (channel, _) = rx.recv().await.unwrap();
        assert_eq!(channel, "b");
    }
}
