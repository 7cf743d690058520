//! Inbound message router
//!
//! Decodes each frame into an [`InboundEnvelope`] and hands its payload to the
//! matching [`MarketSink`] entry point. A frame that fails to decode, names an
//! unknown kind, or carries a payload that does not fit its kind is logged,
//! counted and dropped. Nothing here can tear the connection down.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::{DecodeError, InboundEnvelope, MarketEvent, MessageKind};
use crate::sink::MarketSink;

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Default)]
pub struct RouterStats {
    pub frames_received: AtomicU64,
    pub frames_dispatched: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub unknown_kind: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub frames_received: u64,
    pub frames_dispatched: u64,
    pub frames_discarded: u64,
    pub unknown_kind: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            unknown_kind: self.unknown_kind.load(Ordering::Relaxed),
        }
    }
}

pub struct MessageRouter {
    sink: Arc<dyn MarketSink>,
    stats: Arc<RouterStats>,
}

impl MessageRouter {
    pub fn new(sink: Arc<dyn MarketSink>) -> Self {
        Self {
            sink,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Decode and dispatch one frame. Errors are returned for callers that
    /// care; [`handle_frame`](Self::handle_frame) is the non-fatal wrapper.
    pub fn route(&self, text: &str) -> Result<MessageKind, DecodeError> {
        let (channel, event) = InboundEnvelope::decode(text)?.into_event()?;
        let kind = event.kind();

        match event {
            MarketEvent::PriceUpdate(kline) => self.sink.on_price_update(&channel, kline),
            MarketEvent::Trade(trade) => self.sink.on_trade(&channel, trade),
            MarketEvent::DepthUpdate(depth) => self.sink.on_depth_update(&channel, depth),
            MarketEvent::Ticker(ticker) => self.sink.on_ticker(&channel, ticker),
        }

        Ok(kind)
    }

    pub fn handle_frame(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match self.route(text) {
            Ok(kind) => {
                self.stats.frames_dispatched.fetch_add(1, Ordering::Relaxed);
                if tracing::enabled!(tracing::Level::DEBUG) {
                    debug!(kind = %kind, "frame_dispatched");
                }
            }
            Err(e) => {
                self.stats.frames_discarded.fetch_add(1, Ordering::Relaxed);
                if matches!(e, DecodeError::UnknownKind(_)) {
                    self.stats.unknown_kind.fetch_add(1, Ordering::Relaxed);
                }
                warn!(error = %e, frame = preview(text), "frame_discarded");
            }
        }
    }
}

/// First `PREVIEW_CHARS` characters, cut on a char boundary
fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
