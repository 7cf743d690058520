//! Feed wire protocol
//!
//! Inbound: one JSON object per frame
//! `{ "kind": "price-update"|"trade"|"depth-update"|"ticker", "channel": "...", "payload": ... }`.
//! Older producers send `type`/`symbol`/`data` and `kline`/`depth`; both spellings decode.
//!
//! Outbound control: `{ "action": "subscribe"|"unsubscribe", "channel": "..." }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// INBOUND
// =============================================================================

/// Closed set of domain message categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "price-update", alias = "kline")]
    PriceUpdate,
    #[serde(rename = "trade")]
    Trade,
    #[serde(rename = "depth-update", alias = "depth")]
    DepthUpdate,
    #[serde(rename = "ticker")]
    Ticker,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "price-update" | "kline" => Some(Self::PriceUpdate),
            "trade" => Some(Self::Trade),
            "depth-update" | "depth" => Some(Self::DepthUpdate),
            "ticker" => Some(Self::Ticker),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceUpdate => "price-update",
            Self::Trade => "trade",
            Self::DepthUpdate => "depth-update",
            Self::Ticker => "ticker",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(alias = "type")]
    kind: String,
    #[serde(alias = "symbol")]
    channel: String,
    #[serde(default, alias = "data")]
    payload: Value,
}

/// Decoded form of one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub kind: MessageKind,
    pub channel: String,
    pub payload: Value,
}

impl InboundEnvelope {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = MessageKind::parse(&raw.kind).ok_or(DecodeError::UnknownKind(raw.kind))?;
        Ok(Self {
            kind,
            channel: raw.channel,
            payload: raw.payload,
        })
    }

    /// Interpret the payload according to `kind`
    pub fn into_event(self) -> Result<(String, MarketEvent), DecodeError> {
        let kind = self.kind;
        let invalid = |e: serde_json::Error| DecodeError::InvalidPayload {
            kind,
            reason: e.to_string(),
        };
        let event = match kind {
            MessageKind::PriceUpdate => {
                MarketEvent::PriceUpdate(serde_json::from_value(self.payload).map_err(invalid)?)
            }
            MessageKind::Trade => {
                MarketEvent::Trade(serde_json::from_value(self.payload).map_err(invalid)?)
            }
            MessageKind::DepthUpdate => {
                MarketEvent::DepthUpdate(serde_json::from_value(self.payload).map_err(invalid)?)
            }
            MessageKind::Ticker => MarketEvent::Ticker(self.payload),
        };
        Ok((self.channel, event))
    }
}

/// Candlestick bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Bar open time (ms since epoch)
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    pub time: i64,
    pub is_buyer_maker: bool,
}

/// `[price, quantity]`
pub type PriceLevel = (f64, f64);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Depth {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Typed payload of a decoded envelope
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    PriceUpdate(Kline),
    Trade(Trade),
    DepthUpdate(Depth),
    /// Ticker payloads are passed through uninterpreted
    Ticker(Value),
}

impl MarketEvent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::PriceUpdate(_) => MessageKind::PriceUpdate,
            Self::Trade(_) => MessageKind::Trade,
            Self::DepthUpdate(_) => MessageKind::DepthUpdate,
            Self::Ticker(_) => MessageKind::Ticker,
        }
    }
}

/// Errors while decoding an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Malformed(String),
    UnknownKind(String),
    InvalidPayload { kind: MessageKind, reason: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {}", e),
            Self::UnknownKind(k) => write!(f, "unknown message kind: {:?}", k),
            Self::InvalidPayload { kind, reason } => {
                write!(f, "invalid {} payload: {}", kind, reason)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// =============================================================================
// OUTBOUND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// Subscribe/unsubscribe control frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub action: ControlAction,
    pub channel: String,
}

impl ControlFrame {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            channel: channel.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_wire_format() {
        let json = ControlFrame::subscribe("BTCUSDT@kline").encode().unwrap();
        assert_eq!(json, r#"{"action":"subscribe","channel":"BTCUSDT@kline"}"#);

        let json = ControlFrame::unsubscribe("ETHUSDT@trade").encode().unwrap();
        assert_eq!(json, r#"{"action":"unsubscribe","channel":"ETHUSDT@trade"}"#);
    }

    #[test]
    fn test_decode_trade() {
        let text = r#"{
            "kind": "trade",
            "channel": "BTCUSDT@trade",
            "payload": {"id": "t-1", "price": 64000.5, "quantity": 0.25, "time": 1700000000000, "isBuyerMaker": true}
        }"#;
        let envelope = InboundEnvelope::decode(text).unwrap();
        assert_eq!(envelope.kind, MessageKind::Trade);

        let (channel, event) = envelope.into_event().unwrap();
        assert_eq!(channel, "BTCUSDT@trade");
        match event {
            MarketEvent::Trade(trade) => {
                assert_eq!(trade.id, "t-1");
                assert!(trade.is_buyer_maker);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_legacy_field_names() {
        let text = r#"{"type":"depth","symbol":"BTCUSDT","data":{"bids":[[100.0,1.5]],"asks":[[101.0,2.0],[102.0,3.0]]}}"#;
        let (channel, event) = InboundEnvelope::decode(text).unwrap().into_event().unwrap();
        assert_eq!(channel, "BTCUSDT");
        match event {
            MarketEvent::DepthUpdate(depth) => {
                assert_eq!(depth.bids, vec![(100.0, 1.5)]);
                assert_eq!(depth.asks.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_kline_alias() {
        let text = r#"{"kind":"kline","channel":"BTCUSDT@kline","payload":{"time":1,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10.0}}"#;
        let envelope = InboundEnvelope::decode(text).unwrap();
        assert_eq!(envelope.kind, MessageKind::PriceUpdate);
    }

    #[test]
    fn test_unknown_kind() {
        let text = r#"{"kind":"liquidation","channel":"x","payload":{}}"#;
        assert_eq!(
            InboundEnvelope::decode(text),
            Err(DecodeError::UnknownKind("liquidation".to_string()))
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            InboundEnvelope::decode("PONG"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            InboundEnvelope::decode(r#"{"kind":"trade"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_payload_mismatch() {
        let text = r#"{"kind":"price-update","channel":"x","payload":{"price":1.0}}"#;
        let err = InboundEnvelope::decode(text).unwrap().into_event().unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidPayload {
                kind: MessageKind::PriceUpdate,
                ..
            }
        ));
    }

    #[test]
    fn test_ticker_passthrough() {
        let text = r#"{"kind":"ticker","channel":"BTCUSDT@ticker","payload":{"last":"64000.1"}}"#;
        let (_, event) = InboundEnvelope::decode(text).unwrap().into_event().unwrap();
        assert_eq!(
            event,
            MarketEvent::Ticker(serde_json::json!({"last": "64000.1"}))
        );
    }
}
