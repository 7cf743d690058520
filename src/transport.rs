//! Transport seam
//!
//! A [`Connector`] opens one [`Link`]: a write/close handle plus the stream of
//! events the peer produces. The connection manager owns the link
//! exclusively and only starts draining its events once subscriptions have
//! been replayed.
//!
//! Contract for implementations:
//! - `Transport::close` must eventually yield `TransportEvent::Closed` (or
//!   `Error`) on the link's event channel.
//! - Dropping the event sender is treated as a close.

use async_trait::async_trait;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
    tungstenite::Message,
};
use tracing::{debug, info, warn};

/// Event produced by an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed(Option<String>),
    Error(String),
}

/// Write side of an open connection
pub trait Transport: Send {
    /// Queue a text frame. `false` means the transport rejected the write.
    fn send_text(&mut self, text: String) -> bool;

    /// Begin a graceful close
    fn close(&mut self);
}

/// An opened connection
pub struct Link {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Link {
    pub fn new(
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { transport, events }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<Link>;
}

// =============================================================================
// WEBSOCKET CONNECTOR
// =============================================================================

/// tokio-tungstenite backed connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_config: WebSocketConfig,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            ws_config: WebSocketConfig {
                max_message_size: Some(16 * 1024 * 1024), // 16MB max message
                max_frame_size: Some(4 * 1024 * 1024),    // 4MB max frame
                accept_unmasked_frames: false,
                ..Default::default()
            },
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

struct WsTransport {
    out_tx: mpsc::UnboundedSender<Message>,
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: String) -> bool {
        self.out_tx.send(Message::Text(text)).is_ok()
    }

    fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        let _ = self.out_tx.send(Message::Close(Some(frame)));
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Link> {
        info!(endpoint, "ws_connecting");

        let (ws_stream, response) =
            connect_async_with_config(endpoint, Some(self.ws_config), false)
                .await
                .with_context(|| format!("failed to connect to {}", endpoint))?;

        info!(status = %response.status(), "ws_connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: sole owner of the sink half
        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "ws_write_failed");
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Reader: maps socket messages to transport events
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(TransportEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => {
                            if event_tx.send(TransportEvent::Frame(text)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(bytes = e.as_bytes().len(), "ws_binary_not_utf8");
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Pong(_)) => {
                        debug!("ws_pong");
                    }
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "ws_closed_by_peer");
                        let reason = frame.map(|f| f.reason.into_owned());
                        let _ = event_tx.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed(None));
        });

        Ok(Link::new(Box::new(WsTransport { out_tx }), event_rx))
    }
}
