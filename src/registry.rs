//! Subscription registry
//!
//! Holds the *desired* channel set, independent of connection state. The set
//! only shrinks through `unsubscribe` or `clear`; a dropped connection never
//! touches it. After every successful connect the manager calls
//! [`SubscriptionRegistry::replay_all`] so consumers never re-subscribe by hand.
//!
//! Alongside it the registry tracks which channels had a subscribe frame
//! accepted on the current link. That set is wiped whenever the link goes
//! away, so a rejected write is retried by the next `subscribe` call.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::protocol::ControlFrame;
use crate::transport::Transport;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: HashSet<String>,
    /// Accepted on the current link; always a subset of `channels`
    live: HashSet<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `channel`. `wire` is the live transport when connected.
    ///
    /// Returns `true` when the channel is live on the wire after the call:
    /// either a subscribe frame was just accepted, or one was accepted earlier
    /// on this connection.
    pub fn subscribe(&mut self, channel: &str, wire: Option<&mut dyn Transport>) -> bool {
        self.channels.insert(channel.to_string());

        match wire {
            Some(_) if self.live.contains(channel) => true,
            Some(wire) => {
                let accepted = send_control(wire, ControlFrame::subscribe(channel));
                if accepted {
                    self.live.insert(channel.to_string());
                }
                accepted
            }
            None => {
                debug!(channel, "subscription_queued");
                false
            }
        }
    }

    /// Forget `channel`, telling the peer when connected
    pub fn unsubscribe(&mut self, channel: &str, wire: Option<&mut dyn Transport>) -> bool {
        self.channels.remove(channel);
        self.live.remove(channel);

        match wire {
            Some(wire) => send_control(wire, ControlFrame::unsubscribe(channel)),
            None => false,
        }
    }

    /// One subscribe frame per desired channel on a fresh link. Returns how
    /// many the transport accepted.
    pub fn replay_all(&mut self, wire: &mut dyn Transport) -> usize {
        self.live.clear();
        for channel in &self.channels {
            if send_control(&mut *wire, ControlFrame::subscribe(channel.as_str())) {
                self.live.insert(channel.clone());
            }
        }
        self.live.len()
    }

    /// The link is gone; nothing is live any more
    pub fn mark_offline(&mut self) {
        self.live.clear();
    }

    /// A subscribe frame for `channel` was accepted on the current link
    pub fn is_live(&self, channel: &str) -> bool {
        self.live.contains(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Sorted copy for display
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.live.clear();
    }
}

fn send_control(wire: &mut dyn Transport, frame: ControlFrame) -> bool {
    match frame.encode() {
        Ok(text) => {
            let accepted = wire.send_text(text);
            if !accepted {
                warn!(channel = %frame.channel, action = ?frame.action, "control_frame_rejected");
            }
            accepted
        }
        Err(e) => {
            warn!(error = %e, channel = %frame.channel, "control_frame_encode_failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeWire {
        sent: Vec<String>,
        reject: bool,
    }

    impl Transport for FakeWire {
        fn send_text(&mut self, text: String) -> bool {
            if self.reject {
                return false;
            }
            self.sent.push(text);
            true
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_subscribe_offline_records_intent() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.subscribe("BTCUSDT@kline", None));
        assert!(!registry.subscribe("BTCUSDT@kline", None));
        assert_eq!(registry.channels(), vec!["BTCUSDT@kline".to_string()]);
        assert!(!registry.is_live("BTCUSDT@kline"));
    }

    #[test]
    fn test_subscribe_online_sends_once() {
        let mut registry = SubscriptionRegistry::new();
        let mut wire = FakeWire::default();

        assert!(registry.subscribe("BTCUSDT@kline", Some(&mut wire)));
        assert!(registry.subscribe("BTCUSDT@kline", Some(&mut wire)));
        assert_eq!(
            wire.sent,
            vec![r#"{"action":"subscribe","channel":"BTCUSDT@kline"}"#.to_string()]
        );
    }

    #[test]
    fn test_rejected_write_keeps_intent() {
        let mut registry = SubscriptionRegistry::new();
        let mut wire = FakeWire {
            reject: true,
            ..Default::default()
        };

        assert!(!registry.subscribe("ETHUSDT@trade", Some(&mut wire)));
        assert_eq!(registry.channels(), vec!["ETHUSDT@trade".to_string()]);
        assert!(!registry.is_live("ETHUSDT@trade"));
    }

    #[test]
    fn test_subscribe_after_rejected_write_resends() {
        let mut registry = SubscriptionRegistry::new();
        let mut wire = FakeWire {
            reject: true,
            ..Default::default()
        };

        assert!(!registry.subscribe("BTCUSDT@kline", Some(&mut wire)));
        assert!(!registry.subscribe("BTCUSDT@kline", Some(&mut wire)));
        assert!(wire.sent.is_empty());

        wire.reject = false;
        assert!(registry.subscribe("BTCUSDT@kline", Some(&mut wire)));
        assert!(registry.subscribe("BTCUSDT@kline", Some(&mut wire)));
        assert_eq!(
            wire.sent,
            vec![r#"{"action":"subscribe","channel":"BTCUSDT@kline"}"#.to_string()]
        );
    }

    #[test]
    fn test_offline_link_forgets_live_channels() {
        let mut registry = SubscriptionRegistry::new();
        let mut wire = FakeWire::default();
        assert!(registry.subscribe("a", Some(&mut wire)));

        registry.mark_offline();
        assert!(!registry.is_live("a"));

        let mut next = FakeWire::default();
        assert!(registry.subscribe("a", Some(&mut next)));
        assert_eq!(next.sent.len(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_regardless_of_connection() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("a", None);
        registry.subscribe("b", None);

        assert!(!registry.unsubscribe("a", None));
        assert_eq!(registry.channels(), vec!["b".to_string()]);

        let mut wire = FakeWire::default();
        assert!(registry.unsubscribe("b", Some(&mut wire)));
        assert!(registry.is_empty());
        assert_eq!(
            wire.sent,
            vec![r#"{"action":"unsubscribe","channel":"b"}"#.to_string()]
        );
    }

    #[test]
    fn test_replay_all_sends_every_channel() {
        let mut registry = SubscriptionRegistry::new();
        for channel in ["a", "b", "c"] {
            registry.subscribe(channel, None);
        }
        let mut wire = FakeWire::default();

        assert_eq!(registry.replay_all(&mut wire), 3);
        assert!(registry.is_live("b"));
        let mut sent = wire.sent.clone();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                r#"{"action":"subscribe","channel":"a"}"#.to_string(),
                r#"{"action":"subscribe","channel":"b"}"#.to_string(),
                r#"{"action":"subscribe","channel":"c"}"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_channels_sorted_and_clear() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("z", None);
        registry.subscribe("m", None);
        assert_eq!(registry.channels(), vec!["m".to_string(), "z".to_string()]);

        registry.clear();
        assert!(registry.is_empty());
    }
}
