//! Connection lifecycle states and transition bookkeeping

use serde::Serialize;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport, no retry pending
    Closed,
    /// Transport open in progress
    Connecting,
    /// Transport open, subscriptions replayed
    Connected,
    /// Connection lost, waiting for the retry timer
    Reconnecting,
    /// Caller-requested close in progress
    Closing,
    /// Transport failed; settles to `Closed` right after
    Errored,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Errored => write!(f, "ERRORED"),
        }
    }
}

/// Reason for state transition (for logging/metrics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ConnectRequested,
    RetryTimerFired,
    OpenSucceeded,
    OpenFailed,
    AttemptAborted,
    TransportError,
    ServerClose,
    RetryScheduled,
    DisconnectRequested,
    CloseCompleted,
    Shutdown,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "connect_requested"),
            Self::RetryTimerFired => write!(f, "retry_timer"),
            Self::OpenSucceeded => write!(f, "open_ok"),
            Self::OpenFailed => write!(f, "open_failed"),
            Self::AttemptAborted => write!(f, "attempt_aborted"),
            Self::TransportError => write!(f, "transport_error"),
            Self::ServerClose => write!(f, "server_close"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::DisconnectRequested => write!(f, "disconnect"),
            Self::CloseCompleted => write!(f, "close_completed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One observed transition, pushed to status-change subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: TransitionReason,
    /// Reconnect counter at the time of the transition
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
        assert_eq!(TransitionReason::ServerClose.to_string(), "server_close");
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
    }
}
