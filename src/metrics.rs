//! Connection metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Session counters, updated by the connection manager only
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub connect_failures: AtomicU64,
    pub unplanned_disconnects: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub retries_exhausted: AtomicU64,
    pub frames_sent: AtomicU64,
    pub writes_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub connect_failures: u64,
    pub unplanned_disconnects: u64,
    pub retries_scheduled: u64,
    pub retries_exhausted: u64,
    pub frames_sent: u64,
    pub writes_rejected: u64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connect_successes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unplanned_disconnect(&self) {
        self.unplanned_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self, accepted: bool) {
        if accepted {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.writes_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `accepted` of `total` replayed subscribe frames made it onto the wire
    pub fn record_replay(&self, accepted: usize, total: usize) {
        self.frames_sent
            .fetch_add(accepted as u64, Ordering::Relaxed);
        self.writes_rejected
            .fetch_add(total.saturating_sub(accepted) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_successes: self.connect_successes.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            unplanned_disconnects: self.unplanned_disconnects.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            writes_rejected: self.writes_rejected.load(Ordering::Relaxed),
        }
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "connects={}/{} failures={} drops={} retries={} exhausted={} sent={} rejected={}",
            s.connect_successes,
            s.connect_attempts,
            s.connect_failures,
            s.unplanned_disconnects,
            s.retries_scheduled,
            s.retries_exhausted,
            s.frames_sent,
            s.writes_rejected,
        )
    }
}
