//! Reconnect policy
//!
//! Fixed interval, bounded attempts. The delay never grows and carries no
//! jitter; the only state is the count of consecutive retries since the
//! last successful connect.

use std::time::Duration;

use crate::config::TransportConfig;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    interval: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            interval: config.reconnect_interval(),
            max_attempts: config.max_reconnect_attempts(),
            attempt: 0,
        }
    }

    /// Claim the next retry slot. Returns the delay to wait, or `None` once
    /// the attempt bound is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.interval)
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(interval_ms: u64, attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(
            &TransportConfig::new("ws://localhost/ws")
                .with_reconnect_interval_ms(interval_ms)
                .with_max_reconnect_attempts(attempts),
        )
    }

    #[test]
    fn test_fixed_interval() {
        let mut policy = policy(5_000, 5);
        for expected_attempt in 1..=5 {
            assert_eq!(policy.next_delay(), Some(Duration::from_millis(5_000)));
            assert_eq!(policy.attempt(), expected_attempt);
        }
    }

    #[test]
    fn test_exhaustion_stops_at_bound() {
        let mut policy = policy(10, 3);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt(), 3);
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut policy = policy(10, 2);
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.next_delay(), None);

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert!(policy.next_delay().is_some());
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut policy = policy(10, 0);
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt(), 0);
    }
}
