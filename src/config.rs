//! Transport configuration
//!
//! Supplied once at construction. There are no setters on a built config;
//! the connection manager keeps its own copy for its whole lifetime.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Immutable feed transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Feed endpoint, e.g. `wss://feed.example.com/ws`
    endpoint: String,

    /// Fixed delay between an unplanned close and the next attempt
    #[serde(default = "default_reconnect_interval_ms")]
    reconnect_interval_ms: u64,

    /// Upper bound on consecutive automatic retries
    #[serde(default = "default_max_reconnect_attempts")]
    max_reconnect_attempts: u32,

    /// Optional cap on a single open attempt (unset = whatever the transport imposes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connect_timeout_ms: Option<u64>,
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout_ms: None,
        }
    }

    pub fn with_reconnect_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reconnect_interval_ms = interval_ms;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse feed config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment (after `.env`), falling back to defaults for
    /// everything except the endpoint
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let endpoint = std::env::var("FEED_WS_URL").context("FEED_WS_URL must be set")?;
        let mut config = Self::new(endpoint);

        if let Ok(v) = std::env::var("FEED_RECONNECT_INTERVAL_MS") {
            config.reconnect_interval_ms = v.parse().unwrap_or(config.reconnect_interval_ms);
        }
        if let Ok(v) = std::env::var("FEED_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("FEED_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().ok().filter(|&ms| ms > 0);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            bail!("feed endpoint must not be empty");
        }
        if self.connect_timeout_ms == Some(0) {
            bail!("connect_timeout_ms must be greater than zero when set");
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
