//! Stream pool configuration.

use crate::base::neterror::NetError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a [`PoolConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to build connector: {0}")]
    Connector(#[from] NetError),
}

/// Limits and timings of a stream pool.
///
/// Durations are expressed in milliseconds when deserialized, e.g.
/// `{"max_streams_per_group": 4, "connection_attempt_delay": 300}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum streams (active, idle, or connecting) per destination
    pub max_streams_per_group: usize,
    /// Maximum streams across all destinations
    pub max_streams_total: usize,
    /// Delay before racing the next endpoint while an attempt is still pending
    #[serde(with = "millis")]
    pub connection_attempt_delay: Duration,
    /// Absolute limit on a single attempt (connect plus handshake)
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Idle timeout of streams that carried traffic
    #[serde(with = "millis")]
    pub used_idle_timeout: Duration,
    /// Idle timeout of streams that were never handed out
    #[serde(with = "millis")]
    pub unused_idle_timeout: Duration,
    /// Period of the idle cleanup task
    #[serde(with = "millis")]
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_streams_per_group: 6,
            max_streams_total: 256,
            connection_attempt_delay: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(30),
            used_idle_timeout: Duration::from_secs(300),
            unused_idle_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-destination limit.
    pub fn max_streams_per_group(mut self, max: usize) -> Self {
        self.max_streams_per_group = max;
        self
    }

    /// Set the pool-wide limit.
    pub fn max_streams_total(mut self, max: usize) -> Self {
        self.max_streams_total = max;
        self
    }

    /// Set the happy-eyeballs fallback delay.
    pub fn connection_attempt_delay(mut self, delay: Duration) -> Self {
        self.connection_attempt_delay = delay;
        self
    }

    /// Set the per-attempt timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set idle timeouts for used and unused streams.
    pub fn idle_timeouts(mut self, used: Duration, unused: Duration) -> Self {
        self.used_idle_timeout = used;
        self.unused_idle_timeout = unused;
        self
    }

    /// Set the cleanup task period.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_streams_per_group == 0 {
            return Err(ConfigError::Invalid("max_streams_per_group must be positive".into()));
        }
        if self.max_streams_total < self.max_streams_per_group {
            return Err(ConfigError::Invalid(format!(
                "max_streams_total ({}) is below max_streams_per_group ({})",
                self.max_streams_total, self.max_streams_per_group
            )));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid("handshake_timeout must be positive".into()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid("cleanup_interval must be positive".into()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
