//! Network configuration
//!
//! ```rust,ignore
//! use cothread_net::NetConfig;
//!
//! let config = NetConfig::from_env()
//!     .probe_interval(Duration::from_secs(5))
//!     .versions(0x01, 0x04);
//! ```

use std::time::Duration;

use cothread_core::env::{env_get, env_get_ms};
use thiserror::Error;

/// Liveness probe period for established device connections
pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// One backoff unit of the reconnect wrapper
pub const BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Reconnect backoff cap, in units
pub const BACKOFF_LIMIT: u32 = 60;

/// Lowest device protocol version spoken
pub const MIN_VERSION: u8 = 0x01;

/// Highest device protocol version spoken, sent in our hello
pub const MAX_VERSION: u8 = 0x04;

/// Peers advertising anything above this are refused
pub const EXPERIMENTAL_VERSION: u8 = 0x80;

/// Network configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub probe_interval: Duration,
    pub backoff_unit: Duration,
    pub backoff_limit: u32,
    pub min_version: u8,
    pub max_version: u8,
    pub experimental_version: u8,
    /// Netlink SO_SNDBUF; 0 keeps the kernel default
    pub send_buffer: usize,
    /// Netlink SO_RCVBUF; 0 keeps the kernel default
    pub recv_buffer: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl NetConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COT_PROBE_INTERVAL_MS` - idle time before a liveness probe
    /// - `COT_BACKOFF_UNIT_MS` - length of one backoff unit
    /// - `COT_BACKOFF_LIMIT` - backoff cap in units
    pub fn from_env() -> Self {
        Self {
            probe_interval: env_get_ms("COT_PROBE_INTERVAL_MS", PROBE_INTERVAL),
            backoff_unit: env_get_ms("COT_BACKOFF_UNIT_MS", BACKOFF_UNIT),
            backoff_limit: env_get("COT_BACKOFF_LIMIT", BACKOFF_LIMIT),
            ..Self::new()
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            probe_interval: PROBE_INTERVAL,
            backoff_unit: BACKOFF_UNIT,
            backoff_limit: BACKOFF_LIMIT,
            min_version: MIN_VERSION,
            max_version: MAX_VERSION,
            experimental_version: EXPERIMENTAL_VERSION,
            send_buffer: 0,
            recv_buffer: 0,
        }
    }

    // Builder methods

    pub fn probe_interval(mut self, d: Duration) -> Self {
        self.probe_interval = d;
        self
    }

    pub fn backoff_unit(mut self, d: Duration) -> Self {
        self.backoff_unit = d;
        self
    }

    pub fn backoff_limit(mut self, units: u32) -> Self {
        self.backoff_limit = units;
        self
    }

    /// Inclusive range of protocol versions to negotiate
    pub fn versions(mut self, min: u8, max: u8) -> Self {
        self.min_version = min;
        self.max_version = max;
        self
    }

    pub fn experimental_version(mut self, v: u8) -> Self {
        self.experimental_version = v;
        self
    }

    pub fn send_buffer(mut self, bytes: usize) -> Self {
        self.send_buffer = bytes;
        self
    }

    pub fn recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer = bytes;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval.is_zero() {
            return Err(ConfigError::InvalidValue("probe_interval must be > 0"));
        }
        if self.backoff_limit == 0 {
            return Err(ConfigError::InvalidValue("backoff_limit must be > 0"));
        }
        if self.min_version == 0 || self.min_version > self.max_version {
            return Err(ConfigError::InvalidValue("need 0 < min_version <= max_version"));
        }
        if self.max_version > self.experimental_version {
            return Err(ConfigError::InvalidValue("max_version exceeds experimental_version"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::new();
        assert_eq!(config.probe_interval, Duration::from_secs(15));
        assert_eq!(config.backoff_limit, 60);
        assert_eq!((config.min_version, config.max_version), (1, 4));
        assert_eq!(config.experimental_version, 0x80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(NetConfig::new().versions(3, 2).validate().is_err());
        assert!(NetConfig::new().versions(0, 2).validate().is_err());
        assert_eq!(
            NetConfig::new().probe_interval(Duration::ZERO).validate(),
            Err(ConfigError::InvalidValue("probe_interval must be > 0"))
        );
        assert!(NetConfig::new().experimental_version(2).validate().is_err());
    }
}
