//! Runtime configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use cothread_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .thread_stack_size(512 * 1024)
//!     .max_poll_wait(Duration::from_millis(200));
//! ```

pub mod defaults;

use std::time::Duration;

use cothread_core::env::{env_get, env_get_ms, env_get_str};
use thiserror::Error;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// OS stack size backing each cooperative thread
    pub thread_stack_size: usize,
    /// Name of the group created by `Runtime::new`
    pub default_group_name: String,
    /// Longest a driver sleeps in one poll before rechecking its queue
    pub max_poll_wait: Duration,
    /// Poll slice for migrated-out threads waiting on descriptors
    pub native_poll_slice: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COT_THREAD_STACK_SIZE` - stack bytes per cooperative thread
    /// - `COT_DEFAULT_GROUP` - name of the default group
    /// - `COT_MAX_POLL_WAIT_MS` - cap on one idle driver poll
    /// - `COT_NATIVE_POLL_SLICE_MS` - descriptor poll slice off-group
    pub fn from_env() -> Self {
        Self {
            thread_stack_size: env_get("COT_THREAD_STACK_SIZE", defaults::THREAD_STACK_SIZE),
            default_group_name: env_get_str("COT_DEFAULT_GROUP", defaults::DEFAULT_GROUP_NAME),
            max_poll_wait: env_get_ms(
                "COT_MAX_POLL_WAIT_MS",
                Duration::from_millis(defaults::MAX_POLL_WAIT_MS),
            ),
            native_poll_slice: env_get_ms(
                "COT_NATIVE_POLL_SLICE_MS",
                Duration::from_millis(defaults::NATIVE_POLL_SLICE_MS),
            ),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            thread_stack_size: defaults::THREAD_STACK_SIZE,
            default_group_name: defaults::DEFAULT_GROUP_NAME.to_string(),
            max_poll_wait: Duration::from_millis(defaults::MAX_POLL_WAIT_MS),
            native_poll_slice: Duration::from_millis(defaults::NATIVE_POLL_SLICE_MS),
        }
    }

    // Builder methods

    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    pub fn default_group_name(mut self, name: impl Into<String>) -> Self {
        self.default_group_name = name.into();
        self
    }

    pub fn max_poll_wait(mut self, d: Duration) -> Self {
        self.max_poll_wait = d;
        self
    }

    pub fn native_poll_slice(mut self, d: Duration) -> Self {
        self.native_poll_slice = d;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_stack_size < 64 * 1024 {
            return Err(ConfigError::InvalidValue("thread_stack_size must be >= 64KB"));
        }
        if self.default_group_name.is_empty() {
            return Err(ConfigError::InvalidValue("default_group_name must not be empty"));
        }
        if self.max_poll_wait.is_zero() {
            return Err(ConfigError::InvalidValue("max_poll_wait must be > 0"));
        }
        if self.native_poll_slice.is_zero() {
            return Err(ConfigError::InvalidValue("native_poll_slice must be > 0"));
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
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert_eq!(config.default_group_name, "coop");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .thread_stack_size(1 << 20)
            .default_group_name("ctl")
            .max_poll_wait(Duration::from_millis(5));

        assert_eq!(config.thread_stack_size, 1 << 20);
        assert_eq!(config.default_group_name, "ctl");
        assert_eq!(config.max_poll_wait, Duration::from_millis(5));
    }

    #[test]
    fn test_validation() {
        let config = RuntimeConfig::new().thread_stack_size(4096);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidValue("thread_stack_size must be >= 64KB"))
        );

        let config = RuntimeConfig::new().max_poll_wait(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
