//! Environment variable utilities
//!
//! Every tunable in cothread reads an optional `COT_*` override through
//! these helpers. Unset or unparsable values fall back to the default.
//!
//! ```ignore
//! use cothread_core::env::{env_get, env_get_ms};
//!
//! let stack: usize = env_get("COT_THREAD_STACK_SIZE", 256 * 1024);
//! let probe = env_get_ms("COT_PROBE_INTERVAL_MS", Duration::from_secs(15));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; any other
/// value is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as a millisecond count
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__COT_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert_eq!(env_get_str("__COT_TEST_UNSET__", "hello"), "hello");
        assert!(env_get_bool("__COT_TEST_UNSET__", true));
    }

    #[test]
    fn test_env_get_parses_and_trims() {
        std::env::set_var("__COT_TEST_NUM__", " 123 ");
        let val: usize = env_get("__COT_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__COT_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__COT_TEST_INVALID__", "not_a_number");
        let val: u32 = env_get("__COT_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__COT_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_ms() {
        std::env::set_var("__COT_TEST_MS__", "250");
        assert_eq!(
            env_get_ms("__COT_TEST_MS__", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        std::env::remove_var("__COT_TEST_MS__");
        assert_eq!(
            env_get_ms("__COT_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, want) in [("1", true), ("YES", true), ("on", true), ("0", false), ("garbage", false)] {
            std::env::set_var("__COT_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__COT_TEST_BOOL__", !want), want, "value {raw}");
        }
        std::env::remove_var("__COT_TEST_BOOL__");
    }
}
