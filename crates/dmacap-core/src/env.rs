//! Environment variable helpers
//!
//! Every tunable in dmacap can be overridden with a `DMACAP_*` variable.
//! Sizes accept binary suffixes so `DMACAP_BLOCK_SIZE=10M` works.
//!
//! ```ignore
//! use dmacap_core::env::{env_get, env_get_size};
//!
//! let depth: usize = env_get("DMACAP_CONCURRENCY", 10);
//! let ring = env_get_size("DMACAP_RING_SIZE", 1 << 20);
//! ```

use std::str::FromStr;

use tracing::warn;

/// Get environment variable parsed as `T`, or `default` if unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable parsed as `T`; `None` if unset or unparsable.
/// An unparsable value is logged, not silently dropped.
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Byte size with optional `K`/`M`/`G` (powers of 1024) suffix.
pub fn env_get_size(key: &str, default: usize) -> usize {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    parse_size(&raw).unwrap_or_else(|| {
        warn!(key, value = %raw, default, "ignoring unparsable size override");
        default
    })
}

/// Parse `"4096"`, `"64K"`, `"10M"`, `"1g"` into bytes.
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 10),
        'm' | 'M' => (&s[..s.len() - 1], 20),
        'g' | 'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__DMACAP_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__DMACAP_TEST_NUM__", " 123 ");
        let val: usize = env_get("__DMACAP_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__DMACAP_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__DMACAP_TEST_BOOL__", "YES");
        assert!(env_get_bool("__DMACAP_TEST_BOOL__", false));

        std::env::set_var("__DMACAP_TEST_BOOL__", "0");
        assert!(!env_get_bool("__DMACAP_TEST_BOOL__", true));

        std::env::remove_var("__DMACAP_TEST_BOOL__");
        assert!(env_get_bool("__DMACAP_TEST_BOOL__", true));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("10m"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("M"), None);
        assert_eq!(parse_size("ten"), None);
    }

    #[test]
    fn test_env_get_size_invalid_falls_back() {
        std::env::set_var("__DMACAP_TEST_SIZE__", "lots");
        assert_eq!(env_get_size("__DMACAP_TEST_SIZE__", 99), 99);
        std::env::remove_var("__DMACAP_TEST_SIZE__");
    }

    #[test]
    fn test_env_get_invalid_falls_back() {
        crate::log::init_with_default("warn");
        std::env::set_var("__DMACAP_TEST_BAD_NUM__", "12x");
        assert_eq!(env_get("__DMACAP_TEST_BAD_NUM__", 7usize), 7);
        assert_eq!(env_get_opt::<u64>("__DMACAP_TEST_BAD_NUM__"), None);
        std::env::remove_var("__DMACAP_TEST_BAD_NUM__");
    }
}
