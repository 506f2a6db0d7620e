//! Environment variable helpers for config overrides.
//!
//! ```ignore
//! use iocring_core::env::{env_get, env_get_opt};
//!
//! let workers: usize = env_get("IOCRING_WORKERS", 4);
//! let sq: Option<u32> = env_get_opt("IOCRING_SQ_ENTRIES");
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or return `default`.
///
/// Unset and unparsable values both fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` if the variable is set and parses, `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__IOCRING_TEST_UNSET_1__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__IOCRING_TEST_PARSE__", " 512 ");
        let val: u32 = env_get("__IOCRING_TEST_PARSE__", 1);
        assert_eq!(val, 512);
        std::env::remove_var("__IOCRING_TEST_PARSE__");
    }

    #[test]
    fn test_env_get_bad_value_uses_default() {
        std::env::set_var("__IOCRING_TEST_BAD__", "lots");
        let val: usize = env_get("__IOCRING_TEST_BAD__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__IOCRING_TEST_BAD__");
    }
}
