//! Environment variable utilities.
//!
//! Generic `env_get<T>` for parsing configuration overrides with defaults.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("SPN_TEST_UNSET_VAR_XYZ", 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn test_env_get_parses() {
        unsafe { std::env::set_var("SPN_TEST_PARSE_VAR", "42") };
        let v: usize = env_get("SPN_TEST_PARSE_VAR", 0);
        assert_eq!(v, 42);
        unsafe { std::env::remove_var("SPN_TEST_PARSE_VAR") };
    }

    #[test]
    fn test_env_get_bool() {
        unsafe { std::env::set_var("SPN_TEST_BOOL_VAR", "yes") };
        assert!(env_get_bool("SPN_TEST_BOOL_VAR", false));
        unsafe { std::env::set_var("SPN_TEST_BOOL_VAR", "0") };
        assert!(!env_get_bool("SPN_TEST_BOOL_VAR", true));
        unsafe { std::env::remove_var("SPN_TEST_BOOL_VAR") };
    }
}
