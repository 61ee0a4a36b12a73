//! Typed environment tunables.
//!
//! Unset or unparsable variables fall back to the default. Adaptive
//! parameters treat these values as ceilings, not as the values used.

use std::str::FromStr;

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

pub fn env_usize(name: &str, default: usize) -> usize {
    parse_env(name).unwrap_or(default)
}

pub fn env_f64(name: &str, default: f64) -> f64 {
    parse_env::<f64>(name).filter(|v| v.is_finite()).unwrap_or(default)
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off` in any case.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => parse_bool(&v).unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// All process environment variables, for artifact hashing.
pub fn all_vars() -> Vec<(String, String)> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn unset_vars_use_defaults() {
        assert_eq!(env_usize("PATHWEAVER_TEST_UNSET_USIZE", 7), 7);
        assert_eq!(env_f64("PATHWEAVER_TEST_UNSET_F64", 0.5), 0.5);
        assert!(env_bool("PATHWEAVER_TEST_UNSET_BOOL", true));
        assert_eq!(env_string("PATHWEAVER_TEST_UNSET_STR", "x"), "x");
    }
}
