//! Env-var parsing helpers shared by the sub-configs.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Read an env var, treating unset and empty (after trimming) the same.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("{key}: {e}"))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a boolean"),
            }),
        },
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}

/// Seconds-valued env var.
pub(crate) fn parse_secs_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_optional_env(key, default.as_secs()).map(Duration::from_secs)
}

/// Milliseconds-valued env var.
pub(crate) fn parse_millis_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_optional_env(key, default.as_millis() as u64).map(Duration::from_millis)
}

/// Parse an inclusive `start-end` port range.
pub(crate) fn parse_range_env(
    key: &str,
    default: (u16, u16),
) -> Result<(u16, u16), ConfigError> {
    let Some(raw) = optional_env(key)? else {
        return Ok(default);
    };
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| invalid(format!("'{raw}' is not a start-end range")))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|e| invalid(format!("bad range start: {e}")))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|e| invalid(format!("bad range end: {e}")))?;
    if start > end {
        return Err(invalid(format!("range start {start} exceeds end {end}")));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_parsing() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("DESKPOOL_TEST_RANGE", "22000 - 22399");
        }
        assert_eq!(
            parse_range_env("DESKPOOL_TEST_RANGE", (1, 2)).unwrap(),
            (22000, 22399)
        );

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("DESKPOOL_TEST_RANGE", "500-100");
        }
        assert!(matches!(
            parse_range_env("DESKPOOL_TEST_RANGE", (1, 2)),
            Err(ConfigError::InvalidValue { .. })
        ));

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("DESKPOOL_TEST_RANGE");
        }
        assert_eq!(parse_range_env("DESKPOOL_TEST_RANGE", (1, 2)).unwrap(), (1, 2));
    }

    #[test]
    fn test_empty_value_falls_back_to_default() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("DESKPOOL_TEST_BOOL", "  ");
        }
        assert!(parse_bool_env("DESKPOOL_TEST_BOOL", true).unwrap());
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("DESKPOOL_TEST_BOOL", "maybe");
        }
        assert!(parse_bool_env("DESKPOOL_TEST_BOOL", true).is_err());
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("DESKPOOL_TEST_BOOL");
        }
    }
}
