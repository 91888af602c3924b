use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_secs_env};
use crate::error::ConfigError;

/// Per-identity admission ceilings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// How often the local fallback windows are swept for idle identities.
    pub gc_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            gc_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            requests_per_minute: parse_optional_env(
                "RATE_LIMIT_PER_MINUTE",
                defaults.requests_per_minute,
            )?,
            requests_per_hour: parse_optional_env(
                "RATE_LIMIT_PER_HOUR",
                defaults.requests_per_hour,
            )?,
            gc_interval: parse_secs_env("RATE_LIMIT_GC_SECS", defaults.gc_interval)?,
        })
    }
}
