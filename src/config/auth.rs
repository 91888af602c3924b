use std::time::Duration;

use crate::auth::ResourceQuota;
use crate::config::helpers::{parse_optional_env, parse_secs_env, parse_string_env};
use crate::error::ConfigError;

/// Token gateway settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token_prefix: String,
    pub min_token_len: usize,
    pub cache_ttl: Duration,
    pub blacklist_ttl: Duration,
    /// Quota applied when the identity store has none on record.
    pub default_quota: ResourceQuota,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_prefix: "sk-".to_string(),
            min_token_len: 16,
            cache_ttl: Duration::from_secs(3600),
            blacklist_ttl: Duration::from_secs(30 * 24 * 3600),
            default_quota: ResourceQuota::default(),
        }
    }
}

impl AuthConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let q = defaults.default_quota;
        Ok(Self {
            token_prefix: parse_string_env("TOKEN_PREFIX", defaults.token_prefix)?,
            min_token_len: parse_optional_env("TOKEN_MIN_LEN", defaults.min_token_len)?,
            cache_ttl: parse_secs_env("IDENTITY_CACHE_TTL_SECS", defaults.cache_ttl)?,
            blacklist_ttl: parse_secs_env("BLACKLIST_TTL_SECS", defaults.blacklist_ttl)?,
            default_quota: ResourceQuota {
                cpu_request: parse_string_env("DEFAULT_CPU_REQUEST", q.cpu_request)?,
                cpu_limit: parse_string_env("DEFAULT_CPU_LIMIT", q.cpu_limit)?,
                memory_request: parse_string_env("DEFAULT_MEMORY_REQUEST", q.memory_request)?,
                memory_limit: parse_string_env("DEFAULT_MEMORY_LIMIT", q.memory_limit)?,
                storage: parse_string_env("DEFAULT_STORAGE_SIZE", q.storage)?,
            },
        })
    }
}
