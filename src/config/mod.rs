//! Configuration for deskpool.
//!
//! Every setting comes from an env var with a default. `.env` in the working
//! directory is loaded first via dotenvy, which never overwrites variables
//! already present in the process environment.

mod auth;
mod cluster;
mod environment;
pub(crate) mod helpers;
mod ports;
mod rate_limit;
mod store;

use crate::error::ConfigError;

pub use self::auth::AuthConfig;
pub use self::cluster::{ClusterBackend, ClusterConfig};
pub use self::environment::EnvironmentConfig;
pub use self::ports::PortsConfig;
pub use self::rate_limit::RateLimitConfig;
pub use self::store::{StoreBackend, StoreConfig};

/// Main configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub cluster: ClusterConfig,
    pub environment: EnvironmentConfig,
    pub ports: PortsConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::build()
    }

    fn build() -> Result<Self, ConfigError> {
        Ok(Self {
            store: StoreConfig::resolve()?,
            cluster: ClusterConfig::resolve()?,
            environment: EnvironmentConfig::resolve()?,
            ports: PortsConfig::resolve()?,
            auth: AuthConfig::resolve()?,
            rate_limit: RateLimitConfig::resolve()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn defaults_match_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.cluster.namespace, "vnc-pods");
        assert_eq!(cfg.cluster.mapping_table, "tcp-services");
        assert_eq!(cfg.ports.ssh_range, (22000, 22399));
        assert_eq!(cfg.rate_limit.requests_per_minute, 60);
        assert_eq!(cfg.rate_limit.requests_per_hour, 1000);
        assert_eq!(cfg.auth.token_prefix, "sk-");
    }

    #[test]
    fn invalid_rate_limit_is_reported_with_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("RATE_LIMIT_PER_MINUTE", "sixty");
        }
        let err = RateLimitConfig::resolve().unwrap_err();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("RATE_LIMIT_PER_MINUTE");
        }
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RATE_LIMIT_PER_MINUTE")
        );
    }

    #[test]
    fn ssh_offset_overflow_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("SSH_PUBLIC_OFFSET", "60000");
        }
        let result = PortsConfig::resolve();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("SSH_PUBLIC_OFFSET");
        }
        assert!(result.is_err());
    }
}
