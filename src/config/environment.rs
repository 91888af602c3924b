use std::time::Duration;

use crate::config::helpers::{
    optional_env, parse_millis_env, parse_optional_env, parse_secs_env, parse_string_env,
};
use crate::error::ConfigError;

/// Environment provisioning and lifecycle settings.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Public host name used in access URLs and ingress rules.
    pub domain: String,
    pub image: String,
    pub storage_class: Option<String>,
    pub ingress_class: String,
    /// Cache TTL for descriptors written after provisioning.
    pub descriptor_ttl: Duration,
    /// Cache TTL for descriptors rebuilt from cluster state.
    pub rebuilt_descriptor_ttl: Duration,
    pub delete_poll_attempts: u32,
    pub delete_poll_interval: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    /// Age past which `cleanup_stale` removes an environment.
    pub stale_after: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            domain: "vnc.service.thinkgs.cn".to_string(),
            image: "192.168.10.252:31832/vnc/void-desktop:latest".to_string(),
            storage_class: Some("183nfs".to_string()),
            ingress_class: "nginx".to_string(),
            descriptor_ttl: Duration::from_secs(24 * 3600),
            rebuilt_descriptor_ttl: Duration::from_secs(3600),
            delete_poll_attempts: 30,
            delete_poll_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(30),
            lock_retry_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(24 * 3600),
        }
    }
}

impl EnvironmentConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let storage_class = match optional_env("DESK_STORAGE_CLASS")? {
            Some(s) if s == "-" => None,
            Some(s) => Some(s),
            None => defaults.storage_class,
        };

        Ok(Self {
            domain: parse_string_env("DESK_DOMAIN", defaults.domain)?,
            image: parse_string_env("DESK_IMAGE", defaults.image)?,
            storage_class,
            ingress_class: parse_string_env("DESK_INGRESS_CLASS", defaults.ingress_class)?,
            descriptor_ttl: parse_secs_env("DESCRIPTOR_TTL_SECS", defaults.descriptor_ttl)?,
            rebuilt_descriptor_ttl: parse_secs_env(
                "DESCRIPTOR_REBUILT_TTL_SECS",
                defaults.rebuilt_descriptor_ttl,
            )?,
            delete_poll_attempts: parse_optional_env(
                "DELETE_POLL_ATTEMPTS",
                defaults.delete_poll_attempts,
            )?,
            delete_poll_interval: parse_millis_env(
                "DELETE_POLL_INTERVAL_MS",
                defaults.delete_poll_interval,
            )?,
            lock_ttl: parse_secs_env("LOCK_TTL_SECS", defaults.lock_ttl)?,
            lock_wait: parse_secs_env("LOCK_WAIT_SECS", defaults.lock_wait)?,
            lock_retry_interval: parse_millis_env(
                "LOCK_RETRY_MS",
                defaults.lock_retry_interval,
            )?,
            stale_after: parse_secs_env("STALE_AFTER_SECS", defaults.stale_after)?,
        })
    }
}
