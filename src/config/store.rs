use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Which backing store holds locks, caches and rate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Process-local store. Only coordinates within a single instance.
    #[default]
    Memory,
    /// Shared PostgreSQL store.
    Postgres,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in_memory" | "local" => Ok(Self::Memory),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            _ => Err(format!(
                "invalid store backend '{}', expected one of: memory, postgres",
                s
            )),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

/// Backing store and identity database settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection string; required for the Postgres backend.
    pub database_url: Option<SecretString>,
    pub pool_max_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            pool_max_size: 16,
        }
    }
}

impl StoreConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let database_url = optional_env("DATABASE_URL")?.map(SecretString::from);

        // An explicit backend wins; otherwise a configured database implies Postgres.
        let backend = match optional_env("STORE_BACKEND")? {
            Some(b) => b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "STORE_BACKEND".to_string(),
                message: e,
            })?,
            None if database_url.is_some() => StoreBackend::Postgres,
            None => StoreBackend::Memory,
        };

        if backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "Set DATABASE_URL or use STORE_BACKEND=memory".to_string(),
            });
        }

        Ok(Self {
            backend,
            database_url,
            pool_max_size: parse_optional_env("DATABASE_POOL_SIZE", 16)?,
        })
    }
}
