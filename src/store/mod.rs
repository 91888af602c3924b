//! Backing atomic store.
//!
//! Locks, cached descriptors, identity caches, blacklists and rate counters
//! all live behind [`AtomicStore`]. Every conditional operation is a single
//! atomic primitive of the backend; nothing here emulates compare-and-swap
//! with a separate read followed by a write.

mod memory;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Key/value, sorted-set and hash primitives with per-key expiry.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Set `key` only if it is absent (or expired). Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Add `member` with `score` to the sorted set at `key`, refreshing its expiry.
    async fn zadd(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Remove every member with score `<= max_score`. Returns how many were removed.
    async fn zremrange_by_score(&self, key: &str, max_score: i64) -> Result<u64, StoreError>;

    async fn zcount(&self, key: &str) -> Result<u64, StoreError>;

    async fn zmin_score(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Insert `field` into the hash at `key` only if the field is absent.
    async fn map_insert_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    async fn map_entries(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn map_remove(&self, key: &str, field: &str) -> Result<bool, StoreError>;
}

pub type SharedStore = Arc<dyn AtomicStore>;

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn AtomicStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn AtomicStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let raw =
        serde_json::to_string(value).map_err(|e| StoreError::Serialization(format!("{key}: {e}")))?;
    store.set(key, &raw, ttl).await
}
