//! Process-local [`AtomicStore`].
//!
//! A single mutex makes every primitive atomic. Expiry uses the tokio clock so
//! tests can drive it with `tokio::time::pause`/`advance`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::AtomicStore;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
struct SortedSet {
    members: HashMap<String, i64>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    zsets: HashMap<String, SortedSet>,
    maps: HashMap<String, BTreeMap<String, String>>,
}

impl Inner {
    fn live_entry(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.kv.get(key).is_some_and(|e| !e.live(now)) {
            self.kv.remove(key);
        }
        self.kv.get_mut(key)
    }

    fn live_zset(&mut self, key: &str, now: Instant) -> Option<&mut SortedSet> {
        if self.zsets.get(key).is_some_and(|z| z.expires_at <= now) {
            self.zsets.remove(key);
        }
        self.zsets.get_mut(key)
    }
}

/// In-memory store for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.live_entry(key, now).is_some() {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.live_entry(key, now) {
            Some(entry) if entry.value == expected => {
                inner.kv.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.live_entry(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner.live_entry(key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        self.inner.lock().await.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner.kv.remove(key).is_some_and(|e| e.live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner.live_entry(key, now).is_some())
    }

    async fn zadd(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.live_zset(key, now);
        let zset = inner
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| SortedSet {
                members: HashMap::new(),
                expires_at: now + ttl,
            });
        zset.members.insert(member.to_string(), score);
        zset.expires_at = now + ttl;
        Ok(())
    }

    async fn zremrange_by_score(&self, key: &str, max_score: i64) -> Result<u64, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let Some(zset) = inner.live_zset(key, now) else {
            return Ok(0);
        };
        let before = zset.members.len();
        zset.members.retain(|_, score| *score > max_score);
        Ok((before - zset.members.len()) as u64)
    }

    async fn zcount(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .live_zset(key, now)
            .map_or(0, |z| z.members.len() as u64))
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .live_zset(key, now)
            .and_then(|z| z.members.values().copied().min()))
    }

    async fn map_insert_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let map = inner.maps.entry(key.to_string()).or_default();
        if map.contains_key(field) {
            return Ok(false);
        }
        map.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn map_entries(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .maps
            .get(key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn map_remove(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .maps
            .get_mut(key)
            .is_some_and(|m| m.remove(field).is_some()))
    }
}
