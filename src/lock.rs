//! Distributed mutual exclusion over the backing store.
//!
//! A lock is a single store key `lock:{name}` whose value is the holder id.
//! Acquisition is set-if-absent with expiry; release and extend are
//! compare-holder-then-act primitives, so a holder whose lock expired and was
//! re-acquired elsewhere can neither delete nor prolong the new holder's lock.
//!
//! Blocking acquisition polls at a fixed interval until the wait budget is
//! spent. There is no wake-up notification: worst-case hand-off latency after a
//! release equals the retry interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{LockError, StoreError};
use crate::store::SharedStore;

const KEY_PREFIX: &str = "lock:";

/// One holder's handle on a named lock.
pub struct DistributedLock {
    store: SharedStore,
    key: String,
    holder: String,
    ttl: Duration,
    retry_interval: Duration,
}

impl DistributedLock {
    pub fn new(store: SharedStore, name: &str, ttl: Duration) -> Self {
        Self {
            store,
            key: format!("{KEY_PREFIX}{name}"),
            holder: Uuid::new_v4().to_string(),
            ttl,
            retry_interval: Duration::from_millis(50),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Full store key, including the `lock:` prefix.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take the lock.
    ///
    /// With `blocking == false` a single attempt is made. Otherwise attempts
    /// repeat every retry interval until `wait` has elapsed, after which
    /// `Ok(false)` is returned. Store faults are returned as errors, since a
    /// lock that cannot be verified must not be assumed held.
    pub async fn acquire(&self, blocking: bool, wait: Duration) -> Result<bool, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            if self
                .store
                .set_if_absent(&self.key, &self.holder, self.ttl)
                .await?
            {
                tracing::debug!(key = %self.key, "Lock acquired");
                return Ok(true);
            }
            if !blocking || Instant::now() + self.retry_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Release the lock if this handle still holds it.
    ///
    /// Returns false when the lock expired and was taken by someone else, or
    /// when the store could not be reached (the TTL then frees it).
    pub async fn release(&self) -> bool {
        match self.store.compare_and_delete(&self.key, &self.holder).await {
            Ok(true) => {
                tracing::debug!(key = %self.key, "Lock released");
                true
            }
            Ok(false) => {
                tracing::warn!(key = %self.key, "Lock was no longer held at release");
                false
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to release lock");
                false
            }
        }
    }

    /// Push the expiry out to `ttl + additional` from now, if still the holder.
    pub async fn extend(&self, additional: Duration) -> bool {
        match self
            .store
            .compare_and_expire(&self.key, &self.holder, self.ttl + additional)
            .await
        {
            Ok(extended) => extended,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to extend lock");
                false
            }
        }
    }
}

/// Held lock. Released explicitly with [`LockGuard::release`]; if dropped
/// while still held (error path, cancellation, panic) release is spawned
/// onto the current runtime.
///
/// While held, a heartbeat task renews the TTL every third of it. If a
/// renewal fails the guard is marked lost and [`LockGuard::is_held`] turns
/// false; callers check it before each mutation.
pub struct LockGuard {
    lock: Option<Arc<DistributedLock>>,
    held: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn start(lock: DistributedLock) -> Self {
        let lock = Arc::new(lock);
        let held = Arc::new(AtomicBool::new(true));
        let period = (lock.ttl / 3).max(Duration::from_millis(1));
        let heartbeat = {
            let lock = Arc::clone(&lock);
            let held = Arc::clone(&held);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if !lock.extend(Duration::ZERO).await {
                        tracing::warn!(key = %lock.key, "Lost lock while holding it");
                        held.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            })
        };
        Self {
            lock: Some(lock),
            held,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.key())
    }

    /// False once a renewal failed; the lock may then be held by someone else.
    pub fn is_held(&self) -> bool {
        self.lock.is_some() && self.held.load(Ordering::SeqCst)
    }

    pub async fn extend(&self, additional: Duration) -> bool {
        match &self.lock {
            Some(lock) => lock.extend(additional).await,
            None => false,
        }
    }

    pub async fn release(mut self) -> bool {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        match self.lock.take() {
            Some(lock) => lock.release().await,
            None => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let Some(lock) = self.lock.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    lock.release().await;
                });
            }
            Err(_) => {
                tracing::warn!(key = %lock.key, "Lock guard dropped outside runtime, waiting for TTL");
            }
        }
    }
}

/// Factory for scoped locks sharing one store and timing policy.
#[derive(Clone)]
pub struct LockService {
    store: SharedStore,
    ttl: Duration,
    wait: Duration,
    retry_interval: Duration,
}

impl LockService {
    pub fn new(store: SharedStore, ttl: Duration, wait: Duration, retry_interval: Duration) -> Self {
        Self {
            store,
            ttl,
            wait,
            retry_interval,
        }
    }

    /// Block (bounded) until `name` is held, or fail with [`LockError::Timeout`].
    pub async fn lock(&self, name: &str) -> Result<LockGuard, LockError> {
        let lock = DistributedLock::new(self.store.clone(), name, self.ttl)
            .with_retry_interval(self.retry_interval);
        if lock.acquire(true, self.wait).await? {
            Ok(LockGuard::start(lock))
        } else {
            tracing::warn!(key = %lock.key(), waited = ?self.wait, "Lock acquisition timed out");
            Err(LockError::Timeout {
                key: lock.key().to_string(),
                waited: self.wait,
            })
        }
    }

    /// Run `f` while holding `name`. The lock is released on every exit path.
    pub async fn with_lock<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.lock(name).await?;
        let result = f().await;
        guard.release().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AtomicStore, InMemoryStore};

    fn store() -> SharedStore {
        Arc::new(InMemoryStore::new())
    }

    // ── acquire / release ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_blocked_until_release() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "env:42", Duration::from_secs(30));
        let b = DistributedLock::new(store.clone(), "env:42", Duration::from_secs(30));

        assert!(a.acquire(false, Duration::ZERO).await.unwrap());
        assert!(!b.acquire(false, Duration::ZERO).await.unwrap());
        assert!(a.release().await);
        assert!(b.acquire(false, Duration::ZERO).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_by_non_holder_after_expiry_returns_false() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "env:7", Duration::from_secs(5));
        let b = DistributedLock::new(store.clone(), "env:7", Duration::from_secs(5));

        assert!(a.acquire(false, Duration::ZERO).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.acquire(false, Duration::ZERO).await.unwrap());

        assert!(!a.release().await);
        assert!(!a.extend(Duration::from_secs(10)).await);
        assert_eq!(
            store.get("lock:env:7").await.unwrap().as_deref(),
            Some(b.holder())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "k", Duration::from_secs(60));
        let b = DistributedLock::new(store.clone(), "k", Duration::from_secs(60));
        assert!(a.acquire(false, Duration::ZERO).await.unwrap());

        let started = Instant::now();
        assert!(!b.acquire(true, Duration::from_secs(2)).await.unwrap());
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lock_past_ttl() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "k", Duration::from_secs(5));
        assert!(a.acquire(false, Duration::ZERO).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(a.extend(Duration::from_secs(10)).await);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.exists("lock:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_fault_propagates_from_acquire() {
        let mem = Arc::new(InMemoryStore::new());
        mem.set_unavailable(true);
        let lock = DistributedLock::new(mem.clone(), "k", Duration::from_secs(5));
        assert!(lock.acquire(false, Duration::ZERO).await.is_err());
        assert!(!lock.release().await);
    }

    // ── scoped guard ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_on_error() {
        let store = store();
        let locks = LockService::new(
            store.clone(),
            Duration::from_secs(30),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        let result: Result<(), LockError> = locks
            .with_lock("env:1", || async {
                Err(LockError::Store(StoreError::Unavailable("boom".into())))
            })
            .await;
        assert!(result.is_err());
        assert!(!store.exists("lock:env:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_error_names_key() {
        let store = store();
        let locks = LockService::new(
            store.clone(),
            Duration::from_secs(30),
            Duration::from_millis(200),
            Duration::from_millis(50),
        );
        let _held = locks.lock("env:9").await.unwrap();
        match locks.lock("env:9").await {
            Err(LockError::Timeout { key, .. }) => assert_eq!(key, "lock:env:9"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second lock should time out"),
        }
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = store();
        let locks = LockService::new(
            store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        {
            let _guard = locks.lock("env:3").await.unwrap();
        }
        for _ in 0..50 {
            if !store.exists("lock:env:3").await.unwrap() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped guard did not release the lock");
    }

    // ── heartbeat ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_held_guard_outlives_ttl() {
        let store = store();
        let locks = LockService::new(
            store.clone(),
            Duration::from_secs(3),
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        let guard = locks.lock("env:5").await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(guard.is_held());
        assert!(store.exists("lock:env:5").await.unwrap());

        assert!(guard.release().await);
        assert!(!store.exists("lock:env:5").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_reports_lost_lock() {
        let store = store();
        let locks = LockService::new(
            store.clone(),
            Duration::from_secs(3),
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        let guard = locks.lock("env:6").await.unwrap();
        store.delete("lock:env:6").await.unwrap();
        let thief = DistributedLock::new(store.clone(), "env:6", Duration::from_secs(30));
        assert!(thief.acquire(false, Duration::ZERO).await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!guard.is_held());
        assert!(!guard.release().await);
        assert_eq!(
            store.get("lock:env:6").await.unwrap().as_deref(),
            Some(thief.holder())
        );
    }
}
