//! Per-identity admission control.
//!
//! Two sliding windows (one minute, one hour) of request timestamps are kept
//! as sorted sets in the shared store, so every server instance sees the same
//! counts. Each check prunes entries that fell out of a window before counting.
//!
//! # Degraded mode
//!
//! A store fault never denies a request. The call is logged and answered from
//! process-local windows instead, which only see this instance's traffic.
//! Idle identities are evicted from the local windows by [`RateLimiter::spawn_gc`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;
use crate::error::StoreError;
use crate::store::SharedStore;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Store keys outlive their window so a slow writer never loses live entries.
const MINUTE_KEY_TTL: Duration = Duration::from_secs(120);
const HOUR_KEY_TTL: Duration = Duration::from_secs(7200);

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed {
        remaining_minute: u32,
        remaining_hour: u32,
    },
    Limited {
        /// Time until the oldest entry of the violated window expires.
        retry_after: Duration,
        limit_type: LimitType,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitResult::Allowed { .. } => None,
            RateLimitResult::Limited { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// Which window was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    PerMinute,
    PerHour,
}

impl LimitType {
    fn window_ms(self) -> i64 {
        match self {
            LimitType::PerMinute => MINUTE_MS,
            LimitType::PerHour => HOUR_MS,
        }
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitType::PerMinute => write!(f, "per-minute"),
            LimitType::PerHour => write!(f, "per-hour"),
        }
    }
}

/// Error when rate limited.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Rate limited ({limit_type}), retry after {retry_after:?}")]
pub struct RateLimitError {
    pub retry_after: Duration,
    pub limit_type: LimitType,
}

impl From<RateLimitResult> for Result<(), RateLimitError> {
    fn from(result: RateLimitResult) -> Self {
        match result {
            RateLimitResult::Allowed { .. } => Ok(()),
            RateLimitResult::Limited {
                retry_after,
                limit_type,
            } => Err(RateLimitError {
                retry_after,
                limit_type,
            }),
        }
    }
}

/// Remaining per-minute budget, as surfaced in rate-limit response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitUsage {
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted request leaves the minute window.
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LocalWindows {
    minute: VecDeque<i64>,
    hour: VecDeque<i64>,
}

impl LocalWindows {
    fn prune(&mut self, now_ms: i64) {
        while self.minute.front().is_some_and(|&t| t <= now_ms - MINUTE_MS) {
            self.minute.pop_front();
        }
        while self.hour.front().is_some_and(|&t| t <= now_ms - HOUR_MS) {
            self.hour.pop_front();
        }
    }
}

fn minute_key(identity: &str) -> String {
    format!("rate_limit:minute:{identity}")
}

fn hour_key(identity: &str) -> String {
    format!("rate_limit:hour:{identity}")
}

fn retry_after(oldest_ms: i64, limit_type: LimitType, now_ms: i64) -> Duration {
    let remaining = oldest_ms + limit_type.window_ms() - now_ms;
    Duration::from_millis(remaining.max(1) as u64)
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Dual-window limiter keyed by identity.
pub struct RateLimiter {
    store: SharedStore,
    config: RateLimitConfig,
    local: RwLock<HashMap<String, LocalWindows>>,
}

impl RateLimiter {
    pub fn new(store: SharedStore, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `identity` may issue another request. Does not record it.
    pub async fn admit(&self, identity: &str) -> RateLimitResult {
        self.admit_at(identity, now_ms()).await
    }

    pub async fn admit_at(&self, identity: &str, now_ms: i64) -> RateLimitResult {
        match self.store_admit(identity, now_ms).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    error = %e,
                    "Rate limit store unavailable, using local windows"
                );
                self.local_admit(identity, now_ms).await
            }
        }
    }

    /// Append a request to both windows.
    pub async fn record(&self, identity: &str) {
        self.record_at(identity, now_ms()).await
    }

    pub async fn record_at(&self, identity: &str, now_ms: i64) {
        if let Err(e) = self.store_record(identity, now_ms).await {
            tracing::warn!(
                identity = %identity,
                error = %e,
                "Rate limit store unavailable, recording locally"
            );
            self.local_record(identity, now_ms).await;
        }
    }

    /// Admit and, if allowed, record in one call.
    pub async fn check_and_record(&self, identity: &str) -> RateLimitResult {
        let now = now_ms();
        let result = self.admit_at(identity, now).await;
        if result.is_allowed() {
            self.record_at(identity, now).await;
        }
        result
    }

    /// Remaining per-minute budget and its reset instant.
    pub async fn usage(&self, identity: &str) -> RateLimitUsage {
        self.usage_at(identity, now_ms()).await
    }

    pub async fn usage_at(&self, identity: &str, now_ms: i64) -> RateLimitUsage {
        let (count, oldest) = match self.store_minute_window(identity, now_ms).await {
            Ok(window) => window,
            Err(e) => {
                tracing::debug!(identity = %identity, error = %e, "Usage from local windows");
                let mut local = self.local.write().await;
                match local.get_mut(identity) {
                    Some(w) => {
                        w.prune(now_ms);
                        (w.minute.len() as u64, w.minute.front().copied())
                    }
                    None => (0, None),
                }
            }
        };
        let limit = self.config.requests_per_minute;
        let reset_ms = oldest.unwrap_or(now_ms) + MINUTE_MS;
        RateLimitUsage {
            limit,
            remaining: limit.saturating_sub(count.min(u32::MAX as u64) as u32),
            reset_at: DateTime::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now),
        }
    }

    async fn store_minute_window(
        &self,
        identity: &str,
        now_ms: i64,
    ) -> Result<(u64, Option<i64>), StoreError> {
        let key = minute_key(identity);
        self.store.zremrange_by_score(&key, now_ms - MINUTE_MS).await?;
        let count = self.store.zcount(&key).await?;
        let oldest = self.store.zmin_score(&key).await?;
        Ok((count, oldest))
    }

    async fn store_admit(&self, identity: &str, now_ms: i64) -> Result<RateLimitResult, StoreError> {
        let windows = [
            (minute_key(identity), LimitType::PerMinute, self.config.requests_per_minute),
            (hour_key(identity), LimitType::PerHour, self.config.requests_per_hour),
        ];

        let mut counts = [0u64; 2];
        for (i, (key, limit_type, ceiling)) in windows.iter().enumerate() {
            self.store
                .zremrange_by_score(key, now_ms - limit_type.window_ms())
                .await?;
            let count = self.store.zcount(key).await?;
            if count >= u64::from(*ceiling) {
                let oldest = self.store.zmin_score(key).await?.unwrap_or(now_ms);
                return Ok(RateLimitResult::Limited {
                    retry_after: retry_after(oldest, *limit_type, now_ms),
                    limit_type: *limit_type,
                });
            }
            counts[i] = count;
        }

        Ok(RateLimitResult::Allowed {
            remaining_minute: self.config.requests_per_minute - counts[0] as u32,
            remaining_hour: self.config.requests_per_hour - counts[1] as u32,
        })
    }

    async fn store_record(&self, identity: &str, now_ms: i64) -> Result<(), StoreError> {
        // Members must be unique so same-millisecond requests each count.
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

        let minute = minute_key(identity);
        self.store.zadd(&minute, now_ms, &member, MINUTE_KEY_TTL).await?;
        self.store
            .zremrange_by_score(&minute, now_ms - MINUTE_MS)
            .await?;

        let hour = hour_key(identity);
        self.store.zadd(&hour, now_ms, &member, HOUR_KEY_TTL).await?;
        self.store.zremrange_by_score(&hour, now_ms - HOUR_MS).await?;
        Ok(())
    }

    async fn local_admit(&self, identity: &str, now_ms: i64) -> RateLimitResult {
        let mut local = self.local.write().await;
        let windows = local.entry(identity.to_string()).or_default();
        windows.prune(now_ms);

        let minute = windows.minute.len() as u32;
        if minute >= self.config.requests_per_minute {
            let oldest = windows.minute.front().copied().unwrap_or(now_ms);
            return RateLimitResult::Limited {
                retry_after: retry_after(oldest, LimitType::PerMinute, now_ms),
                limit_type: LimitType::PerMinute,
            };
        }

        let hour = windows.hour.len() as u32;
        if hour >= self.config.requests_per_hour {
            let oldest = windows.hour.front().copied().unwrap_or(now_ms);
            return RateLimitResult::Limited {
                retry_after: retry_after(oldest, LimitType::PerHour, now_ms),
                limit_type: LimitType::PerHour,
            };
        }

        RateLimitResult::Allowed {
            remaining_minute: self.config.requests_per_minute - minute,
            remaining_hour: self.config.requests_per_hour - hour,
        }
    }

    async fn local_record(&self, identity: &str, now_ms: i64) {
        let mut local = self.local.write().await;
        let windows = local.entry(identity.to_string()).or_default();
        windows.minute.push_back(now_ms);
        windows.hour.push_back(now_ms);
        windows.prune(now_ms);
    }

    /// Drop local windows with no entry younger than an hour. Returns how many
    /// identities were evicted.
    pub async fn gc_local(&self, now_ms: i64) -> usize {
        let mut local = self.local.write().await;
        let before = local.len();
        local.retain(|_, w| {
            w.prune(now_ms);
            !w.hour.is_empty()
        });
        before - local.len()
    }

    pub async fn local_identities(&self) -> usize {
        self.local.read().await.len()
    }

    /// Periodically sweep the local fallback windows.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = limiter.gc_local(now_ms()).await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Swept idle local rate-limit windows");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn limiter(per_minute: u32, per_hour: u32) -> (Arc<InMemoryStore>, RateLimiter) {
        let store = Arc::new(InMemoryStore::new());
        let config = RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            ..RateLimitConfig::default()
        };
        (store.clone(), RateLimiter::new(store, config))
    }

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_allowed_within_limits() {
        let (_, limiter) = limiter(10, 100);
        limiter.record_at("42", T0).await;

        match limiter.admit_at("42", T0 + 1).await {
            RateLimitResult::Allowed {
                remaining_minute,
                remaining_hour,
            } => {
                assert_eq!(remaining_minute, 9);
                assert_eq!(remaining_hour, 99);
            }
            other => panic!("Expected allowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_minute_limit_denies_at_ceiling() {
        let (_, limiter) = limiter(2, 100);
        limiter.record_at("42", T0).await;
        assert!(limiter.admit_at("42", T0 + 10).await.is_allowed());
        limiter.record_at("42", T0 + 10).await;

        match limiter.admit_at("42", T0 + 20).await {
            RateLimitResult::Limited {
                limit_type,
                retry_after,
            } => {
                assert_eq!(limit_type, LimitType::PerMinute);
                assert_eq!(retry_after, Duration::from_millis(59_980));
            }
            other => panic!("Expected limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hour_limit_exceeded() {
        let (_, limiter) = limiter(100, 2);
        limiter.record_at("42", T0).await;
        limiter.record_at("42", T0 + MINUTE_MS * 2).await;

        let result = limiter.admit_at("42", T0 + MINUTE_MS * 3).await;
        assert!(matches!(
            result,
            RateLimitResult::Limited {
                limit_type: LimitType::PerHour,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_window_expiry_readmits() {
        let (_, limiter) = limiter(1, 100);
        limiter.record_at("42", T0).await;
        assert!(!limiter.admit_at("42", T0 + MINUTE_MS - 1).await.is_allowed());
        assert!(limiter.admit_at("42", T0 + MINUTE_MS).await.is_allowed());
    }

    #[tokio::test]
    async fn test_retry_after_shrinks_as_window_ages() {
        let (_, limiter) = limiter(1, 100);
        limiter.record_at("42", T0).await;

        let mut last = Duration::MAX;
        for offset in [1_000, 15_000, 30_000, 59_999] {
            let retry = limiter
                .admit_at("42", T0 + offset)
                .await
                .retry_after()
                .expect("limited");
            assert!(retry < last);
            last = retry;
        }
        assert_eq!(last, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_identity_isolation() {
        let (_, limiter) = limiter(1, 10);
        limiter.record_at("a", T0).await;
        assert!(!limiter.admit_at("a", T0 + 1).await.is_allowed());
        assert!(limiter.admit_at("b", T0 + 1).await.is_allowed());
    }

    #[tokio::test]
    async fn test_same_millisecond_requests_all_count() {
        let (_, limiter) = limiter(3, 100);
        for _ in 0..3 {
            limiter.record_at("42", T0).await;
        }
        assert!(!limiter.admit_at("42", T0).await.is_allowed());
    }

    // ── degraded mode ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let (store, limiter) = limiter(5, 100);
        store.set_unavailable(true);
        assert!(limiter.admit_at("42", T0).await.is_allowed());
        assert!(limiter.check_and_record("42").await.is_allowed());
    }

    #[tokio::test]
    async fn test_local_windows_still_enforce_ceiling() {
        let (store, limiter) = limiter(1, 100);
        store.set_unavailable(true);
        limiter.record_at("42", T0).await;
        let result = limiter.admit_at("42", T0 + 500).await;
        assert_eq!(result.retry_after(), Some(Duration::from_millis(59_500)));
    }

    #[tokio::test]
    async fn test_gc_evicts_idle_identities() {
        let (store, limiter) = limiter(10, 100);
        store.set_unavailable(true);
        limiter.record_at("old", T0).await;
        limiter.record_at("fresh", T0 + HOUR_MS).await;
        assert_eq!(limiter.local_identities().await, 2);

        assert_eq!(limiter.gc_local(T0 + HOUR_MS + 1).await, 1);
        assert_eq!(limiter.local_identities().await, 1);
    }

    // ── usage ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_usage_reports_remaining_and_reset() {
        let (_, limiter) = limiter(5, 100);
        limiter.record_at("42", T0).await;
        limiter.record_at("42", T0 + 2_000).await;

        let usage = limiter.usage_at("42", T0 + 3_000).await;
        assert_eq!(usage.limit, 5);
        assert_eq!(usage.remaining, 3);
        assert_eq!(usage.reset_at.timestamp_millis(), T0 + MINUTE_MS);
    }

    #[test]
    fn test_limited_converts_to_error() {
        let result: Result<(), RateLimitError> = RateLimitResult::Limited {
            retry_after: Duration::from_secs(3),
            limit_type: LimitType::PerHour,
        }
        .into();
        let err = result.unwrap_err();
        assert_eq!(err.limit_type, LimitType::PerHour);
        assert!(err.to_string().contains("per-hour"));
    }
}
