//! Authoritative identity store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio::sync::RwLock;

use crate::auth::token::{BearerToken, fingerprint, generate_api_token};
use crate::auth::{Permission, QuotaOverride};
use crate::error::AuthError;

/// Identity attributes as held by the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user_id: String,
    pub display_name: String,
    /// `None` means the store has no explicit grant; defaults apply.
    pub permissions: Option<Vec<Permission>>,
    pub quota: QuotaOverride,
}

impl IdentityRecord {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            permissions: None,
            quota: QuotaOverride::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_quota(mut self, quota: QuotaOverride) -> Self {
        self.quota = quota;
        self
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up an active identity by token. `Ok(None)` if unknown or disabled.
    async fn lookup_by_token(&self, token: &BearerToken)
    -> Result<Option<IdentityRecord>, AuthError>;

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Clone)]
struct Account {
    record: IdentityRecord,
    active: bool,
    last_seen: Option<DateTime<Utc>>,
}

/// Identity store held in memory, keyed by token fingerprint.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `record` under a freshly generated token and return the token.
    pub async fn issue(&self, record: IdentityRecord, prefix: &str) -> String {
        let token = generate_api_token(prefix);
        self.insert(&token, record).await;
        token
    }

    pub async fn insert(&self, token: &str, record: IdentityRecord) {
        self.accounts.write().await.insert(
            fingerprint(token),
            Account {
                record,
                active: true,
                last_seen: None,
            },
        );
    }

    /// Mark the account inactive, as an operator would in the user table.
    pub async fn deactivate(&self, token: &str) {
        if let Some(account) = self.accounts.write().await.get_mut(&fingerprint(token)) {
            account.active = false;
        }
    }

    pub async fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.accounts
            .read()
            .await
            .values()
            .find(|a| a.record.user_id == user_id)
            .and_then(|a| a.last_seen)
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn lookup_by_token(
        &self,
        token: &BearerToken,
    ) -> Result<Option<IdentityRecord>, AuthError> {
        Ok(self
            .accounts
            .read()
            .await
            .get(&token.fingerprint())
            .filter(|a| a.active)
            .map(|a| a.record.clone()))
    }

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), AuthError> {
        let now = Utc::now();
        for account in self.accounts.write().await.values_mut() {
            if account.record.user_id == user_id {
                account.last_seen = Some(now);
            }
        }
        Ok(())
    }
}

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS desk_users (
    user_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    permissions TEXT[],
    status SMALLINT NOT NULL DEFAULT 1,
    last_seen_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS desk_quotas (
    user_id TEXT PRIMARY KEY REFERENCES desk_users (user_id) ON DELETE CASCADE,
    cpu_request TEXT,
    cpu_limit TEXT,
    memory_request TEXT,
    memory_limit TEXT,
    storage TEXT
);
"#;

fn db_err(e: impl std::fmt::Display) -> AuthError {
    AuthError::Unavailable(e.to_string())
}

/// PostgreSQL identity store. Tokens are matched by fingerprint; only rows
/// with `status = 1` are active.
pub struct PostgresIdentityStore {
    pool: Pool,
}

impl PostgresIdentityStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), AuthError> {
        let client = self.pool.get().await.map_err(db_err)?;
        client.batch_execute(MIGRATIONS).await.map_err(db_err)?;
        tracing::info!("Identity migrations applied");
        Ok(())
    }
}

fn row_to_record(row: &tokio_postgres::Row) -> IdentityRecord {
    let user_id: String = row.get("user_id");
    let permissions = row
        .get::<_, Option<Vec<String>>>("permissions")
        .map(|names| {
            names
                .iter()
                .filter_map(|name| match name.parse::<Permission>() {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Ignoring unknown permission");
                        None
                    }
                })
                .collect()
        });

    IdentityRecord {
        display_name: row.get("display_name"),
        permissions,
        quota: QuotaOverride {
            cpu_request: row.get("cpu_request"),
            cpu_limit: row.get("cpu_limit"),
            memory_request: row.get("memory_request"),
            memory_limit: row.get("memory_limit"),
            storage: row.get("storage"),
        },
        user_id,
    }
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    async fn lookup_by_token(
        &self,
        token: &BearerToken,
    ) -> Result<Option<IdentityRecord>, AuthError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let row = client
            .query_opt(
                r#"
                SELECT u.user_id, u.display_name, u.permissions,
                       q.cpu_request, q.cpu_limit, q.memory_request, q.memory_limit, q.storage
                FROM desk_users u
                LEFT JOIN desk_quotas q ON q.user_id = u.user_id
                WHERE u.token_hash = $1 AND u.status = 1
                "#,
                &[&token.fingerprint()],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), AuthError> {
        let client = self.pool.get().await.map_err(db_err)?;
        client
            .execute(
                "UPDATE desk_users SET last_seen_at = NOW() WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inactive_account_is_not_found() {
        let store = InMemoryIdentityStore::new();
        let token = store.issue(IdentityRecord::new("42", "Ada"), "sk-").await;
        let parsed = BearerToken::parse(&token, "sk-", 16).unwrap();
        assert!(store.lookup_by_token(&parsed).await.unwrap().is_some());

        store.deactivate(&token).await;
        assert!(store.lookup_by_token(&parsed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_updates_last_seen() {
        let store = InMemoryIdentityStore::new();
        store.issue(IdentityRecord::new("42", "Ada"), "sk-").await;
        assert!(store.last_seen("42").await.is_none());
        store.touch_last_seen("42").await.unwrap();
        assert!(store.last_seen("42").await.is_some());
    }
}
