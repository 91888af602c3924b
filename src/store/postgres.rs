//! PostgreSQL-backed [`AtomicStore`].
//!
//! Each conditional primitive is a single statement, so concurrent callers on
//! different instances see the same atomicity as with a single process.
//! Expired rows are invisible to reads and swept by [`PostgresStore::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, Pool};
use secrecy::{ExposeSecret, SecretString};

use crate::error::StoreError;
use crate::store::AtomicStore;

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS desk_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS desk_zset (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score BIGINT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (key, member)
);

CREATE INDEX IF NOT EXISTS desk_zset_key_score ON desk_zset (key, score);

CREATE TABLE IF NOT EXISTS desk_map (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
"#;

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

/// Shared store over a deadpool connection pool.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a connection URL.
    pub fn connect(database_url: &SecretString, max_size: usize) -> Result<Self, StoreError> {
        Ok(Self::new(build_pool(database_url, max_size)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        client.batch_execute(MIGRATIONS).await.map_err(db_err)?;
        tracing::info!("Store migrations applied");
        Ok(())
    }

    /// Delete expired keys and sorted-set members. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let kv = client
            .execute(
                "DELETE FROM desk_kv WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
                &[],
            )
            .await
            .map_err(db_err)?;
        let zset = client
            .execute("DELETE FROM desk_zset WHERE expires_at <= NOW()", &[])
            .await
            .map_err(db_err)?;
        Ok(kv + zset)
    }
}

/// Create a deadpool pool from a `postgres://` URL.
pub(crate) fn build_pool(database_url: &SecretString, max_size: usize) -> Result<Pool, StoreError> {
    let pg_config: tokio_postgres::Config = database_url
        .expose_secret()
        .parse()
        .map_err(|e| StoreError::Unavailable(format!("invalid DATABASE_URL: {e}")))?;
    Pool::builder(Manager::new(pg_config, tokio_postgres::NoTls))
        .max_size(max_size)
        .build()
        .map_err(db_err)
}

#[async_trait]
impl AtomicStore for PostgresStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        // An expired row counts as absent and is overwritten in place.
        let n = client
            .execute(
                r#"
                INSERT INTO desk_kv (key, value, expires_at)
                VALUES ($1, $2, NOW() + make_interval(secs => $3))
                ON CONFLICT (key) DO UPDATE SET
                    value = EXCLUDED.value,
                    expires_at = EXCLUDED.expires_at
                WHERE desk_kv.expires_at IS NOT NULL AND desk_kv.expires_at <= NOW()
                "#,
                &[&key, &value, &secs(ttl)],
            )
            .await
            .map_err(db_err)?;
        Ok(n == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let n = client
            .execute(
                r#"
                DELETE FROM desk_kv
                WHERE key = $1 AND value = $2
                  AND (expires_at IS NULL OR expires_at > NOW())
                "#,
                &[&key, &expected],
            )
            .await
            .map_err(db_err)?;
        Ok(n == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let n = client
            .execute(
                r#"
                UPDATE desk_kv SET expires_at = NOW() + make_interval(secs => $3)
                WHERE key = $1 AND value = $2
                  AND (expires_at IS NULL OR expires_at > NOW())
                "#,
                &[&key, &expected, &secs(ttl)],
            )
            .await
            .map_err(db_err)?;
        Ok(n == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let row = client
            .query_opt(
                r#"
                SELECT value FROM desk_kv
                WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
                "#,
                &[&key],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        client
            .execute(
                r#"
                INSERT INTO desk_kv (key, value, expires_at)
                VALUES ($1, $2, NOW() + make_interval(secs => $3))
                ON CONFLICT (key) DO UPDATE SET
                    value = EXCLUDED.value,
                    expires_at = EXCLUDED.expires_at
                "#,
                &[&key, &value, &ttl.map(secs)],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let n = client
            .execute(
                r#"
                DELETE FROM desk_kv
                WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
                "#,
                &[&key],
            )
            .await
            .map_err(db_err)?;
        Ok(n == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn zadd(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        client
            .execute(
                r#"
                INSERT INTO desk_zset (key, member, score, expires_at)
                VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
                ON CONFLICT (key, member) DO UPDATE SET
                    score = EXCLUDED.score,
                    expires_at = EXCLUDED.expires_at
                "#,
                &[&key, &member, &score, &secs(ttl)],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn zremrange_by_score(&self, key: &str, max_score: i64) -> Result<u64, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        client
            .execute(
                "DELETE FROM desk_zset WHERE key = $1 AND score <= $2",
                &[&key, &max_score],
            )
            .await
            .map_err(db_err)
    }

    async fn zcount(&self, key: &str) -> Result<u64, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM desk_zset WHERE key = $1 AND expires_at > NOW()",
                &[&key],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get::<_, i64>("n") as u64)
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let row = client
            .query_one(
                "SELECT MIN(score) AS s FROM desk_zset WHERE key = $1 AND expires_at > NOW()",
                &[&key],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get("s"))
    }

    async fn map_insert_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let n = client
            .execute(
                r#"
                INSERT INTO desk_map (key, field, value) VALUES ($1, $2, $3)
                ON CONFLICT (key, field) DO NOTHING
                "#,
                &[&key, &field, &value],
            )
            .await
            .map_err(db_err)?;
        Ok(n == 1)
    }

    async fn map_entries(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let rows = client
            .query(
                "SELECT field, value FROM desk_map WHERE key = $1 ORDER BY field",
                &[&key],
            )
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| (r.get("field"), r.get("value")))
            .collect())
    }

    async fn map_remove(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let n = client
            .execute(
                "DELETE FROM desk_map WHERE key = $1 AND field = $2",
                &[&key, &field],
            )
            .await
            .map_err(db_err)?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_reported() {
        let url = SecretString::from("postgres://desk@localhost:notaport/desk".to_string());
        assert!(matches!(
            build_pool(&url, 4),
            Err(StoreError::Unavailable(msg)) if msg.contains("DATABASE_URL")
        ));
    }

    #[test]
    fn test_pool_builds_without_connecting() {
        let url = SecretString::from("postgres://desk@localhost:1/desk".to_string());
        let store = PostgresStore::connect(&url, 2).expect("pool should build lazily");
        assert_eq!(store.pool().status().max_size, 2);
    }
}
