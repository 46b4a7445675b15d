//! SQLite backend implementation

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{StorageBackend, StorageError};

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:notary.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:notary.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            // a second connection would open a different in-memory database
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

/// SQLite storage backend
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend with default config
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let config = if url.contains(":memory:") {
            SqliteConfig::memory()
        } else {
            SqliteConfig {
                url: url.to_string(),
                ..Default::default()
            }
        };
        Self::new_with_config(config).await
    }

    /// Create a new SQLite backend with full configuration
    pub async fn new_with_config(config: SqliteConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(true);

        options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Internal(format!("Migration failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn is_healthy(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn set_value_with_ttl(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(&value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let now = Utc::now().timestamp_millis();
        let expires_at = match ttl {
            Some(ttl) => {
                let ms = i64::try_from(ttl.as_millis())
                    .map_err(|_| StorageError::Invalid("ttl out of range".to_string()))?;
                Some(now.saturating_add(ms))
            }
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(json)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let result = sqlx::query(
            "SELECT value FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        match result {
            Some(row) => {
                let value_str: String = row
                    .try_get("value")
                    .map_err(|e| StorageError::Query(e.to_string()))?;
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "SELECT 1 FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr avoids LIKE wildcard handling for '_' and '%' in keys
        let rows = sqlx::query(
            r#"
            SELECT key FROM kv_store
            WHERE substr(key, 1, ?) = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("key")
                    .map_err(|e| StorageError::Query(e.to_string()))
            })
            .collect()
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        if result.rows_affected() > 0 {
            debug!(rows = result.rows_affected(), "Purged expired keys");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StorageExt;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let backend = SqliteBackend::new("sqlite::memory:").await.unwrap();

        let data = TestData {
            name: "test_sql".to_string(),
            value: 99,
        };

        backend.set("sql:1", &data).await.unwrap();
        assert!(backend.exists("sql:1").await.unwrap());

        let retrieved: Option<TestData> = backend.get("sql:1").await.unwrap();
        assert_eq!(retrieved, Some(data));

        // underscore is literal, not a wildcard
        backend.set("sqlx1", &1u8).await.unwrap();
        let keys = backend.list_keys("sql:").await.unwrap();
        assert_eq!(keys, vec!["sql:1"]);

        assert!(backend.delete("sql:1").await.unwrap());
        assert!(!backend.exists("sql:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_ttl_expiry() {
        let backend = SqliteBackend::new("sqlite::memory:").await.unwrap();
        backend
            .set_with_ttl("job:a", &"x", Duration::from_millis(20))
            .await
            .unwrap();
        backend.set("job:b", &"y").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(backend.get::<String>("job:a").await.unwrap().is_none());
        assert_eq!(backend.list_keys("job:").await.unwrap(), vec!["job:b"]);
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_clears_ttl() {
        let backend = SqliteBackend::new("sqlite::memory:").await.unwrap();
        backend
            .set_with_ttl("k", &1, Duration::from_millis(20))
            .await
            .unwrap();
        backend.set("k", &2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get::<i32>("k").await.unwrap(), Some(2));
    }
}
