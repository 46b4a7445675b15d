//! Storage backend trait and error types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Transient failures that a later attempt may get past
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Connection(_) | StorageError::Timeout(_) | StorageError::Query(_)
        )
    }
}

/// Generic key-value backend with optional per-key expiry (Object Safe)
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Check if backend is healthy
    async fn is_healthy(&self) -> bool;

    /// Store a JSON value; `ttl = None` keeps it until deleted
    async fn set_value_with_ttl(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Store a JSON value with no expiry
    async fn set_value(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.set_value_with_ttl(key, value, None).await
    }

    /// Get a JSON value by key; expired keys read as absent
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Delete a value by key
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// List all live keys with prefix, sorted
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Physically remove expired keys; returns how many were removed.
    /// Backends that drop expired keys on their own keep the default.
    async fn purge_expired(&self) -> Result<u64, StorageError> {
        Ok(0)
    }
}

/// Extension trait for typed access
#[async_trait]
pub trait StorageExt {
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<(), StorageError>;
    async fn set_with_ttl<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StorageError>;
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError>;
}

#[async_trait]
impl<S: StorageBackend + ?Sized> StorageExt for S {
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_value(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.set_value(key, json).await
    }

    async fn set_with_ttl<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_value(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.set_value_with_ttl(key, json, Some(ttl)).await
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get_value(key).await? {
            Some(json) => {
                let value = serde_json::from_value(json)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-memory storage backend (for testing and single-node development)
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: tokio::sync::RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries held, expired ones included until purged
    pub async fn stored_len(&self) -> usize {
        self.data.read().await.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn set_value_with_ttl(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| StorageError::Invalid(format!("ttl out of range: {e}")))?,
            ),
            None => None,
        };
        self.data
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let now = Utc::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let now = Utc::now();
        Ok(self
            .data
            .write()
            .await
            .remove(key)
            .map(|entry| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get_value(key).await?.is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = Utc::now();
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && entry.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let now = Utc::now();
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        Ok((before - data.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();

        let data = TestData { name: "test".to_string(), value: 42 };

        // Set
        backend.set("test:1", &data).await.unwrap();

        // Get
        let retrieved: Option<TestData> = backend.get("test:1").await.unwrap();
        assert_eq!(retrieved, Some(data));

        // Exists
        assert!(backend.exists("test:1").await.unwrap());
        assert!(!backend.exists("test:2").await.unwrap());

        // List
        let keys = backend.list_keys("test:").await.unwrap();
        assert_eq!(keys, vec!["test:1"]);

        // Delete
        assert!(backend.delete("test:1").await.unwrap());
        assert!(!backend.exists("test:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_backend_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl("job:1", &1u32, Duration::from_millis(20))
            .await
            .unwrap();
        backend.set("job:2", &2u32).await.unwrap();

        assert!(backend.exists("job:1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!backend.exists("job:1").await.unwrap());
        assert_eq!(backend.list_keys("job:").await.unwrap(), vec!["job:2"]);
        assert_eq!(backend.stored_len().await, 2);
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.stored_len().await, 1);
    }
}
