//! In-process storage backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError};

/// A [`StorageBackend`] keeping everything in a sorted map.
///
/// Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_crud() {
        let backend = MemoryBackend::new();
        assert!(backend.get("a").await.unwrap().is_none());

        backend.put("a", b"1").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(backend.exists("a").await.unwrap());

        backend.delete("a").await.unwrap();
        assert!(!backend.exists("a").await.unwrap());
        backend.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_list_is_prefix_exact() {
        let backend = MemoryBackend::new();
        backend.put("leases/ds1/a", b"").await.unwrap();
        backend.put("leases/ds1/b", b"").await.unwrap();
        backend.put("leases/ds10/c", b"").await.unwrap();
        backend.put("policies/x", b"").await.unwrap();

        let keys = backend.list("leases/ds1/").await.unwrap();
        assert_eq!(keys, vec!["leases/ds1/a", "leases/ds1/b"]);
        assert_eq!(backend.scan("leases/").await.unwrap().len(), 3);
    }
}
