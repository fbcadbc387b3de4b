//! Typed JSON documents on top of a [`StorageBackend`].

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::{StorageBackend, StorageError};

/// A named set of JSON documents of type `T`.
///
/// Documents live at `{name}/{id}`. Ids may themselves contain `/` to group
/// documents under a parent, e.g. `leases/{dynamic_secret_id}/{lease_id}`.
pub struct Collection<T> {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            prefix: self.prefix.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Opens the collection `name` on `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, name: &str) -> Self {
        Self {
            backend,
            prefix: format!("{}/", name.trim_end_matches('/')),
            _marker: PhantomData,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Loads a document.
    pub async fn get(&self, id: &str) -> Result<Option<T>, StorageError> {
        match self.backend.get(&self.key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Loads a document, failing with [`StorageError::NotFound`] if absent.
    pub async fn require(&self, id: &str) -> Result<T, StorageError> {
        self.get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(self.key(id)))
    }

    /// Writes a document, replacing any previous version.
    pub async fn put(&self, id: &str, doc: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(doc)?;
        self.backend.put(&self.key(id), &raw).await
    }

    /// Writes a new document, failing if `id` is taken.
    pub async fn insert(&self, id: &str, doc: &T) -> Result<(), StorageError> {
        let key = self.key(id);
        if self.backend.exists(&key).await? {
            return Err(StorageError::AlreadyExists(key));
        }
        self.put(id, doc).await
    }

    /// Removes a document. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let key = self.key(id);
        let existed = self.backend.exists(&key).await?;
        if existed {
            self.backend.delete(&key).await?;
        }
        Ok(existed)
    }

    /// Loads every document in the collection, in key order.
    pub async fn all(&self) -> Result<Vec<T>, StorageError> {
        self.under("").await
    }

    /// Loads every document whose id starts with `id_prefix`.
    pub async fn under(&self, id_prefix: &str) -> Result<Vec<T>, StorageError> {
        self.backend
            .scan(&self.key(id_prefix))
            .await?
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(StorageError::from))
            .collect()
    }

    /// Loads every document matching `pred`.
    pub async fn find<F>(&self, pred: F) -> Result<Vec<T>, StorageError>
    where
        F: Fn(&T) -> bool + Send,
    {
        Ok(self.all().await?.into_iter().filter(|d| pred(d)).collect())
    }

    /// Loads the first document matching `pred`.
    pub async fn find_one<F>(&self, pred: F) -> Result<Option<T>, StorageError>
    where
        F: Fn(&T) -> bool + Send,
    {
        Ok(self.all().await?.into_iter().find(|d| pred(d)))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Folder {
        name: String,
        depth: u32,
    }

    fn folders() -> Collection<Folder> {
        Collection::new(Arc::new(MemoryBackend::new()), "folders")
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let col = folders();
        let doc = Folder {
            name: "app".into(),
            depth: 1,
        };

        col.insert("f1", &doc).await.unwrap();
        assert_eq!(col.get("f1").await.unwrap(), Some(doc.clone()));
        assert!(matches!(
            col.insert("f1", &doc).await,
            Err(StorageError::AlreadyExists(_))
        ));

        assert!(col.remove("f1").await.unwrap());
        assert!(!col.remove("f1").await.unwrap());
        assert!(matches!(
            col.require("f1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_under_and_find() {
        let col = folders();
        for (id, depth) in [("p1/a", 1), ("p1/b", 2), ("p2/c", 1)] {
            col.put(
                id,
                &Folder {
                    name: id.into(),
                    depth,
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(col.under("p1/").await.unwrap().len(), 2);
        assert_eq!(col.find(|f| f.depth == 1).await.unwrap().len(), 2);
        let found = col.find_one(|f| f.depth == 2).await.unwrap().unwrap();
        assert_eq!(found.name, "p1/b");
    }
}
