//! # Coffer Storage - SQLite Backend
//!
//! SQLite implementation of [`StorageBackend`]. An organization's data lives in
//! its own database file; dev mode and tests use a private in-memory database.
//!
//! Besides the generic key/value table, the pool is shared with engines that
//! keep relational tables of their own (the secrets engine).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use coffer_storage::{StorageBackend, StorageError};

/// SQLite storage backend.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    actor: Option<String>,
}

fn query_failed(e: sqlx::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}

impl SqliteBackend {
    /// Opens or creates `{base_path}/{tenant}.db`.
    ///
    /// `tenant` must match `[a-z0-9_-]{1,64}`.
    pub async fn open(base_path: impl AsRef<Path>, tenant: &str) -> Result<Self, StorageError> {
        Self::validate_tenant(tenant)?;

        let base = base_path.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
        })?;

        let db_path = base.join(format!("{tenant}.db"));
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        debug!(tenant = %tenant, path = %db_path.display(), "Opening SQLite database");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let backend = Self { pool, actor: None };
        backend.migrate().await?;

        info!(tenant = %tenant, "SQLite backend ready");
        Ok(backend)
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection that is never recycled, since
    /// every new connection to `sqlite::memory:` is a fresh empty database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let backend = Self { pool, actor: None };
        backend.migrate().await?;

        debug!("In-memory SQLite backend ready");
        Ok(backend)
    }

    /// Returns a copy of this backend that attributes writes to `actor`.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Returns the actor writes are attributed to, if any.
    pub fn current_actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn validate_tenant(tenant: &str) -> Result<(), StorageError> {
        if tenant.is_empty() {
            return Err(StorageError::InvalidInput("tenant cannot be empty".into()));
        }

        if tenant.len() > 64 {
            return Err(StorageError::InvalidInput("tenant name too long".into()));
        }

        let valid = tenant
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !valid {
            return Err(StorageError::InvalidInput(
                "tenant must match [a-z0-9_-]+".into(),
            ));
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        debug!("Running database migrations");

        self.execute_raw(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                version    INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS kv_history (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                key        TEXT NOT NULL,
                value      BLOB,
                version    INTEGER NOT NULL,
                operation  TEXT NOT NULL,
                actor      TEXT,
                timestamp  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_key ON kv_history (key);
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON kv_history (timestamp)
            "#,
        )
        .await
        .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;

        debug!("Migrations complete");
        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    /// Executes `;`-separated statements, used for schema creation.
    pub async fn execute_raw(&self, sql: &str) -> Result<(), StorageError> {
        for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement.trim())
                .execute(&self.pool)
                .await
                .map_err(query_failed)?;
        }
        Ok(())
    }

    async fn current_version(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(row.map(|(v,)| v))
    }

    async fn record_history(
        &self,
        key: &str,
        value: Option<&[u8]>,
        version: i64,
        operation: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_history (key, value, version, operation, actor, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(version)
        .bind(operation)
        .bind(self.actor.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let now = Self::now();

        let (version, operation) = match self.current_version(key).await? {
            Some(v) => (v + 1, "update"),
            None => (1, "create"),
        };

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;

        self.record_history(key, Some(value), version, operation, now)
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let Some(version) = self.current_version(key).await? else {
            return Ok(());
        };

        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;

        self.record_history(key, None, version + 1, "delete", Self::now())
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr instead of LIKE so `_` and `%` in ids match literally
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM kv_store WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        sqlx::query_as(
            "SELECT key, value FROM kv_store WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_db() {
        let tmp = TempDir::new().unwrap();
        let _backend = SqliteBackend::open(tmp.path(), "acme").await.unwrap();
        assert!(tmp.path().join("acme.db").exists());
    }

    #[tokio::test]
    async fn test_tenant_validation() {
        let tmp = TempDir::new().unwrap();

        for name in ["", "Acme", "acme corp", "../escape", "acme.db"] {
            let result = SqliteBackend::open(tmp.path(), name).await;
            assert!(
                matches!(result, Err(StorageError::InvalidInput(_))),
                "should reject tenant name: {name}"
            );
        }

        for name in ["acme", "acme-corp", "org_1", "123"] {
            assert!(SqliteBackend::open(tmp.path(), name).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_in_memory_keeps_data_between_calls() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.put("projects/p1", b"{}").await.unwrap();
        assert_eq!(
            backend.get("projects/p1").await.unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_crud() {
        let backend = SqliteBackend::in_memory().await.unwrap();

        assert!(backend.get("k").await.unwrap().is_none());
        backend.put("k", b"v1").await.unwrap();
        backend.put("k", b"v2").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v2".to_vec()));

        backend.delete("k").await.unwrap();
        assert!(backend.get("k").await.unwrap().is_none());
        backend.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_matches_prefix_literally() {
        let backend = SqliteBackend::in_memory().await.unwrap();

        backend.put("leases/ds_1/a", b"1").await.unwrap();
        backend.put("leases/ds_1/b", b"2").await.unwrap();
        backend.put("leases/dsx1/c", b"3").await.unwrap();
        backend.put("policies/p", b"4").await.unwrap();

        let keys = backend.list("leases/ds_1/").await.unwrap();
        assert_eq!(keys, vec!["leases/ds_1/a", "leases/ds_1/b"]);

        let entries = backend.scan("leases/").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("leases/ds_1/a".to_string(), b"1".to_vec()));

        assert_eq!(backend.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_history_records_actor_and_operations() {
        let backend = SqliteBackend::in_memory()
            .await
            .unwrap()
            .with_actor("user:alice");

        backend.put("key", b"v1").await.unwrap();
        backend.put("key", b"v2").await.unwrap();
        backend.delete("key").await.unwrap();

        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT operation, version, actor FROM kv_history WHERE key = ? ORDER BY id",
        )
        .bind("key")
        .fetch_all(backend.pool())
        .await
        .unwrap();

        assert_eq!(
            rows,
            vec![
                ("create".to_string(), 1, "user:alice".to_string()),
                ("update".to_string(), 2, "user:alice".to_string()),
                ("delete".to_string(), 3, "user:alice".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let tmp = TempDir::new().unwrap();
        let a = SqliteBackend::open(tmp.path(), "org-a").await.unwrap();
        let b = SqliteBackend::open(tmp.path(), "org-b").await.unwrap();

        a.put("shared", b"a").await.unwrap();
        b.put("shared", b"b").await.unwrap();

        assert_eq!(a.get("shared").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(b.get("shared").await.unwrap(), Some(b"b".to_vec()));
    }
}
