//! # Coffer Secrets Engine
//!
//! Versioned key/value secrets scoped by project, environment and folder.
//!
//! ## Features
//!
//! - Every write creates a new version; old versions stay readable
//! - Rollback re-publishes an old version as the newest one
//! - Optimistic concurrency through an expected version on update
//! - Values encrypted with a per-project key derived from the root key,
//!   with the secret id and version bound as associated data

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info};
use uuid::Uuid;

use coffer_crypto::{DataKey, RootKey};
use coffer_projects::path;
use coffer_storage_sqlite::SqliteBackend;

pub use error::SecretsError;

const KEY_PURPOSE: &str = "secrets";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS secrets (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    environment TEXT NOT NULL,
    folder      TEXT NOT NULL,
    key         TEXT NOT NULL,
    version     INTEGER NOT NULL,
    comment     TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    UNIQUE (project_id, environment, folder, key)
);

CREATE TABLE IF NOT EXISTS secret_versions (
    secret_id   TEXT NOT NULL,
    version     INTEGER NOT NULL,
    key         TEXT NOT NULL,
    value       BLOB NOT NULL,
    comment     TEXT,
    created_at  INTEGER NOT NULL,
    created_by  TEXT,
    PRIMARY KEY (secret_id, version)
);

CREATE INDEX IF NOT EXISTS idx_secrets_scope ON secrets(project_id, environment, folder)
"#;

/// Where a secret lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretLocation {
    /// Project id.
    pub project_id: String,
    /// Environment slug.
    pub environment: String,
    /// Absolute folder path.
    pub folder: String,
}

impl SecretLocation {
    /// Builds a location, normalizing the folder path.
    pub fn new(
        project_id: impl Into<String>,
        environment: impl Into<String>,
        folder: &str,
    ) -> Result<Self, SecretsError> {
        let folder =
            path::normalize(folder).map_err(|e| SecretsError::InvalidPath(e.to_string()))?;
        Ok(Self {
            project_id: project_id.into(),
            environment: environment.into(),
            folder,
        })
    }
}

/// A decrypted secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Stable id, kept across renames.
    pub id: String,
    /// Environment slug.
    pub environment: String,
    /// Folder path.
    pub secret_path: String,
    /// Secret key.
    pub key: String,
    /// Decrypted value.
    pub value: String,
    /// Version number.
    pub version: u32,
    /// Optional comment.
    pub comment: Option<String>,
    /// Creation time of the secret.
    pub created_at: u64,
    /// Time of the latest version.
    pub updated_at: u64,
}

/// A historical version, without its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVersionInfo {
    /// Version number.
    pub version: u32,
    /// Key at that version.
    pub key: String,
    /// Creation time of the version.
    pub created_at: u64,
    /// Actor that wrote the version.
    pub created_by: Option<String>,
}

/// Partial update of a secret.
#[derive(Debug, Clone, Default)]
pub struct SecretUpdate {
    /// New value.
    pub value: Option<String>,
    /// Rename the secret.
    pub new_key: Option<String>,
    /// New comment.
    pub comment: Option<String>,
    /// Fail unless the current version equals this one.
    pub expected_version: Option<u32>,
}

/// One write of a batch applied atomically by [`SecretsEngine::apply`].
#[derive(Debug, Clone)]
pub enum SecretWrite {
    /// Create a secret.
    Create {
        /// Secret key.
        key: String,
        /// Initial value.
        value: String,
        /// Optional comment.
        comment: Option<String>,
    },
    /// Write a new version of a secret.
    Update {
        /// Secret key.
        key: String,
        /// Changes to apply.
        update: SecretUpdate,
    },
    /// Delete a secret and its history.
    Delete {
        /// Secret key.
        key: String,
    },
}

type SecretRow = (String, String, String, String, i64, Option<String>, i64, i64);

/// The secrets engine.
pub struct SecretsEngine {
    storage: SqliteBackend,
    root_key: RootKey,
}

impl SecretsEngine {
    /// Creates the engine and its tables on `storage`.
    pub async fn new(storage: SqliteBackend, root_key: RootKey) -> Result<Self, SecretsError> {
        storage.execute_raw(SCHEMA).await?;
        info!("Secrets engine initialized");
        Ok(Self { storage, root_key })
    }

    fn data_key(&self, project_id: &str) -> Result<DataKey, SecretsError> {
        Ok(self.root_key.data_key(project_id, KEY_PURPOSE)?)
    }

    fn aad(secret_id: &str, version: u32) -> String {
        format!("{}:{}", secret_id, version)
    }

    fn validate_key(key: &str) -> Result<(), SecretsError> {
        if key.is_empty() || key.len() > 256 {
            return Err(SecretsError::InvalidKey(
                "key must be 1 to 256 characters".into(),
            ));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(SecretsError::InvalidKey(format!(
                "key '{}' must match [A-Za-z0-9_.-]+",
                key
            )));
        }
        Ok(())
    }

    fn now() -> i64 {
        coffer_projects::now() as i64
    }

    async fn find_row(
        conn: &mut SqliteConnection,
        loc: &SecretLocation,
        key: &str,
    ) -> Result<Option<SecretRow>, SecretsError> {
        Ok(sqlx::query_as(
            "SELECT id, environment, folder, key, version, comment, created_at, updated_at FROM secrets WHERE project_id = ? AND environment = ? AND folder = ? AND key = ?",
        )
        .bind(&loc.project_id)
        .bind(&loc.environment)
        .bind(&loc.folder)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn require_row(
        conn: &mut SqliteConnection,
        loc: &SecretLocation,
        key: &str,
    ) -> Result<SecretRow, SecretsError> {
        Self::find_row(conn, loc, key)
            .await?
            .ok_or_else(|| {
                SecretsError::NotFound(format!("{}:{}/{}", loc.environment, loc.folder, key))
            })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_version(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        secret_id: &str,
        version: u32,
        key: &str,
        value: &str,
        comment: Option<&str>,
        actor: &str,
        now: i64,
    ) -> Result<(), SecretsError> {
        let sealed = self
            .data_key(project_id)?
            .seal(value.as_bytes(), Self::aad(secret_id, version).as_bytes())?;

        sqlx::query(
            "INSERT INTO secret_versions (secret_id, version, key, value, comment, created_at, created_by) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(secret_id)
        .bind(version as i64)
        .bind(key)
        .bind(sealed)
        .bind(comment)
        .bind(now)
        .bind(actor)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn read_value(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        secret_id: &str,
        version: u32,
    ) -> Result<Option<(String, String, Option<String>, i64)>, SecretsError> {
        let row: Option<(String, Vec<u8>, Option<String>, i64)> = sqlx::query_as(
            "SELECT key, value, comment, created_at FROM secret_versions WHERE secret_id = ? AND version = ?",
        )
        .bind(secret_id)
        .bind(version as i64)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((key, sealed, comment, created_at)) = row else {
            return Ok(None);
        };

        let plain = self
            .data_key(project_id)?
            .open(&sealed, Self::aad(secret_id, version).as_bytes())?;
        let value = String::from_utf8(plain.to_vec())
            .map_err(|e| SecretsError::Crypto(format!("value is not UTF-8: {}", e)))?;

        Ok(Some((key, value, comment, created_at)))
    }

    async fn materialize(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        row: SecretRow,
    ) -> Result<Secret, SecretsError> {
        let (id, environment, folder, key, version, comment, created_at, updated_at) = row;
        let version = version as u32;
        let (_, value, _, _) = self
            .read_value(conn, project_id, &id, version)
            .await?
            .ok_or_else(|| SecretsError::VersionNotFound {
                key: key.clone(),
                version,
            })?;

        Ok(Secret {
            id,
            environment,
            secret_path: folder,
            key,
            value,
            version,
            comment,
            created_at: created_at as u64,
            updated_at: updated_at as u64,
        })
    }

    async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        loc: &SecretLocation,
        key: &str,
        value: &str,
        comment: Option<&str>,
        actor: &str,
    ) -> Result<Secret, SecretsError> {
        Self::validate_key(key)?;
        if Self::find_row(conn, loc, key).await?.is_some() {
            return Err(SecretsError::AlreadyExists(key.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = Self::now();

        sqlx::query(
            "INSERT INTO secrets (id, project_id, environment, folder, key, version, comment, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&loc.project_id)
        .bind(&loc.environment)
        .bind(&loc.folder)
        .bind(key)
        .bind(comment)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        self.write_version(conn, &loc.project_id, &id, 1, key, value, comment, actor, now)
            .await?;

        debug!(
            project_id = %loc.project_id,
            environment = %loc.environment,
            folder = %loc.folder,
            key = key,
            "Secret created"
        );

        Ok(Secret {
            id,
            environment: loc.environment.clone(),
            secret_path: loc.folder.clone(),
            key: key.to_string(),
            value: value.to_string(),
            version: 1,
            comment: comment.map(str::to_string),
            created_at: now as u64,
            updated_at: now as u64,
        })
    }

    async fn update_in(
        &self,
        conn: &mut SqliteConnection,
        loc: &SecretLocation,
        key: &str,
        update: SecretUpdate,
        actor: &str,
    ) -> Result<Secret, SecretsError> {
        let row = Self::require_row(conn, loc, key).await?;
        let current = self.materialize(conn, &loc.project_id, row).await?;

        if let Some(expected) = update.expected_version {
            if expected != current.version {
                return Err(SecretsError::VersionMismatch {
                    expected,
                    found: current.version,
                });
            }
        }

        let new_key = match update.new_key {
            Some(new_key) if new_key != current.key => {
                Self::validate_key(&new_key)?;
                if Self::find_row(conn, loc, &new_key).await?.is_some() {
                    return Err(SecretsError::AlreadyExists(new_key));
                }
                new_key
            },
            _ => current.key.clone(),
        };
        let value = update.value.unwrap_or(current.value);
        let comment = update.comment.or(current.comment);
        let version = current.version + 1;
        let now = Self::now();

        self.write_version(
            conn,
            &loc.project_id,
            &current.id,
            version,
            &new_key,
            &value,
            comment.as_deref(),
            actor,
            now,
        )
        .await?;

        sqlx::query("UPDATE secrets SET key = ?, version = ?, comment = ?, updated_at = ? WHERE id = ?")
            .bind(&new_key)
            .bind(version as i64)
            .bind(comment.as_deref())
            .bind(now)
            .bind(&current.id)
            .execute(&mut *conn)
            .await?;

        debug!(secret_id = %current.id, version = version, "Secret updated");

        Ok(Secret {
            key: new_key,
            value,
            version,
            comment,
            updated_at: now as u64,
            ..current
        })
    }

    async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        loc: &SecretLocation,
        key: &str,
    ) -> Result<Secret, SecretsError> {
        let row = Self::require_row(conn, loc, key).await?;
        let secret = self.materialize(conn, &loc.project_id, row).await?;
        Self::purge(conn, &secret.id).await?;

        info!(secret_id = %secret.id, key = key, "Secret deleted");
        Ok(secret)
    }

    async fn purge(conn: &mut SqliteConnection, secret_id: &str) -> Result<(), SecretsError> {
        sqlx::query("DELETE FROM secret_versions WHERE secret_id = ?")
            .bind(secret_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM secrets WHERE id = ?")
            .bind(secret_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        loc: &SecretLocation,
        key: &str,
        version: Option<u32>,
    ) -> Result<Secret, SecretsError> {
        let row = Self::require_row(conn, loc, key).await?;
        let latest = self.materialize(conn, &loc.project_id, row).await?;

        let Some(version) = version.filter(|v| *v != latest.version) else {
            return Ok(latest);
        };

        let (old_key, value, comment, created_at) = self
            .read_value(conn, &loc.project_id, &latest.id, version)
            .await?
            .ok_or_else(|| SecretsError::VersionNotFound {
                key: key.to_string(),
                version,
            })?;

        Ok(Secret {
            key: old_key,
            value,
            version,
            comment,
            updated_at: created_at as u64,
            ..latest
        })
    }

    /// Creates a secret at version 1.
    pub async fn create(
        &self,
        loc: &SecretLocation,
        key: &str,
        value: &str,
        comment: Option<&str>,
        actor: &str,
    ) -> Result<Secret, SecretsError> {
        let mut tx = self.storage.pool().begin().await?;
        let secret = self.create_in(&mut tx, loc, key, value, comment, actor).await?;
        tx.commit().await?;
        Ok(secret)
    }

    /// Writes a new version of a secret.
    pub async fn update(
        &self,
        loc: &SecretLocation,
        key: &str,
        update: SecretUpdate,
        actor: &str,
    ) -> Result<Secret, SecretsError> {
        let mut tx = self.storage.pool().begin().await?;
        let secret = self.update_in(&mut tx, loc, key, update, actor).await?;
        tx.commit().await?;
        Ok(secret)
    }

    /// Deletes a secret and its history. Returns the deleted secret.
    pub async fn delete(&self, loc: &SecretLocation, key: &str) -> Result<Secret, SecretsError> {
        let mut tx = self.storage.pool().begin().await?;
        let secret = self.delete_in(&mut tx, loc, key).await?;
        tx.commit().await?;
        Ok(secret)
    }

    /// Applies `writes` in order inside one transaction.
    ///
    /// Either every write lands or none does. Returns the resulting secret of
    /// each write (the removed secret for deletes).
    pub async fn apply(
        &self,
        loc: &SecretLocation,
        writes: Vec<SecretWrite>,
        actor: &str,
    ) -> Result<Vec<Secret>, SecretsError> {
        let mut tx = self.storage.pool().begin().await?;
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let secret = match write {
                SecretWrite::Create {
                    key,
                    value,
                    comment,
                } => {
                    self.create_in(&mut tx, loc, &key, &value, comment.as_deref(), actor)
                        .await?
                },
                SecretWrite::Update { key, update } => {
                    self.update_in(&mut tx, loc, &key, update, actor).await?
                },
                SecretWrite::Delete { key } => self.delete_in(&mut tx, loc, &key).await?,
            };
            results.push(secret);
        }
        tx.commit().await?;

        debug!(
            project_id = %loc.project_id,
            environment = %loc.environment,
            folder = %loc.folder,
            writes = results.len(),
            "Secret batch applied"
        );
        Ok(results)
    }

    /// Reads the latest version, or `version` when given.
    pub async fn get(
        &self,
        loc: &SecretLocation,
        key: &str,
        version: Option<u32>,
    ) -> Result<Secret, SecretsError> {
        let mut conn = self.storage.pool().acquire().await?;
        self.get_in(&mut conn, loc, key, version).await
    }

    /// Lists the secrets of a folder, or of the folder and every folder
    /// below it when `recursive` is set. Sorted by folder then key.
    pub async fn list(
        &self,
        project_id: &str,
        environment: &str,
        folder: &str,
        recursive: bool,
    ) -> Result<Vec<Secret>, SecretsError> {
        let folder =
            path::normalize(folder).map_err(|e| SecretsError::InvalidPath(e.to_string()))?;
        let mut conn = self.storage.pool().acquire().await?;

        let rows: Vec<SecretRow> = sqlx::query_as(
            "SELECT id, environment, folder, key, version, comment, created_at, updated_at FROM secrets WHERE project_id = ? AND environment = ? ORDER BY folder, key",
        )
        .bind(project_id)
        .bind(environment)
        .fetch_all(&mut *conn)
        .await?;

        let mut secrets = Vec::new();
        for row in rows {
            let in_scope = if recursive {
                path::is_within(&row.2, &folder)
            } else {
                row.2 == folder
            };
            if in_scope {
                secrets.push(self.materialize(&mut conn, project_id, row).await?);
            }
        }
        Ok(secrets)
    }

    /// Lists the versions of a secret, newest first.
    pub async fn versions(
        &self,
        loc: &SecretLocation,
        key: &str,
    ) -> Result<Vec<SecretVersionInfo>, SecretsError> {
        let mut conn = self.storage.pool().acquire().await?;
        let (id, ..) = Self::require_row(&mut conn, loc, key).await?;

        let rows: Vec<(i64, String, i64, Option<String>)> = sqlx::query_as(
            "SELECT version, key, created_at, created_by FROM secret_versions WHERE secret_id = ? ORDER BY version DESC",
        )
        .bind(&id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(version, key, created_at, created_by)| SecretVersionInfo {
                version: version as u32,
                key,
                created_at: created_at as u64,
                created_by,
            })
            .collect())
    }

    /// Publishes the value of `version` as a new version.
    pub async fn rollback(
        &self,
        loc: &SecretLocation,
        key: &str,
        version: u32,
        actor: &str,
    ) -> Result<Secret, SecretsError> {
        let mut tx = self.storage.pool().begin().await?;
        let old = self.get_in(&mut tx, loc, key, Some(version)).await?;
        let secret = self
            .update_in(
                &mut tx,
                loc,
                key,
                SecretUpdate {
                    value: Some(old.value),
                    ..Default::default()
                },
                actor,
            )
            .await?;
        tx.commit().await?;

        info!(
            secret_id = %secret.id,
            from_version = version,
            to_version = secret.version,
            "Secret rolled back"
        );
        Ok(secret)
    }

    /// Deletes every secret in `folder` and below. Returns how many.
    pub async fn delete_folder(
        &self,
        project_id: &str,
        environment: &str,
        folder: &str,
    ) -> Result<usize, SecretsError> {
        let secrets = self.list(project_id, environment, folder, true).await?;
        let mut tx = self.storage.pool().begin().await?;
        for secret in &secrets {
            Self::purge(&mut tx, &secret.id).await?;
        }
        tx.commit().await?;
        if !secrets.is_empty() {
            info!(
                project_id = project_id,
                environment = environment,
                folder = %folder,
                count = secrets.len(),
                "Folder secrets deleted"
            );
        }
        Ok(secrets.len())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    async fn setup() -> SecretsEngine {
        let storage = SqliteBackend::in_memory().await.unwrap();
        SecretsEngine::new(storage, RootKey::generate()).await.unwrap()
    }

    fn loc(folder: &str) -> SecretLocation {
        SecretLocation::new("p1", "dev", folder).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let engine = setup().await;
        let created = engine
            .create(&loc("/"), "DB_URL", "postgres://db", Some("primary"), "u1")
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let secret = engine.get(&loc("/"), "DB_URL", None).await.unwrap();
        assert_eq!(secret.value, "postgres://db");
        assert_eq!(secret.comment.as_deref(), Some("primary"));
        assert_eq!(secret.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let engine = setup().await;
        engine.create(&loc("/"), "K", "1", None, "u1").await.unwrap();
        assert!(matches!(
            engine.create(&loc("/"), "K", "2", None, "u1").await,
            Err(SecretsError::AlreadyExists(_))
        ));
        engine.create(&loc("/app"), "K", "3", None, "u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_key_and_path() {
        let engine = setup().await;
        assert!(matches!(
            engine.create(&loc("/"), "bad key", "v", None, "u1").await,
            Err(SecretsError::InvalidKey(_))
        ));
        assert!(matches!(
            SecretLocation::new("p1", "dev", "relative"),
            Err(SecretsError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_update_creates_versions() {
        let engine = setup().await;
        engine.create(&loc("/"), "TOKEN", "v1", None, "u1").await.unwrap();

        let updated = engine
            .update(
                &loc("/"),
                "TOKEN",
                SecretUpdate {
                    value: Some("v2".into()),
                    ..Default::default()
                },
                "u2",
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let old = engine.get(&loc("/"), "TOKEN", Some(1)).await.unwrap();
        assert_eq!(old.value, "v1");

        let versions = engine.versions(&loc("/"), "TOKEN").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[0].created_by.as_deref(), Some("u2"));

        assert!(matches!(
            engine.get(&loc("/"), "TOKEN", Some(9)).await,
            Err(SecretsError::VersionNotFound { version: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_update_expected_version() {
        let engine = setup().await;
        engine.create(&loc("/"), "K", "v1", None, "u1").await.unwrap();

        let result = engine
            .update(
                &loc("/"),
                "K",
                SecretUpdate {
                    value: Some("v2".into()),
                    expected_version: Some(3),
                    ..Default::default()
                },
                "u1",
            )
            .await;
        assert!(matches!(
            result,
            Err(SecretsError::VersionMismatch {
                expected: 3,
                found: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_rename() {
        let engine = setup().await;
        engine.create(&loc("/"), "OLD", "v", None, "u1").await.unwrap();
        engine.create(&loc("/"), "TAKEN", "v", None, "u1").await.unwrap();

        assert!(matches!(
            engine
                .update(
                    &loc("/"),
                    "OLD",
                    SecretUpdate {
                        new_key: Some("TAKEN".into()),
                        ..Default::default()
                    },
                    "u1",
                )
                .await,
            Err(SecretsError::AlreadyExists(_))
        ));

        engine
            .update(
                &loc("/"),
                "OLD",
                SecretUpdate {
                    new_key: Some("NEW".into()),
                    ..Default::default()
                },
                "u1",
            )
            .await
            .unwrap();
        assert!(engine.get(&loc("/"), "OLD", None).await.is_err());
        assert_eq!(engine.get(&loc("/"), "NEW", None).await.unwrap().value, "v");
    }

    #[tokio::test]
    async fn test_rollback() {
        let engine = setup().await;
        engine.create(&loc("/"), "K", "good", None, "u1").await.unwrap();
        engine
            .update(
                &loc("/"),
                "K",
                SecretUpdate {
                    value: Some("bad".into()),
                    ..Default::default()
                },
                "u1",
            )
            .await
            .unwrap();

        let rolled = engine.rollback(&loc("/"), "K", 1, "u1").await.unwrap();
        assert_eq!(rolled.version, 3);
        assert_eq!(rolled.value, "good");
    }

    #[tokio::test]
    async fn test_list_and_delete_folder() {
        let engine = setup().await;
        engine.create(&loc("/"), "A", "1", None, "u1").await.unwrap();
        engine.create(&loc("/app"), "B", "2", None, "u1").await.unwrap();
        engine.create(&loc("/app/db"), "C", "3", None, "u1").await.unwrap();
        engine.create(&loc("/application"), "D", "4", None, "u1").await.unwrap();

        assert_eq!(engine.list("p1", "dev", "/", false).await.unwrap().len(), 1);
        let keys: Vec<String> = engine
            .list("p1", "dev", "/app", true)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["B", "C"]);
        assert!(engine.list("p1", "prod", "/", true).await.unwrap().is_empty());

        assert_eq!(engine.delete_folder("p1", "dev", "/app").await.unwrap(), 2);
        assert_eq!(engine.list("p1", "dev", "/", true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let engine = setup().await;
        engine.create(&loc("/"), "K", "v", None, "u1").await.unwrap();
        let deleted = engine.delete(&loc("/"), "K").await.unwrap();
        assert_eq!(deleted.value, "v");
        assert!(matches!(
            engine.get(&loc("/"), "K", None).await,
            Err(SecretsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_values_encrypted_at_rest() {
        let engine = setup().await;
        engine
            .create(&loc("/"), "K", "plaintext-marker", None, "u1")
            .await
            .unwrap();

        let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM secret_versions")
            .fetch_all(engine.storage.pool())
            .await
            .unwrap();
        let needle = b"plaintext-marker";
        assert!(!rows[0].0.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn test_apply_writes_batch() {
        let engine = setup().await;
        engine.create(&loc("/"), "OLD", "v", None, "u1").await.unwrap();

        let results = engine
            .apply(
                &loc("/"),
                vec![
                    SecretWrite::Create {
                        key: "A".into(),
                        value: "a".into(),
                        comment: None,
                    },
                    SecretWrite::Update {
                        key: "A".into(),
                        update: SecretUpdate {
                            value: Some("a2".into()),
                            ..Default::default()
                        },
                    },
                    SecretWrite::Delete { key: "OLD".into() },
                ],
                "u2",
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].version, 2);

        let a = engine.get(&loc("/"), "A", None).await.unwrap();
        assert_eq!(a.value, "a2");
        assert!(matches!(
            engine.get(&loc("/"), "OLD", None).await,
            Err(SecretsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_conflict_writes_nothing() {
        let engine = setup().await;
        engine.create(&loc("/"), "B", "existing", None, "u1").await.unwrap();
        engine.create(&loc("/"), "C", "keep", None, "u1").await.unwrap();

        let result = engine
            .apply(
                &loc("/"),
                vec![
                    SecretWrite::Create {
                        key: "A".into(),
                        value: "a".into(),
                        comment: None,
                    },
                    SecretWrite::Delete { key: "C".into() },
                    SecretWrite::Create {
                        key: "B".into(),
                        value: "b".into(),
                        comment: None,
                    },
                ],
                "u2",
            )
            .await;
        assert!(matches!(result, Err(SecretsError::AlreadyExists(_))));

        assert!(matches!(
            engine.get(&loc("/"), "A", None).await,
            Err(SecretsError::NotFound(_))
        ));
        assert_eq!(engine.get(&loc("/"), "C", None).await.unwrap().value, "keep");
        assert_eq!(engine.get(&loc("/"), "B", None).await.unwrap().value, "existing");
        assert_eq!(engine.list("p1", "dev", "/", false).await.unwrap().len(), 2);
    }
}
