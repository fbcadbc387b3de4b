//! # Coffer KMIP
//!
//! KMIP clients and the symmetric keys they manage.
//!
//! Clients are registered per project with a set of allowed operations.
//! Operations are carried over HTTP/JSON; each one is checked against the
//! calling client's permissions before it touches an object.
//!
//! ## Object lifecycle
//!
//! ```text
//! PreActive ──activate──▶ Active ──revoke──▶ Deactivated ──destroy──▶ Destroyed
//!     └──────────────revoke / destroy──────────────▲
//! ```
//!
//! Active objects must be revoked before they can be destroyed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod operations;

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use coffer_crypto::{DataKey, RootKey};
use coffer_projects::now;
use coffer_storage::{Collection, StorageBackend};

pub use error::KmipError;
pub use models::{
    ClientListOptions, KeyMaterial, KmipClient, KmipClientUpdate, KmipPermission, ManagedObject,
    NewKmipClient, ObjectState, OrderDirection, SymmetricAlgorithm,
};

use models::StoredObject;

const KEY_PURPOSE: &str = "kmip";
const MAX_NAME_LEN: usize = 64;

fn validate_name(name: &str) -> Result<String, KmipError> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(KmipError::Invalid(format!(
            "client name must be 1 to {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn dedup_permissions(mut permissions: Vec<KmipPermission>) -> Vec<KmipPermission> {
    permissions.sort();
    permissions.dedup();
    permissions
}

/// Stores KMIP clients and managed objects.
pub struct KmipEngine {
    root_key: RootKey,
    clients: Collection<KmipClient>,
    objects: Collection<StoredObject>,
}

impl KmipEngine {
    /// Creates the engine.
    pub fn new(storage: Arc<dyn StorageBackend>, root_key: RootKey) -> Self {
        Self {
            root_key,
            clients: Collection::new(Arc::clone(&storage), "kmip-clients"),
            objects: Collection::new(storage, "kmip-objects"),
        }
    }

    fn data_key(&self, project_id: &str) -> Result<DataKey, KmipError> {
        Ok(self.root_key.data_key(project_id, KEY_PURPOSE)?)
    }

    fn doc_id(project_id: &str, id: &str) -> String {
        format!("{}/{}", project_id, id)
    }

    async fn name_taken(&self, project_id: &str, name: &str) -> Result<bool, KmipError> {
        Ok(self
            .clients
            .under(&format!("{}/", project_id))
            .await?
            .iter()
            .any(|c| c.name == name))
    }

    // ---- Clients -------------------------------------------------------

    /// Registers a client.
    pub async fn create_client(
        &self,
        project_id: &str,
        new: NewKmipClient,
    ) -> Result<KmipClient, KmipError> {
        let name = validate_name(&new.name)?;
        if self.name_taken(project_id, &name).await? {
            return Err(KmipError::AlreadyExists(format!("KMIP client '{}'", name)));
        }

        let now = now();
        let client = KmipClient {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name,
            description: new.description,
            permissions: dedup_permissions(new.permissions),
            created_at: now,
            updated_at: now,
        };
        self.clients
            .insert(&Self::doc_id(project_id, &client.id), &client)
            .await?;

        info!(project_id = %project_id, client_id = %client.id, "KMIP client created");
        Ok(client)
    }

    /// Loads a client of `project_id`.
    pub async fn get_client(
        &self,
        project_id: &str,
        client_id: &str,
    ) -> Result<KmipClient, KmipError> {
        self.clients
            .get(&Self::doc_id(project_id, client_id))
            .await?
            .ok_or_else(|| KmipError::NotFound(format!("KMIP client '{}'", client_id)))
    }

    /// Applies a partial update.
    pub async fn update_client(
        &self,
        project_id: &str,
        client_id: &str,
        update: KmipClientUpdate,
    ) -> Result<KmipClient, KmipError> {
        let mut client = self.get_client(project_id, client_id).await?;

        if let Some(name) = update.name {
            let name = validate_name(&name)?;
            if name != client.name && self.name_taken(project_id, &name).await? {
                return Err(KmipError::AlreadyExists(format!("KMIP client '{}'", name)));
            }
            client.name = name;
        }
        if let Some(description) = update.description {
            client.description = Some(description);
        }
        if let Some(permissions) = update.permissions {
            client.permissions = dedup_permissions(permissions);
        }
        client.updated_at = now();
        self.clients
            .put(&Self::doc_id(project_id, client_id), &client)
            .await?;

        info!(client_id = %client.id, "KMIP client updated");
        Ok(client)
    }

    /// Deletes a client. Objects it created are kept.
    pub async fn delete_client(
        &self,
        project_id: &str,
        client_id: &str,
    ) -> Result<KmipClient, KmipError> {
        let client = self.get_client(project_id, client_id).await?;
        self.clients
            .remove(&Self::doc_id(project_id, client_id))
            .await?;
        info!(client_id = %client.id, "KMIP client deleted");
        Ok(client)
    }

    /// Lists clients ordered by name. Returns the page and the total count
    /// after filtering.
    pub async fn list_clients(
        &self,
        project_id: &str,
        options: ClientListOptions,
    ) -> Result<(Vec<KmipClient>, usize), KmipError> {
        let search = options.search.map(|s| s.to_lowercase());
        let mut clients: Vec<KmipClient> = self
            .clients
            .under(&format!("{}/", project_id))
            .await?
            .into_iter()
            .filter(|c| match search.as_deref() {
                Some(s) => c.name.to_lowercase().contains(s),
                None => true,
            })
            .collect();

        clients.sort_by(|a, b| a.name.cmp(&b.name));
        if options.order == OrderDirection::Desc {
            clients.reverse();
        }
        let total = clients.len();
        let page = clients
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect();
        Ok((page, total))
    }

    /// Loads the client and checks it may perform `permission`.
    pub async fn authorize(
        &self,
        project_id: &str,
        client_id: &str,
        permission: KmipPermission,
    ) -> Result<KmipClient, KmipError> {
        let client = self.get_client(project_id, client_id).await?;
        check(&client, permission)?;
        Ok(client)
    }
}

pub(crate) fn check(client: &KmipClient, permission: KmipPermission) -> Result<(), KmipError> {
    if client.can(permission) {
        Ok(())
    } else {
        Err(KmipError::Forbidden(permission.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use coffer_storage::MemoryBackend;

    pub(crate) fn engine() -> KmipEngine {
        KmipEngine::new(Arc::new(MemoryBackend::new()), RootKey::generate())
    }

    fn client(name: &str, permissions: &[KmipPermission]) -> NewKmipClient {
        NewKmipClient {
            name: name.into(),
            description: None,
            permissions: permissions.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_client_crud() {
        let engine = engine();
        let created = engine
            .create_client(
                "p1",
                client(
                    "backup-agent",
                    &[KmipPermission::Get, KmipPermission::Create, KmipPermission::Get],
                ),
            )
            .await
            .unwrap();
        assert_eq!(
            created.permissions,
            vec![KmipPermission::Create, KmipPermission::Get]
        );

        assert!(matches!(
            engine.create_client("p1", client("backup-agent", &[])).await,
            Err(KmipError::AlreadyExists(_))
        ));
        // same name in another project is fine
        engine
            .create_client("p2", client("backup-agent", &[]))
            .await
            .unwrap();

        let updated = engine
            .update_client(
                "p1",
                &created.id,
                KmipClientUpdate {
                    permissions: Some(vec![KmipPermission::Locate]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.can(KmipPermission::Locate));
        assert!(!updated.can(KmipPermission::Get));

        assert!(engine.get_client("p2", &created.id).await.is_err());
        engine.delete_client("p1", &created.id).await.unwrap();
        assert!(matches!(
            engine.get_client("p1", &created.id).await,
            Err(KmipError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_clients() {
        let engine = engine();
        for name in ["hsm-b", "hsm-a", "backup"] {
            engine.create_client("p1", client(name, &[])).await.unwrap();
        }

        let (page, total) = engine
            .list_clients(
                "p1",
                ClientListOptions {
                    search: Some("HSM".into()),
                    order: OrderDirection::Desc,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page[0].name, "hsm-b");

        let (page, total) = engine
            .list_clients(
                "p1",
                ClientListOptions {
                    offset: 1,
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "hsm-a");
    }

    #[test]
    fn test_permission_names() {
        assert_eq!(
            "get-attributes".parse::<KmipPermission>().unwrap(),
            KmipPermission::GetAttributes
        );
        assert!("encrypt".parse::<KmipPermission>().is_err());
        assert_eq!(
            serde_json::to_string(&KmipPermission::GetAttributes).unwrap(),
            "\"get-attributes\""
        );
    }
}
