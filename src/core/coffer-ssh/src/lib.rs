//! # Coffer SSH
//!
//! SSH certificate authorities and certificate templates.
//!
//! A project owns one or more ed25519 CAs. Templates bound to a CA decide
//! which certificates may be signed: certificate types, principals, key ids
//! and lifetimes. Signing emits standard OpenSSH
//! `ssh-ed25519-cert-v01@openssh.com` certificates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod certificates;
pub mod error;
pub mod models;
pub mod templates;
pub mod wire;

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use coffer_crypto::{random, DataKey, RootKey, Sealed};
use coffer_projects::now;
use coffer_storage::{Collection, StorageBackend};

pub use error::SshError;
pub use models::{
    IssueRequest, IssuedCredentials, NewSshCa, NewSshCertTemplate, SignRequest,
    SignedCertificate, SshCa, SshCaUpdate, SshCertTemplate, SshCertTemplateUpdate, SshCertType,
    SshStatus,
};

use models::StoredCa;

const KEY_PURPOSE: &str = "ssh";
const KEY_ALGORITHM: &str = "ed25519";

fn validate_friendly_name(name: &str) -> Result<String, SshError> {
    let name = name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(SshError::Invalid("friendly name must be 1 to 64 characters".into()));
    }
    Ok(name.to_string())
}

/// Stores SSH CAs and templates and signs certificates.
pub struct SshEngine {
    root_key: RootKey,
    cas: Collection<StoredCa>,
    templates: Collection<SshCertTemplate>,
}

impl SshEngine {
    /// Creates the engine.
    pub fn new(storage: Arc<dyn StorageBackend>, root_key: RootKey) -> Self {
        Self {
            root_key,
            cas: Collection::new(Arc::clone(&storage), "ssh-cas"),
            templates: Collection::new(storage, "ssh-certificate-templates"),
        }
    }

    fn data_key(&self, project_id: &str) -> Result<DataKey, SshError> {
        Ok(self.root_key.data_key(project_id, KEY_PURPOSE)?)
    }

    async fn load_ca(&self, project_id: &str, ca_id: &str) -> Result<StoredCa, SshError> {
        self.cas
            .get(ca_id)
            .await?
            .filter(|s| s.ca.project_id == project_id)
            .ok_or_else(|| SshError::NotFound(format!("SSH CA '{}'", ca_id)))
    }

    pub(crate) fn signing_key(&self, stored: &StoredCa) -> Result<SigningKey, SshError> {
        let seed = stored
            .private_key
            .open(&self.data_key(&stored.ca.project_id)?, &stored.ca.id)?;
        if seed.len() != 32 {
            return Err(SshError::InvalidKey("stored CA key has the wrong length".into()));
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(&seed);
        Ok(SigningKey::from_bytes(&bytes))
    }

    // ---- CAs -----------------------------------------------------------

    /// Creates a CA, generating an ed25519 key unless one is supplied.
    pub async fn create_ca(&self, project_id: &str, new: NewSshCa) -> Result<SshCa, SshError> {
        let friendly_name = validate_friendly_name(&new.friendly_name)?;
        let key = match new.private_key.as_deref() {
            Some(pem) => wire::parse_private_key(pem)?,
            None => SigningKey::from_bytes(&random::generate_key()),
        };

        let now = now();
        let ca = SshCa {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            friendly_name,
            key_algorithm: KEY_ALGORITHM.to_string(),
            public_key: wire::format_public_key(&key.verifying_key(), None),
            status: SshStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let private_key = Sealed::seal(&self.data_key(project_id)?, key.as_bytes(), &ca.id)?;
        self.cas
            .insert(
                &ca.id,
                &StoredCa {
                    ca: ca.clone(),
                    private_key,
                },
            )
            .await?;

        info!(project_id = %project_id, ca_id = %ca.id, "SSH CA created");
        Ok(ca)
    }

    /// Loads a CA of `project_id`.
    pub async fn get_ca(&self, project_id: &str, ca_id: &str) -> Result<SshCa, SshError> {
        Ok(self.load_ca(project_id, ca_id).await?.ca)
    }

    /// Lists the CAs of a project, oldest first.
    pub async fn list_cas(&self, project_id: &str) -> Result<Vec<SshCa>, SshError> {
        let mut cas: Vec<SshCa> = self
            .cas
            .find(|s| s.ca.project_id == project_id)
            .await?
            .into_iter()
            .map(|s| s.ca)
            .collect();
        cas.sort_by_key(|c| c.created_at);
        Ok(cas)
    }

    /// Renames a CA or changes its status.
    pub async fn update_ca(
        &self,
        project_id: &str,
        ca_id: &str,
        update: SshCaUpdate,
    ) -> Result<SshCa, SshError> {
        let mut stored = self.load_ca(project_id, ca_id).await?;
        if let Some(name) = update.friendly_name {
            stored.ca.friendly_name = validate_friendly_name(&name)?;
        }
        if let Some(status) = update.status {
            stored.ca.status = status;
        }
        stored.ca.updated_at = now();
        self.cas.put(ca_id, &stored).await?;

        info!(ca_id = %ca_id, status = ?stored.ca.status, "SSH CA updated");
        Ok(stored.ca)
    }

    /// Deletes a CA and its templates.
    pub async fn delete_ca(&self, project_id: &str, ca_id: &str) -> Result<SshCa, SshError> {
        let stored = self.load_ca(project_id, ca_id).await?;
        for template in self.templates.find(|t| t.ca_id == ca_id).await? {
            self.templates.remove(&template.id).await?;
        }
        self.cas.remove(ca_id).await?;

        info!(ca_id = %ca_id, "SSH CA deleted");
        Ok(stored.ca)
    }

    /// The CA public key, for `TrustedUserCAKeys` or `@cert-authority`.
    pub async fn public_key(&self, project_id: &str, ca_id: &str) -> Result<String, SshError> {
        Ok(self.get_ca(project_id, ca_id).await?.public_key)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
pub(crate) mod tests {
    use super::*;
    use coffer_storage::MemoryBackend;

    pub(crate) fn engine() -> SshEngine {
        SshEngine::new(Arc::new(MemoryBackend::new()), RootKey::generate())
    }

    pub(crate) fn new_ca(name: &str) -> NewSshCa {
        NewSshCa {
            friendly_name: name.into(),
            private_key: None,
        }
    }

    #[tokio::test]
    async fn test_ca_lifecycle() {
        let engine = engine();
        let ca = engine.create_ca("p1", new_ca("prod-users")).await.unwrap();
        assert_eq!(ca.key_algorithm, "ed25519");
        let parsed = wire::parse_public_key(&ca.public_key).unwrap();
        assert_eq!(
            engine.public_key("p1", &ca.id).await.unwrap(),
            wire::format_public_key(&parsed, None)
        );

        assert!(engine.get_ca("p2", &ca.id).await.is_err());

        let updated = engine
            .update_ca(
                "p1",
                &ca.id,
                SshCaUpdate {
                    status: Some(SshStatus::Disabled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SshStatus::Disabled);

        engine.delete_ca("p1", &ca.id).await.unwrap();
        assert!(engine.list_cas("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_supplied_key() {
        let engine = engine();
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let pem = wire::format_private_key(&key, "imported");

        let ca = engine
            .create_ca(
                "p1",
                NewSshCa {
                    friendly_name: "imported".into(),
                    private_key: Some(pem.to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            ca.public_key,
            wire::format_public_key(&key.verifying_key(), None)
        );

        let stored = engine.load_ca("p1", &ca.id).await.unwrap();
        assert_eq!(engine.signing_key(&stored).unwrap().to_bytes(), key.to_bytes());

        assert!(engine
            .create_ca(
                "p1",
                NewSshCa {
                    friendly_name: "bad".into(),
                    private_key: Some("not a key".into()),
                },
            )
            .await
            .is_err());
    }
}
