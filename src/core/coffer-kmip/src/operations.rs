//! KMIP operations on managed objects.
//!
//! Every operation takes the calling client, checks its permission and works
//! inside the client's project.

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use coffer_crypto::{random, Sealed};
use coffer_projects::now;

use crate::models::StoredObject;
use crate::{
    check, KeyMaterial, KmipClient, KmipEngine, KmipError, KmipPermission, ManagedObject,
    ObjectState, SymmetricAlgorithm,
};

fn wrong_state(operation: KmipPermission, state: ObjectState) -> KmipError {
    KmipError::WrongState {
        operation: operation.to_string(),
        state: state.to_string(),
    }
}

impl KmipEngine {
    async fn load_object(
        &self,
        client: &KmipClient,
        object_id: &str,
    ) -> Result<StoredObject, KmipError> {
        self.objects
            .get(&Self::doc_id(&client.project_id, object_id))
            .await?
            .ok_or_else(|| KmipError::NotFound(format!("managed object '{}'", object_id)))
    }

    async fn store_new(
        &self,
        client: &KmipClient,
        name: Option<String>,
        algorithm: SymmetricAlgorithm,
        material: &[u8],
    ) -> Result<ManagedObject, KmipError> {
        let object = ManagedObject {
            id: Uuid::new_v4().to_string(),
            project_id: client.project_id.clone(),
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            algorithm,
            length: algorithm.key_bits(),
            state: ObjectState::PreActive,
            created_by: client.id.clone(),
            created_at: now(),
            activated_at: None,
            deactivated_at: None,
            revocation_reason: None,
            destroyed_at: None,
        };
        let sealed = Sealed::seal(&self.data_key(&client.project_id)?, material, &object.id)?;
        self.objects
            .insert(
                &Self::doc_id(&client.project_id, &object.id),
                &StoredObject {
                    object: object.clone(),
                    material: Some(sealed),
                },
            )
            .await?;
        Ok(object)
    }

    /// Generates a new symmetric key in the pre-active state.
    pub async fn create(
        &self,
        client: &KmipClient,
        name: Option<String>,
        algorithm: SymmetricAlgorithm,
    ) -> Result<ManagedObject, KmipError> {
        check(client, KmipPermission::Create)?;
        let material = Zeroizing::new(random::generate_bytes(algorithm.key_bits() as usize / 8));
        let object = self.store_new(client, name, algorithm, &material).await?;

        info!(client_id = %client.id, object_id = %object.id, "KMIP object created");
        Ok(object)
    }

    /// Imports base64 key material. Its length must match the algorithm.
    pub async fn register(
        &self,
        client: &KmipClient,
        name: Option<String>,
        algorithm: SymmetricAlgorithm,
        material: &str,
    ) -> Result<ManagedObject, KmipError> {
        check(client, KmipPermission::Register)?;
        let bytes = Zeroizing::new(
            STANDARD
                .decode(material.trim())
                .map_err(|e| KmipError::Invalid(format!("key material is not base64: {}", e)))?,
        );
        if bytes.len() * 8 != algorithm.key_bits() as usize {
            return Err(KmipError::Invalid(format!(
                "key material is {} bits, expected {}",
                bytes.len() * 8,
                algorithm.key_bits()
            )));
        }
        let object = self.store_new(client, name, algorithm, &bytes).await?;

        info!(client_id = %client.id, object_id = %object.id, "KMIP object registered");
        Ok(object)
    }

    /// Returns the key material. Destroyed objects have none.
    pub async fn get(
        &self,
        client: &KmipClient,
        object_id: &str,
    ) -> Result<KeyMaterial, KmipError> {
        check(client, KmipPermission::Get)?;
        let stored = self.load_object(client, object_id).await?;
        let sealed = stored
            .material
            .as_ref()
            .ok_or_else(|| wrong_state(KmipPermission::Get, stored.object.state))?;
        let bytes = sealed.open(&self.data_key(&client.project_id)?, &stored.object.id)?;

        Ok(KeyMaterial {
            value: STANDARD.encode(bytes.as_slice()),
            object: stored.object,
        })
    }

    /// Returns the object's attributes.
    pub async fn get_attributes(
        &self,
        client: &KmipClient,
        object_id: &str,
    ) -> Result<ManagedObject, KmipError> {
        check(client, KmipPermission::GetAttributes)?;
        Ok(self.load_object(client, object_id).await?.object)
    }

    /// Moves a pre-active object to active.
    pub async fn activate(
        &self,
        client: &KmipClient,
        object_id: &str,
    ) -> Result<ManagedObject, KmipError> {
        check(client, KmipPermission::Activate)?;
        let mut stored = self.load_object(client, object_id).await?;
        if stored.object.state != ObjectState::PreActive {
            return Err(wrong_state(KmipPermission::Activate, stored.object.state));
        }

        stored.object.state = ObjectState::Active;
        stored.object.activated_at = Some(now());
        self.objects
            .put(&Self::doc_id(&client.project_id, object_id), &stored)
            .await?;

        info!(client_id = %client.id, object_id = %object_id, "KMIP object activated");
        Ok(stored.object)
    }

    /// Deactivates a pre-active or active object.
    pub async fn revoke(
        &self,
        client: &KmipClient,
        object_id: &str,
        reason: Option<String>,
    ) -> Result<ManagedObject, KmipError> {
        check(client, KmipPermission::Revoke)?;
        let mut stored = self.load_object(client, object_id).await?;
        if !matches!(
            stored.object.state,
            ObjectState::PreActive | ObjectState::Active
        ) {
            return Err(wrong_state(KmipPermission::Revoke, stored.object.state));
        }

        stored.object.state = ObjectState::Deactivated;
        stored.object.deactivated_at = Some(now());
        stored.object.revocation_reason = reason;
        self.objects
            .put(&Self::doc_id(&client.project_id, object_id), &stored)
            .await?;

        info!(client_id = %client.id, object_id = %object_id, "KMIP object revoked");
        Ok(stored.object)
    }

    /// Erases the key material. Active objects must be revoked first.
    pub async fn destroy(
        &self,
        client: &KmipClient,
        object_id: &str,
    ) -> Result<ManagedObject, KmipError> {
        check(client, KmipPermission::Destroy)?;
        let mut stored = self.load_object(client, object_id).await?;
        if matches!(
            stored.object.state,
            ObjectState::Active | ObjectState::Destroyed
        ) {
            return Err(wrong_state(KmipPermission::Destroy, stored.object.state));
        }

        stored.object.state = ObjectState::Destroyed;
        stored.object.destroyed_at = Some(now());
        stored.material = None;
        self.objects
            .put(&Self::doc_id(&client.project_id, object_id), &stored)
            .await?;

        warn!(client_id = %client.id, object_id = %object_id, "KMIP object destroyed");
        Ok(stored.object)
    }

    /// Lists the project's objects, optionally filtered by name and state,
    /// oldest first.
    pub async fn locate(
        &self,
        client: &KmipClient,
        name: Option<&str>,
        state: Option<ObjectState>,
    ) -> Result<Vec<ManagedObject>, KmipError> {
        check(client, KmipPermission::Locate)?;
        let mut objects: Vec<ManagedObject> = self
            .objects
            .under(&format!("{}/", client.project_id))
            .await?
            .into_iter()
            .map(|s| s.object)
            .filter(|o| name.is_none() || o.name.as_deref() == name)
            .filter(|o| state.is_none() || Some(o.state) == state)
            .collect();
        objects.sort_by_key(|o| o.created_at);
        Ok(objects)
    }
}
