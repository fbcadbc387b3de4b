//! # Coffer Dynamic Secrets
//!
//! Credentials generated on demand by a provider, handed out as leases with
//! a bounded lifetime.
//!
//! ## Leases
//!
//! - A lease lives for the requested TTL (default: the configuration's
//!   default TTL) and never beyond `created_at + max TTL`.
//! - Renewal extends from the current expiry, within the same bound. A lease
//!   that has already expired cannot be renewed.
//! - When the provider fails to revoke credentials the lease is kept in
//!   `failed-deletion` state, unless the revocation is forced.
//! - Expired leases are revoked by [`DynamicEngine::revoke_expired`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod provider;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use coffer_crypto::{DataKey, RootKey, Sealed};
use coffer_projects::{now, path, ProjectsEngine};
use coffer_storage::{Collection, StorageBackend};

pub use error::DynamicError;
pub use models::{DynamicSecret, DynamicSecretUpdate, Lease, LeaseStatus, NewDynamicSecret};
pub use provider::{
    DynamicProvider, IssuedCredentials, LeaseRequest, SqlDatabaseProvider, TotpProvider,
};

use models::StoredDynamicSecret;

const KEY_PURPOSE: &str = "dynamic-secrets";

/// Default cap on live leases per dynamic secret.
pub const DEFAULT_MAX_LEASES: usize = 10;

const MAX_STATUS_DETAILS: usize = 255;

/// Longest TTL accepted, and the furthest ahead a lease may expire.
const MAX_TTL: u64 = 100 * 365 * 24 * 3600;

fn parse_ttl(ttl: &str) -> Result<u64, DynamicError> {
    let secs = humantime::parse_duration(ttl.trim())
        .map_err(|e| DynamicError::Invalid(format!("invalid TTL '{}': {}", ttl, e)))?
        .as_secs();
    if secs == 0 {
        return Err(DynamicError::Invalid("TTL must be positive".into()));
    }
    if secs > MAX_TTL {
        return Err(DynamicError::Invalid(format!("TTL '{}' is too large", ttl)));
    }
    Ok(secs)
}

fn expiry(now: u64, from: u64, ttl: u64) -> Result<u64, DynamicError> {
    from.checked_add(ttl)
        .filter(|at| at.saturating_sub(now) <= MAX_TTL)
        .ok_or_else(|| DynamicError::Invalid("lease would expire too far ahead".into()))
}

fn status_details(error: &DynamicError) -> String {
    error.to_string().chars().take(MAX_STATUS_DETAILS).collect()
}

fn check_ttls(default_ttl: u64, max_ttl: Option<u64>) -> Result<(), DynamicError> {
    match max_ttl {
        Some(max) if default_ttl > max => Err(DynamicError::Invalid(
            "default TTL cannot be larger than max TTL".into(),
        )),
        _ => Ok(()),
    }
}

fn merge_inputs(stored: Value, update: Value) -> Value {
    match (stored, update) {
        (Value::Object(mut base), Value::Object(patch)) => {
            base.extend(patch);
            Value::Object(base)
        },
        (_, update) => update,
    }
}

/// A newly issued lease with the credentials, shown once.
#[derive(Debug, Clone)]
pub struct IssuedLease {
    /// The lease.
    pub lease: Lease,
    /// The configuration it was issued from.
    pub dynamic_secret: DynamicSecret,
    /// Provider credentials.
    pub data: Value,
}

/// Stores dynamic secret configurations and manages their leases.
pub struct DynamicEngine {
    projects: Arc<ProjectsEngine>,
    root_key: RootKey,
    configs: Collection<StoredDynamicSecret>,
    leases: Collection<Lease>,
    providers: HashMap<String, Arc<dyn DynamicProvider>>,
    max_leases: usize,
    // serializes lease counting and lease updates
    lease_lock: Mutex<()>,
}

impl DynamicEngine {
    /// Creates the engine with the `sql-database` and `totp` providers.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        projects: Arc<ProjectsEngine>,
        root_key: RootKey,
        max_leases: usize,
    ) -> Self {
        Self {
            projects,
            root_key,
            configs: Collection::new(Arc::clone(&storage), "dynamic-secrets"),
            leases: Collection::new(storage, "dynamic-secret-leases"),
            providers: HashMap::new(),
            max_leases,
            lease_lock: Mutex::new(()),
        }
        .with_provider("sql-database", Arc::new(SqlDatabaseProvider::new()))
        .with_provider("totp", Arc::new(TotpProvider::new()))
    }

    /// Registers a provider under `name`, replacing any previous one.
    pub fn with_provider(mut self, name: &str, provider: Arc<dyn DynamicProvider>) -> Self {
        self.providers.insert(name.to_string(), provider);
        self
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn DynamicProvider>, DynamicError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| DynamicError::Invalid(format!("unknown provider '{}'", name)))
    }

    fn data_key(&self, project_id: &str) -> Result<DataKey, DynamicError> {
        Ok(self.root_key.data_key(project_id, KEY_PURPOSE)?)
    }

    fn open_inputs(&self, stored: &StoredDynamicSecret) -> Result<Value, DynamicError> {
        let key = self.data_key(&stored.config.project_id)?;
        Ok(stored.inputs.open_json(&key, &stored.config.id)?)
    }

    async fn find(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
    ) -> Result<Option<StoredDynamicSecret>, DynamicError> {
        let secret_path = path::normalize(secret_path)?;
        Ok(self
            .configs
            .find_one(|s| {
                s.config.project_id == project_id
                    && s.config.environment == environment
                    && s.config.secret_path == secret_path
                    && s.config.name == name
            })
            .await?)
    }

    async fn require(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
    ) -> Result<StoredDynamicSecret, DynamicError> {
        self.find(project_id, environment, secret_path, name)
            .await?
            .ok_or_else(|| {
                DynamicError::NotFound(format!(
                    "dynamic secret '{}' in folder '{}'",
                    name, secret_path
                ))
            })
    }

    // ---- Configurations ------------------------------------------------

    /// Creates a dynamic secret after validating inputs and connectivity.
    pub async fn create(
        &self,
        project_id: &str,
        new: NewDynamicSecret,
    ) -> Result<DynamicSecret, DynamicError> {
        let secret_path = path::normalize(&new.secret_path)?;
        self.projects
            .require_folder(project_id, &new.environment, &secret_path)
            .await?;

        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(DynamicError::Invalid("name cannot be empty".into()));
        }
        if self
            .find(project_id, &new.environment, &secret_path, &name)
            .await?
            .is_some()
        {
            return Err(DynamicError::AlreadyExists(format!("dynamic secret '{}'", name)));
        }

        let default_ttl = parse_ttl(&new.default_ttl)?;
        let max_ttl = new.max_ttl.as_deref().map(parse_ttl).transpose()?;
        check_ttls(default_ttl, max_ttl)?;
        if let Some(template) = &new.username_template {
            template::validate_template(template)?;
        }

        let provider = self.provider(&new.provider_type)?;
        let inputs = provider.validate_inputs(new.inputs)?;
        provider.validate_connection(&inputs).await?;

        let now = now();
        let config = DynamicSecret {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            environment: new.environment,
            secret_path,
            name,
            provider_type: new.provider_type,
            default_ttl,
            max_ttl,
            username_template: new.username_template,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        let sealed = Sealed::seal_json(&self.data_key(project_id)?, &inputs, &config.id)?;
        self.configs
            .insert(
                &config.id,
                &StoredDynamicSecret {
                    config: config.clone(),
                    inputs: sealed,
                },
            )
            .await?;

        info!(
            project_id = %project_id,
            dynamic_secret_id = %config.id,
            provider = %config.provider_type,
            "Dynamic secret created"
        );
        Ok(config)
    }

    /// Loads a dynamic secret by folder and name.
    pub async fn get_by_name(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
    ) -> Result<DynamicSecret, DynamicError> {
        Ok(self
            .require(project_id, environment, secret_path, name)
            .await?
            .config)
    }

    /// Lists the dynamic secrets of a folder.
    pub async fn list(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
    ) -> Result<Vec<DynamicSecret>, DynamicError> {
        let secret_path = path::normalize(secret_path)?;
        let mut configs: Vec<DynamicSecret> = self
            .configs
            .find(|s| {
                s.config.project_id == project_id
                    && s.config.environment == environment
                    && s.config.secret_path == secret_path
            })
            .await?
            .into_iter()
            .map(|s| s.config)
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Applies a partial update. New inputs are merged over the stored ones
    /// and revalidated.
    pub async fn update_by_name(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
        update: DynamicSecretUpdate,
    ) -> Result<DynamicSecret, DynamicError> {
        let mut stored = self
            .require(project_id, environment, secret_path, name)
            .await?;

        if let Some(new_name) = update.new_name {
            let new_name = new_name.trim().to_string();
            if new_name.is_empty() {
                return Err(DynamicError::Invalid("name cannot be empty".into()));
            }
            if new_name != stored.config.name
                && self
                    .find(project_id, environment, secret_path, &new_name)
                    .await?
                    .is_some()
            {
                return Err(DynamicError::AlreadyExists(format!(
                    "dynamic secret '{}'",
                    new_name
                )));
            }
            stored.config.name = new_name;
        }
        if let Some(ttl) = update.default_ttl {
            stored.config.default_ttl = parse_ttl(&ttl)?;
        }
        if let Some(ttl) = update.max_ttl {
            stored.config.max_ttl = Some(parse_ttl(&ttl)?);
        }
        check_ttls(stored.config.default_ttl, stored.config.max_ttl)?;
        if let Some(template) = update.username_template {
            template::validate_template(&template)?;
            stored.config.username_template = Some(template);
        }
        if let Some(metadata) = update.metadata {
            stored.config.metadata = metadata;
        }
        if let Some(patch) = update.inputs {
            let provider = self.provider(&stored.config.provider_type)?;
            let inputs = provider.validate_inputs(merge_inputs(self.open_inputs(&stored)?, patch))?;
            provider.validate_connection(&inputs).await?;
            stored.inputs =
                Sealed::seal_json(&self.data_key(project_id)?, &inputs, &stored.config.id)?;
        }

        stored.config.updated_at = now();
        self.configs.put(&stored.config.id, &stored).await?;

        info!(dynamic_secret_id = %stored.config.id, "Dynamic secret updated");
        Ok(stored.config)
    }

    /// Deletes a dynamic secret after revoking its leases.
    ///
    /// Without `is_forced`, a provider failure aborts the deletion and leaves
    /// the failing lease in `failed-deletion` state.
    pub async fn delete_by_name(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
        is_forced: bool,
    ) -> Result<DynamicSecret, DynamicError> {
        let stored = self
            .require(project_id, environment, secret_path, name)
            .await?;

        for lease in self.leases_of(&stored.config.id).await? {
            let revoked = self.revoke(&stored, lease, is_forced).await?;
            if revoked.status == LeaseStatus::FailedDeletion {
                return Err(DynamicError::Provider(format!(
                    "failed to revoke lease '{}': {}",
                    revoked.id,
                    revoked.status_details.unwrap_or_default()
                )));
            }
        }

        self.configs.remove(&stored.config.id).await?;
        info!(dynamic_secret_id = %stored.config.id, forced = is_forced, "Dynamic secret deleted");
        Ok(stored.config)
    }

    // ---- Leases --------------------------------------------------------

    async fn leases_of(&self, dynamic_secret_id: &str) -> Result<Vec<Lease>, DynamicError> {
        Ok(self
            .leases
            .find(|l| l.dynamic_secret_id == dynamic_secret_id)
            .await?)
    }

    /// Issues a lease. `ttl` defaults to the configuration's default TTL.
    pub async fn create_lease(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
        ttl: Option<&str>,
        identity_name: Option<&str>,
    ) -> Result<IssuedLease, DynamicError> {
        let stored = self
            .require(project_id, environment, secret_path, name)
            .await?;

        let _guard = self.lease_lock.lock().await;

        let taken = self.leases_of(&stored.config.id).await?.len();
        if taken >= self.max_leases {
            return Err(DynamicError::Invalid(format!(
                "max lease limit reached: {}",
                self.max_leases
            )));
        }

        let ttl = match ttl {
            Some(ttl) => parse_ttl(ttl)?,
            None => stored.config.default_ttl,
        };
        if stored.config.max_ttl.is_some_and(|max| ttl > max) {
            return Err(DynamicError::Invalid("TTL cannot be larger than max TTL".into()));
        }

        let now = now();
        let request = LeaseRequest {
            username: template::render_username(
                stored.config.username_template.as_deref(),
                identity_name,
                now,
            )?,
            expire_at: expiry(now, now, ttl)?,
        };
        let provider = self.provider(&stored.config.provider_type)?;
        let issued = provider
            .create(&self.open_inputs(&stored)?, &request)
            .await?;

        let lease = Lease {
            id: Uuid::new_v4().to_string(),
            dynamic_secret_id: stored.config.id.clone(),
            project_id: project_id.to_string(),
            external_entity_id: issued.entity_id,
            expire_at: request.expire_at,
            version: 1,
            status: LeaseStatus::Active,
            status_details: None,
            created_at: now,
        };
        self.leases.insert(&lease.id, &lease).await?;

        info!(
            dynamic_secret_id = %stored.config.id,
            lease_id = %lease.id,
            expire_at = lease.expire_at,
            "Lease created"
        );
        Ok(IssuedLease {
            lease,
            dynamic_secret: stored.config,
            data: issued.data,
        })
    }

    /// Loads a lease of `project_id` with its configuration.
    pub async fn get_lease(
        &self,
        project_id: &str,
        lease_id: &str,
    ) -> Result<(Lease, DynamicSecret), DynamicError> {
        let (lease, stored) = self.lease_with_config(project_id, lease_id).await?;
        Ok((lease, stored.config))
    }

    async fn lease_with_config(
        &self,
        project_id: &str,
        lease_id: &str,
    ) -> Result<(Lease, StoredDynamicSecret), DynamicError> {
        let lease = self
            .leases
            .get(lease_id)
            .await?
            .filter(|l| l.project_id == project_id)
            .ok_or_else(|| DynamicError::NotFound(format!("lease '{}'", lease_id)))?;
        let stored = self
            .configs
            .get(&lease.dynamic_secret_id)
            .await?
            .ok_or_else(|| {
                DynamicError::NotFound(format!("dynamic secret '{}'", lease.dynamic_secret_id))
            })?;
        Ok((lease, stored))
    }

    /// Lists the leases of a dynamic secret.
    pub async fn list_leases(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        name: &str,
    ) -> Result<Vec<Lease>, DynamicError> {
        let stored = self
            .require(project_id, environment, secret_path, name)
            .await?;
        let mut leases = self.leases_of(&stored.config.id).await?;
        leases.sort_by_key(|l| l.created_at);
        Ok(leases)
    }

    /// Extends a lease from its current expiry by `ttl` (default TTL when
    /// absent), up to `created_at + max TTL`.
    pub async fn renew_lease(
        &self,
        project_id: &str,
        lease_id: &str,
        ttl: Option<&str>,
    ) -> Result<Lease, DynamicError> {
        let _guard = self.lease_lock.lock().await;

        let (mut lease, stored) = self.lease_with_config(project_id, lease_id).await?;
        if lease.status != LeaseStatus::Active {
            return Err(DynamicError::Invalid("only active leases can be renewed".into()));
        }

        let ttl = match ttl {
            Some(ttl) => parse_ttl(ttl)?,
            None => stored.config.default_ttl,
        };
        let now = now();
        if lease.expire_at <= now {
            return Err(DynamicError::Invalid("lease has expired".into()));
        }
        let expire_at = expiry(now, lease.expire_at, ttl)?;
        if let Some(max) = stored.config.max_ttl {
            if expire_at > lease.created_at.saturating_add(max) {
                return Err(DynamicError::Invalid("TTL cannot be larger than max TTL".into()));
            }
        }

        let provider = self.provider(&stored.config.provider_type)?;
        lease.external_entity_id = provider
            .renew(&self.open_inputs(&stored)?, &lease.external_entity_id, expire_at)
            .await?;
        lease.expire_at = expire_at;
        lease.version += 1;
        self.leases.put(&lease.id, &lease).await?;

        debug!(lease_id = %lease.id, expire_at, version = lease.version, "Lease renewed");
        Ok(lease)
    }

    /// Revokes a lease.
    ///
    /// On provider failure the lease is kept with status `failed-deletion`
    /// and returned, unless `is_forced`, in which case it is deleted anyway.
    pub async fn revoke_lease(
        &self,
        project_id: &str,
        lease_id: &str,
        is_forced: bool,
    ) -> Result<Lease, DynamicError> {
        let _guard = self.lease_lock.lock().await;
        let (lease, stored) = self.lease_with_config(project_id, lease_id).await?;
        self.revoke(&stored, lease, is_forced).await
    }

    async fn revoke(
        &self,
        stored: &StoredDynamicSecret,
        lease: Lease,
        is_forced: bool,
    ) -> Result<Lease, DynamicError> {
        let outcome = self.revoke_credentials(stored, &lease).await;
        self.settle(lease, outcome, is_forced).await
    }

    async fn revoke_credentials(
        &self,
        stored: &StoredDynamicSecret,
        lease: &Lease,
    ) -> Result<(), DynamicError> {
        let provider = self.provider(&stored.config.provider_type)?;
        let inputs = self.open_inputs(stored)?;
        provider.revoke(&inputs, &lease.external_entity_id).await?;
        Ok(())
    }

    async fn settle(
        &self,
        mut lease: Lease,
        outcome: Result<(), DynamicError>,
        is_forced: bool,
    ) -> Result<Lease, DynamicError> {
        if let Err(e) = outcome {
            if !is_forced {
                let details = status_details(&e);
                warn!(lease_id = %lease.id, error = %details, "Failed to revoke lease");
                lease.status = LeaseStatus::FailedDeletion;
                lease.status_details = Some(details);
                self.leases.put(&lease.id, &lease).await?;
                return Ok(lease);
            }
            warn!(lease_id = %lease.id, error = %e, "Ignoring revocation failure on forced delete");
        }

        self.leases.remove(&lease.id).await?;
        info!(lease_id = %lease.id, forced = is_forced, "Lease revoked");
        Ok(lease)
    }

    /// Revokes every active lease expired at `now`. Returns how many were
    /// removed.
    ///
    /// Provider calls run without the lease lock; each outcome is recorded
    /// only if the lease is still the one that was revoked.
    pub async fn revoke_expired(&self, now: u64) -> Result<usize, DynamicError> {
        let expired = self
            .leases
            .find(|l| l.status == LeaseStatus::Active && l.expire_at <= now)
            .await?;

        let mut revoked = 0;
        for lease in expired {
            let stored = self.configs.get(&lease.dynamic_secret_id).await?;
            let outcome = match &stored {
                Some(stored) => Some(self.revoke_credentials(stored, &lease).await),
                None => None,
            };

            let _guard = self.lease_lock.lock().await;
            let current = self.leases.get(&lease.id).await?;
            if current.as_ref() != Some(&lease) {
                // revoked or changed while the provider was called
                continue;
            }
            let Some(outcome) = outcome else {
                self.leases.remove(&lease.id).await?;
                continue;
            };
            let lease = self.settle(lease, outcome, false).await?;
            if lease.status == LeaseStatus::Active {
                revoked += 1;
            }
        }

        if revoked > 0 {
            info!(revoked, "Expired leases revoked");
        }
        Ok(revoked)
    }
}
