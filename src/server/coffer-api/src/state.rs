//! Shared application state.

use std::sync::Arc;

use tracing::info;

use coffer_approvals::ApprovalsEngine;
use coffer_audit::AuditLog;
use coffer_auth::{AuthBackend, Authenticator, JwtBackend, JwtConfig, ScimTokenBackend, UniversalAuth};
use coffer_crypto::RootKey;
use coffer_dynamic::{DynamicEngine, DEFAULT_MAX_LEASES};
use coffer_kmip::KmipEngine;
use coffer_projects::ProjectsEngine;
use coffer_secrets::SecretsEngine;
use coffer_ssh::SshEngine;
use coffer_storage::StorageBackend;
use coffer_storage_sqlite::SqliteBackend;

use crate::rate_limit::{RateLimitSettings, RateLimiters};
use crate::ApiError;

/// Settings the API is built from.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// JWT signing configuration.
    pub jwt: JwtConfig,
    /// Rate-limit budgets.
    pub rate_limits: RateLimitSettings,
    /// Maximum live leases per dynamic secret.
    pub max_leases: usize,
}

impl ApiSettings {
    /// Settings with default limits around `jwt`.
    pub fn new(jwt: JwtConfig) -> Self {
        Self {
            jwt,
            rate_limits: RateLimitSettings::default(),
            max_leases: DEFAULT_MAX_LEASES,
        }
    }
}

/// Engines and services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Organizations, users, projects and permissions.
    pub projects: Arc<ProjectsEngine>,
    /// Versioned secrets.
    pub secrets: Arc<SecretsEngine>,
    /// Approval policies and requests.
    pub approvals: Arc<ApprovalsEngine>,
    /// Dynamic secrets and leases.
    pub dynamic: Arc<DynamicEngine>,
    /// KMIP clients and managed objects.
    pub kmip: Arc<KmipEngine>,
    /// SSH CAs and templates.
    pub ssh: Arc<SshEngine>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Bearer token dispatch.
    pub authenticator: Arc<Authenticator>,
    /// JWT issuing.
    pub jwt: Arc<JwtBackend>,
    /// Identities and client secrets.
    pub universal_auth: Arc<UniversalAuth>,
    /// SCIM tokens.
    pub scim_tokens: Arc<ScimTokenBackend>,
    /// Per-class rate limiters.
    pub rate_limits: Arc<RateLimiters>,
}

impl AppState {
    /// Builds every engine.
    ///
    /// Document engines share `storage`; the secrets engine keeps its tables
    /// in `sql`.
    pub async fn build(
        storage: Arc<dyn StorageBackend>,
        sql: SqliteBackend,
        root_key: RootKey,
        settings: ApiSettings,
    ) -> Result<Self, ApiError> {
        let projects = Arc::new(ProjectsEngine::new(Arc::clone(&storage)));
        let secrets = Arc::new(SecretsEngine::new(sql, root_key.clone()).await?);
        let approvals = Arc::new(ApprovalsEngine::new(
            Arc::clone(&storage),
            Arc::clone(&projects),
            Arc::clone(&secrets),
            root_key.clone(),
        ));
        let dynamic = Arc::new(DynamicEngine::new(
            Arc::clone(&storage),
            Arc::clone(&projects),
            root_key.clone(),
            settings.max_leases,
        ));
        let kmip = Arc::new(KmipEngine::new(Arc::clone(&storage), root_key.clone()));
        let ssh = Arc::new(SshEngine::new(Arc::clone(&storage), root_key));
        let audit = Arc::new(AuditLog::new(Arc::clone(&storage)));

        let jwt = Arc::new(JwtBackend::new(settings.jwt)?);
        let scim_tokens = Arc::new(ScimTokenBackend::new(Arc::clone(&storage)));
        let universal_auth = Arc::new(UniversalAuth::new(storage, Arc::clone(&jwt)));
        let authenticator = Arc::new(
            Authenticator::new()
                .with_backend(Arc::clone(&scim_tokens) as Arc<dyn AuthBackend>)
                .with_backend(Arc::clone(&jwt) as Arc<dyn AuthBackend>),
        );

        info!("API state initialized");
        Ok(Self {
            projects,
            secrets,
            approvals,
            dynamic,
            kmip,
            ssh,
            audit,
            authenticator,
            jwt,
            universal_auth,
            scim_tokens,
            rate_limits: Arc::new(RateLimiters::new(settings.rate_limits)),
        })
    }
}
