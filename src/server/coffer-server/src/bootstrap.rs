//! Development-mode bootstrap.

use std::time::Duration;

use tracing::warn;

use coffer_api::AppState;
use coffer_projects::{NewUser, OrgRole};

pub const DEV_ORG_NAME: &str = "Coffer Dev";
pub const DEV_ADMIN_EMAIL: &str = "admin@coffer.local";

/// What [`dev`] created.
#[derive(Debug)]
pub struct DevBootstrap {
    pub org_id: String,
    pub admin_id: String,
    pub admin_token: String,
}

/// Creates an organization and an admin user and mints an admin JWT.
///
/// Only used with in-memory storage, so it always starts from an empty
/// store.
pub async fn dev(state: &AppState, token_ttl: Duration) -> anyhow::Result<DevBootstrap> {
    let org = state.projects.create_org(DEV_ORG_NAME).await?;
    let admin = state
        .projects
        .create_user(
            &org.id,
            NewUser {
                email: DEV_ADMIN_EMAIL.into(),
                username: None,
                first_name: Some("Dev".into()),
                last_name: Some("Admin".into()),
                org_role: OrgRole::Admin,
            },
        )
        .await?;
    let admin_token =
        state
            .jwt
            .issue_user_token(&admin.id, &admin.email, &org.id, token_ttl.as_secs())?;

    warn!(
        org_id = %org.id,
        admin = %admin.email,
        "Development bootstrap complete - admin token: {}",
        admin_token
    );
    Ok(DevBootstrap {
        org_id: org.id,
        admin_id: admin.id,
        admin_token,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::sync::Arc;

    use coffer_api::ApiSettings;
    use coffer_auth::{AuthBackend, JwtConfig};
    use coffer_crypto::RootKey;
    use coffer_storage::MemoryBackend;
    use coffer_storage_sqlite::SqliteBackend;

    use super::*;

    #[tokio::test]
    async fn test_dev_bootstrap_token_is_valid() {
        let state = AppState::build(
            Arc::new(MemoryBackend::new()),
            SqliteBackend::in_memory().await.unwrap(),
            RootKey::generate(),
            ApiSettings::new(JwtConfig {
                secret: "dev-secret-with-at-least-thirty-two-bytes".into(),
                issuer: "coffer".into(),
                audience: "coffer-api".into(),
            }),
        )
        .await
        .unwrap();

        let boot = dev(&state, Duration::from_secs(3600)).await.unwrap();
        let ctx = state.jwt.validate(&boot.admin_token).await.unwrap();
        assert_eq!(ctx.org_id, boot.org_id);
        assert_eq!(ctx.actor_id(), boot.admin_id);

        let admin = state.projects.get_user(&boot.admin_id).await.unwrap();
        assert_eq!(admin.org_role, OrgRole::Admin);
    }
}
