//! Integration tests for the Coffer server.
//!
//! Each test serves the full router over a real TCP socket, backed by an
//! on-disk SQLite database, and talks to it with an HTTP client.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tokio::task::JoinHandle;

use coffer_api::{ApiSettings, AppState, RateLimitSettings};
use coffer_auth::JwtConfig;
use coffer_crypto::RootKey;
use coffer_projects::{ActorKind, NewProject, NewUser, OrgRole, ProjectRole};
use coffer_storage_sqlite::SqliteBackend;

pub const JWT_SECRET: &str = "integration-secret-with-at-least-32-bytes";

// ============================================================================
// Test Server
// ============================================================================

/// A server bound to an ephemeral local port.
pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Starts a server over the SQLite database in `data_dir`.
    ///
    /// `root_key` is base64 so a restarted server can reopen the same data.
    pub async fn start(
        data_dir: &Path,
        root_key: &str,
        rate_limits: RateLimitSettings,
    ) -> Result<Self> {
        let sql = SqliteBackend::open(data_dir, "coffer")
            .await
            .context("Failed to open storage")?;
        let mut settings = ApiSettings::new(JwtConfig {
            secret: JWT_SECRET.into(),
            issuer: "coffer".into(),
            audience: "coffer-api".into(),
        });
        settings.rate_limits = rate_limits;

        let state = AppState::build(
            Arc::new(sql.clone()),
            sql,
            RootKey::from_base64(root_key)?,
            settings,
        )
        .await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = coffer_api::router(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        Ok(Self {
            base_url: format!("http://{}", addr),
            state,
            task,
        })
    }

    /// Get a client for this server.
    pub fn client(&self) -> CofferClient {
        CofferClient::new(&self.base_url)
    }

    /// Mints a user JWT the way a login would.
    pub async fn user_token(&self, user_id: &str) -> Result<String> {
        let user = self.state.projects.get_user(user_id).await?;
        Ok(self
            .state
            .jwt
            .issue_user_token(&user.id, &user.email, &user.org_id, 3600)?)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Organization, admin and project created by [`seed`].
pub struct Seed {
    pub org_id: String,
    pub admin_id: String,
    pub admin_token: String,
    pub project_id: String,
}

/// Creates an organization with one admin and one project.
pub async fn seed(server: &TestServer) -> Result<Seed> {
    let projects = &server.state.projects;
    let org = projects.create_org("Acme").await?;
    let admin = projects
        .create_user(&org.id, new_user("admin@acme.test", OrgRole::Admin))
        .await?;
    let project = projects
        .create_project(
            &org.id,
            &admin.id,
            ActorKind::User,
            NewProject {
                name: "Backend".into(),
                ..Default::default()
            },
        )
        .await?;
    let admin_token = server.user_token(&admin.id).await?;

    Ok(Seed {
        org_id: org.id,
        admin_id: admin.id,
        admin_token,
        project_id: project.id,
    })
}

/// Adds an org member holding `role` in the project; returns its id and token.
pub async fn add_member(
    server: &TestServer,
    seed: &Seed,
    email: &str,
    role: ProjectRole,
) -> Result<(String, String)> {
    let projects = &server.state.projects;
    let user = projects
        .create_user(&seed.org_id, new_user(email, OrgRole::Member))
        .await?;
    projects
        .add_membership(&seed.project_id, &user.id, ActorKind::User, role)
        .await?;
    let token = server.user_token(&user.id).await?;
    Ok((user.id, token))
}

fn new_user(email: &str, org_role: OrgRole) -> NewUser {
    NewUser {
        email: email.into(),
        username: None,
        first_name: None,
        last_name: None,
        org_role,
    }
}

// ============================================================================
// Test Client
// ============================================================================

/// HTTP client for testing the Coffer API.
pub struct CofferClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl CofferClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends a request and returns the status and JSON body (`Null` when empty).
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let resp = self.request(method, path, body, &[]).await?;
        let status = resp.status();
        let text = resp.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).with_context(|| format!("non-JSON body: {}", text))?
        };
        Ok((status, body))
    }

    /// Sends a request with extra headers and returns the raw response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let mut req = self.client.request(method, self.url(path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        Ok(req.send().await?)
    }

    pub async fn get(&self, path: &str) -> Result<(StatusCode, Value)> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<(StatusCode, Value)> {
        self.send(Method::POST, path, Some(body)).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        server: TestServer,
        seed: Seed,
        _data_dir: TempDir,
    }

    async fn fixture(rate_limits: RateLimitSettings) -> Fixture {
        let data_dir = TempDir::new().unwrap();
        let root_key = RootKey::generate().to_base64();
        let server = TestServer::start(data_dir.path(), &root_key, rate_limits)
            .await
            .unwrap();
        let seed = seed(&server).await.unwrap();
        Fixture {
            server,
            seed,
            _data_dir: data_dir,
        }
    }

    fn generous_limits() -> RateLimitSettings {
        let mut limits = RateLimitSettings::default();
        limits.secrets.max_requests = 1000;
        limits
    }

    #[tokio::test]
    async fn test_status_and_authentication_required() {
        let f = fixture(generous_limits()).await;
        let client = f.server.client();

        let (status, body) = client.get("/api/status").await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Ok");

        let (status, _) = client.get("/api/v1/projects").await.unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = client
            .with_token("not-a-token")
            .get("/api/v1/projects")
            .await
            .unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_identity_reads_secrets_end_to_end() {
        let f = fixture(generous_limits()).await;
        let admin = f.server.client().with_token(&f.seed.admin_token);
        let pid = &f.seed.project_id;

        let (status, body) = admin
            .post("/api/v1/identities", json!({ "name": "deployer" }))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let identity_id = body["identity"]["id"].as_str().unwrap().to_string();

        let (status, body) = admin
            .post(
                &format!("/api/v1/identities/{}/universal-auth/client-secrets", identity_id),
                json!({ "description": "pipeline" }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let client_secret = body["clientSecret"].as_str().unwrap().to_string();

        let (status, _) = admin
            .post(
                &format!("/api/v1/projects/{}/memberships", pid),
                json!({ "actorId": identity_id, "actorKind": "identity", "role": "viewer" }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let (status, _) = admin
            .post(
                "/api/v4/secrets/DATABASE_URL",
                json!({
                    "projectId": pid,
                    "environment": "prod",
                    "secretValue": "postgres://db.internal/app",
                }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let (status, body) = f
            .server
            .client()
            .post(
                "/api/v1/auth/universal-auth/login",
                json!({ "clientId": identity_id, "clientSecret": client_secret }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tokenType"], "Bearer");
        let machine = f
            .server
            .client()
            .with_token(body["accessToken"].as_str().unwrap());

        let (status, body) = machine
            .get(&format!(
                "/api/v4/secrets/DATABASE_URL?projectId={}&environment=prod",
                pid
            ))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["secret"]["value"], "postgres://db.internal/app");

        // viewers cannot write
        let (status, _) = machine
            .post(
                "/api/v4/secrets/OTHER",
                json!({ "projectId": pid, "environment": "prod", "secretValue": "x" }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = admin
            .get(&format!(
                "/api/v1/projects/{}/audit-logs?eventType=get-secret",
                pid
            ))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalCount"], 1);
        assert_eq!(body["auditLogs"][0]["actor"]["type"], "identity");
        assert_eq!(body["auditLogs"][0]["actor"]["id"], identity_id.as_str());
    }

    #[tokio::test]
    async fn test_change_approval_flow_end_to_end() {
        let f = fixture(generous_limits()).await;
        let admin = f.server.client().with_token(&f.seed.admin_token);
        let pid = &f.seed.project_id;
        let (_, dev_token) =
            add_member(&f.server, &f.seed, "dev@acme.test", ProjectRole::Member)
                .await
                .unwrap();
        let dev = f.server.client().with_token(&dev_token);

        let (status, _) = admin
            .post(
                "/api/v1/secret-approvals",
                json!({
                    "projectId": pid,
                    "name": "prod-gate",
                    "environment": "prod",
                    "secretPath": "/**",
                    "approvals": 1,
                    "approvers": [f.seed.admin_id],
                }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let (status, body) = dev
            .post(
                "/api/v4/secrets/API_KEY",
                json!({ "projectId": pid, "environment": "prod", "secretValue": "k-1" }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let request_id = body["approval"]["id"].as_str().unwrap().to_string();

        // nothing is written until the change merges
        let secret_uri = format!("/api/v4/secrets/API_KEY?projectId={}&environment=prod", pid);
        let (status, _) = admin.get(&secret_uri).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let base = format!("/api/v1/secret-approval-requests/{}", request_id);
        let (status, _) = dev
            .post(&format!("{}/review", base), json!({ "status": "approved" }))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = admin
            .post(&format!("{}/review", base), json!({ "status": "approved" }))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let (status, body) = dev
            .send(Method::POST, &format!("{}/merge", base), None)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approval"]["hasMerged"], true);

        let (status, body) = admin.get(&secret_uri).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["secret"]["value"], "k-1");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reaped() {
        let f = fixture(generous_limits()).await;
        let admin = f.server.client().with_token(&f.seed.admin_token);
        let pid = &f.seed.project_id;

        let (status, body) = admin
            .post(
                "/api/v1/dynamic-secrets",
                json!({
                    "projectId": pid,
                    "environmentSlug": "dev",
                    "name": "otp",
                    "provider": {
                        "type": "totp",
                        "inputs": { "configType": "manual", "secret": "JBSWY3DPEHPK3PXP" },
                    },
                    "defaultTTL": "1h",
                    "maxTTL": "2h",
                }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (status, body) = admin
            .post(
                "/api/v1/dynamic-secrets/leases",
                json!({ "projectId": pid, "environmentSlug": "dev", "dynamicSecretName": "otp" }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let lease_uri = format!(
            "/api/v1/dynamic-secrets/leases/{}?projectId={}",
            body["lease"]["id"].as_str().unwrap(),
            pid
        );
        let expire_at = body["lease"]["expireAt"].as_u64().unwrap();

        let (status, _) = admin.get(&lease_uri).await.unwrap();
        assert_eq!(status, StatusCode::OK);

        // a sweep before expiry keeps the lease
        let revoked = f
            .server
            .state
            .dynamic
            .revoke_expired(expire_at - 1)
            .await
            .unwrap();
        assert_eq!(revoked, 0);

        let revoked = f.server.state.dynamic.revoke_expired(expire_at).await.unwrap();
        assert_eq!(revoked, 1);
        let (status, _) = admin.get(&lease_uri).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_rate_limited_per_client() {
        let mut limits = generous_limits();
        limits.auth.max_requests = 3;
        let f = fixture(limits).await;
        let client = f.server.client();
        let attempt = json!({ "clientId": "missing", "clientSecret": "wrong" });

        for _ in 0..3 {
            let (status, _) = client
                .post("/api/v1/auth/universal-auth/login", attempt.clone())
                .await
                .unwrap();
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        let resp = client
            .request(
                Method::POST,
                "/api/v1/auth/universal-auth/login",
                Some(attempt.clone()),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = resp.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));

        // a forged forwarding header does not buy a fresh budget
        let resp = client
            .request(
                Method::POST,
                "/api/v1/auth/universal-auth/login",
                Some(attempt),
                &[("x-forwarded-for", "203.0.113.7")],
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        // other classes are unaffected
        let (status, _) = client.get("/api/status").await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_rate_limited_per_forwarded_client_behind_proxy() {
        let mut limits = generous_limits();
        limits.auth.max_requests = 1;
        limits.trust_proxy = true;
        let f = fixture(limits).await;
        let client = f.server.client();
        let attempt = json!({ "clientId": "missing", "clientSecret": "wrong" });

        for (forwarded_for, expected) in [
            ("203.0.113.7", StatusCode::UNAUTHORIZED),
            ("203.0.113.7", StatusCode::TOO_MANY_REQUESTS),
            ("203.0.113.8", StatusCode::UNAUTHORIZED),
        ] {
            let resp = client
                .request(
                    Method::POST,
                    "/api/v1/auth/universal-auth/login",
                    Some(attempt.clone()),
                    &[("x-forwarded-for", forwarded_for)],
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), expected, "client {}", forwarded_for);
        }
    }

    #[tokio::test]
    async fn test_secrets_survive_restart() {
        let data_dir = TempDir::new().unwrap();
        let root_key = RootKey::generate().to_base64();

        let server = TestServer::start(data_dir.path(), &root_key, generous_limits())
            .await
            .unwrap();
        let seed = seed(&server).await.unwrap();
        let (status, _) = server
            .client()
            .with_token(&seed.admin_token)
            .post(
                "/api/v4/secrets/SIGNING_KEY",
                json!({
                    "projectId": seed.project_id,
                    "environment": "staging",
                    "secretValue": "s3cr3t",
                }),
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        drop(server);

        let server = TestServer::start(data_dir.path(), &root_key, generous_limits())
            .await
            .unwrap();
        let token = server.user_token(&seed.admin_id).await.unwrap();
        let (status, body) = server
            .client()
            .with_token(&token)
            .get(&format!(
                "/api/v4/secrets/SIGNING_KEY?projectId={}&environment=staging",
                seed.project_id
            ))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["secret"]["value"], "s3cr3t");
        assert_eq!(body["secret"]["version"], 1);
    }
}
