//! SSH certificate authorities, certificate templates and signing.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use coffer_audit::EventType;
use coffer_projects::{Action, Subject};
use coffer_ssh::{
    IssueRequest, IssuedCredentials, NewSshCa, NewSshCertTemplate, SignRequest,
    SignedCertificate, SshCa, SshCaUpdate, SshCertTemplate, SshCertTemplateUpdate, SshCertType,
    SshStatus,
};

use super::ProjectQuery;
use crate::auth::JWT_OR_IDENTITY;
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateCaBody {
    project_id: String,
    #[validate(length(min = 1, max = 64))]
    friendly_name: String,
    private_key: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateCaBody {
    project_id: String,
    #[validate(length(min = 1, max = 64))]
    friendly_name: Option<String>,
    status: Option<SshStatus>,
}

#[derive(Debug, Serialize)]
struct CaResponse {
    ca: SshCa,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateQuery {
    project_id: String,
    ca_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateTemplateBody {
    project_id: String,
    ca_id: String,
    #[validate(length(min = 1, max = 64))]
    name: String,
    #[serde(default = "default_template_ttl")]
    ttl: String,
    #[serde(default = "default_template_max_ttl")]
    max_ttl: String,
    #[serde(default)]
    allowed_users: Vec<String>,
    #[serde(default)]
    allowed_hosts: Vec<String>,
    #[serde(default = "default_true")]
    allow_user_certificates: bool,
    #[serde(default)]
    allow_host_certificates: bool,
    #[serde(default)]
    allow_custom_key_ids: bool,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateTemplateBody {
    project_id: String,
    #[validate(length(min = 1, max = 64))]
    name: Option<String>,
    ttl: Option<String>,
    max_ttl: Option<String>,
    allowed_users: Option<Vec<String>>,
    allowed_hosts: Option<Vec<String>>,
    allow_user_certificates: Option<bool>,
    allow_host_certificates: Option<bool>,
    allow_custom_key_ids: Option<bool>,
    status: Option<SshStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateResponse {
    certificate_template: SshCertTemplate,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct SignBody {
    project_id: String,
    certificate_template_id: String,
    public_key: String,
    #[serde(default = "default_cert_type")]
    cert_type: SshCertType,
    #[validate(length(min = 1))]
    principals: Vec<String>,
    ttl: Option<String>,
    key_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct IssueBody {
    project_id: String,
    certificate_template_id: String,
    #[serde(default = "default_cert_type")]
    cert_type: SshCertType,
    #[validate(length(min = 1))]
    principals: Vec<String>,
    ttl: Option<String>,
    key_id: Option<String>,
}

fn default_template_ttl() -> String {
    "1h".to_string()
}

fn default_template_max_ttl() -> String {
    "24h".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cert_type() -> SshCertType {
    SshCertType::User
}

fn ca_metadata(ca: &SshCa) -> serde_json::Value {
    json!({ "sshCaId": ca.id, "friendlyName": ca.friendly_name })
}

fn template_metadata(template: &SshCertTemplate) -> serde_json::Value {
    json!({
        "certificateTemplateId": template.id,
        "sshCaId": template.ca_id,
        "name": template.name,
        "ttl": template.ttl,
        "maxTTL": template.max_ttl,
        "allowedUsers": template.allowed_users,
        "allowedHosts": template.allowed_hosts,
    })
}

async fn create_ca(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateCaBody>,
) -> Result<Json<CaResponse>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SshCertificateAuthorities, Action::Create)?;

    let ca = state
        .ssh
        .create_ca(
            &body.project_id,
            NewSshCa {
                friendly_name: body.friendly_name,
                private_key: body.private_key,
            },
        )
        .await?;

    state
        .emit(&auth, Some(&ca.project_id), EventType::CreateSshCa, ca_metadata(&ca), &meta)
        .await;
    Ok(Json(CaResponse { ca }))
}

async fn list_cas(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateAuthorities, Action::Read)?;
    let cas = state.ssh.list_cas(&query.project_id).await?;
    Ok(Json(json!({ "cas": cas })))
}

async fn get_ca(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(ca_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<CaResponse>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateAuthorities, Action::Read)?;
    let ca = state.ssh.get_ca(&query.project_id, &ca_id).await?;

    state
        .emit(&auth, Some(&ca.project_id), EventType::GetSshCa, ca_metadata(&ca), &meta)
        .await;
    Ok(Json(CaResponse { ca }))
}

async fn update_ca(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(ca_id): Path<String>,
    Json(body): Json<UpdateCaBody>,
) -> Result<Json<CaResponse>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SshCertificateAuthorities, Action::Edit)?;

    let ca = state
        .ssh
        .update_ca(
            &body.project_id,
            &ca_id,
            SshCaUpdate {
                friendly_name: body.friendly_name,
                status: body.status,
            },
        )
        .await?;

    let mut metadata = ca_metadata(&ca);
    metadata["status"] = json!(ca.status);
    state
        .emit(&auth, Some(&ca.project_id), EventType::UpdateSshCa, metadata, &meta)
        .await;
    Ok(Json(CaResponse { ca }))
}

async fn delete_ca(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(ca_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<CaResponse>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateAuthorities, Action::Delete)?;
    let ca = state.ssh.delete_ca(&query.project_id, &ca_id).await?;

    state
        .emit(&auth, Some(&ca.project_id), EventType::DeleteSshCa, ca_metadata(&ca), &meta)
        .await;
    Ok(Json(CaResponse { ca }))
}

async fn ca_public_key(
    State(state): State<AppState>,
    auth: Auth,
    Path(ca_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateAuthorities, Action::Read)?;
    let public_key = state.ssh.public_key(&query.project_id, &ca_id).await?;
    Ok(Json(json!({ "publicKey": public_key })))
}

async fn create_template(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateTemplateBody>,
) -> Result<Json<TemplateResponse>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SshCertificateTemplates, Action::Create)?;

    let template = state
        .ssh
        .create_template(
            &body.project_id,
            NewSshCertTemplate {
                ca_id: body.ca_id,
                name: body.name,
                ttl: body.ttl,
                max_ttl: body.max_ttl,
                allowed_users: body.allowed_users,
                allowed_hosts: body.allowed_hosts,
                allow_user_certificates: body.allow_user_certificates,
                allow_host_certificates: body.allow_host_certificates,
                allow_custom_key_ids: body.allow_custom_key_ids,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&template.project_id),
            EventType::CreateSshCertificateTemplate,
            template_metadata(&template),
            &meta,
        )
        .await;
    Ok(Json(TemplateResponse {
        certificate_template: template,
    }))
}

async fn list_templates(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<TemplateQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateTemplates, Action::Read)?;
    let templates = state
        .ssh
        .list_templates(&query.project_id, query.ca_id.as_deref())
        .await?;
    Ok(Json(json!({ "certificateTemplates": templates })))
}

async fn get_template(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(template_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<TemplateResponse>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateTemplates, Action::Read)?;
    let template = state.ssh.get_template(&query.project_id, &template_id).await?;

    state
        .emit(
            &auth,
            Some(&template.project_id),
            EventType::GetSshCertificateTemplate,
            template_metadata(&template),
            &meta,
        )
        .await;
    Ok(Json(TemplateResponse {
        certificate_template: template,
    }))
}

async fn update_template(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(template_id): Path<String>,
    Json(body): Json<UpdateTemplateBody>,
) -> Result<Json<TemplateResponse>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SshCertificateTemplates, Action::Edit)?;

    let template = state
        .ssh
        .update_template(
            &body.project_id,
            &template_id,
            SshCertTemplateUpdate {
                name: body.name,
                ttl: body.ttl,
                max_ttl: body.max_ttl,
                allowed_users: body.allowed_users,
                allowed_hosts: body.allowed_hosts,
                allow_user_certificates: body.allow_user_certificates,
                allow_host_certificates: body.allow_host_certificates,
                allow_custom_key_ids: body.allow_custom_key_ids,
                status: body.status,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&template.project_id),
            EventType::UpdateSshCertificateTemplate,
            template_metadata(&template),
            &meta,
        )
        .await;
    Ok(Json(TemplateResponse {
        certificate_template: template,
    }))
}

async fn delete_template(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(template_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<TemplateResponse>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SshCertificateTemplates, Action::Delete)?;
    let template = state.ssh.delete_template(&query.project_id, &template_id).await?;

    state
        .emit(
            &auth,
            Some(&template.project_id),
            EventType::DeleteSshCertificateTemplate,
            template_metadata(&template),
            &meta,
        )
        .await;
    Ok(Json(TemplateResponse {
        certificate_template: template,
    }))
}

async fn sign_key(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<SignBody>,
) -> Result<Json<SignedCertificate>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SshCertificates, Action::Create)?;

    let template_id = body.certificate_template_id.clone();
    let cert = state
        .ssh
        .sign_key(
            &body.project_id,
            SignRequest {
                template_id: body.certificate_template_id,
                public_key: body.public_key,
                cert_type: body.cert_type,
                principals: body.principals,
                ttl: body.ttl,
                key_id: body.key_id,
            },
            &auth.default_key_id(),
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::SignSshKey,
            json!({
                "certificateTemplateId": template_id,
                "certType": cert.cert_type,
                "principals": cert.principals,
                "ttl": cert.ttl,
                "keyId": cert.key_id,
                "serialNumber": cert.serial_number,
            }),
            &meta,
        )
        .await;
    Ok(Json(cert))
}

async fn issue_credentials(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<IssueBody>,
) -> Result<Json<IssuedCredentials>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SshCertificates, Action::Create)?;

    let template_id = body.certificate_template_id.clone();
    let creds = state
        .ssh
        .issue_credentials(
            &body.project_id,
            IssueRequest {
                template_id: body.certificate_template_id,
                cert_type: body.cert_type,
                principals: body.principals,
                ttl: body.ttl,
                key_id: body.key_id,
            },
            &auth.default_key_id(),
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::IssueSshCreds,
            json!({
                "certificateTemplateId": template_id,
                "certType": creds.certificate.cert_type,
                "principals": creds.certificate.principals,
                "ttl": creds.certificate.ttl,
                "keyId": creds.certificate.key_id,
                "serialNumber": creds.certificate.serial_number,
            }),
            &meta,
        )
        .await;
    Ok(Json(creds))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new()
            .route("/api/v1/ssh/ca", post(create_ca).get(list_cas))
            .route(
                "/api/v1/ssh/ca/{ca_id}",
                get(get_ca).patch(update_ca).delete(delete_ca),
            )
            .route("/api/v1/ssh/ca/{ca_id}/public-key", get(ca_public_key))
            .route(
                "/api/v1/ssh/certificate-templates",
                post(create_template).get(list_templates),
            )
            .route(
                "/api/v1/ssh/certificate-templates/{template_id}",
                get(get_template).patch(update_template).delete(delete_template),
            )
            .route("/api/v1/ssh/certificates/sign", post(sign_key))
            .route("/api/v1/ssh/certificates/issue", post(issue_credentials)),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    )
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use coffer_projects::ProjectRole;

    use crate::routes::testing::Harness;

    /// Creates a CA and a user template; returns (ca id, template id).
    async fn setup(h: &Harness) -> (String, String) {
        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v1/ssh/ca",
                Some(json!({ "projectId": h.project.id, "friendlyName": "prod-ca" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let ca_id = body["ca"]["id"].as_str().unwrap().to_string();

        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v1/ssh/certificate-templates",
                Some(json!({
                    "projectId": h.project.id,
                    "caId": ca_id,
                    "name": "ops",
                    "ttl": "1h",
                    "maxTtl": "8h",
                    "allowedUsers": ["ubuntu", "deploy"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let template_id = body["certificateTemplate"]["id"].as_str().unwrap().to_string();
        (ca_id, template_id)
    }

    #[tokio::test]
    async fn test_issue_then_sign() {
        let h = Harness::new().await;
        let (ca_id, template_id) = setup(&h).await;

        let (status, body) = h
            .admin(
                Method::GET,
                &format!("/api/v1/ssh/ca/{}/public-key?projectId={}", ca_id, h.project.id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["publicKey"].as_str().unwrap().starts_with("ssh-ed25519 "));

        let (status, issued) = h
            .admin(
                Method::POST,
                "/api/v1/ssh/certificates/issue",
                Some(json!({
                    "projectId": h.project.id,
                    "certificateTemplateId": template_id,
                    "principals": ["ubuntu"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(issued["keyId"], format!("user-{}", h.admin_id));
        assert_eq!(issued["ttl"], 3600);

        let (status, signed) = h
            .admin(
                Method::POST,
                "/api/v1/ssh/certificates/sign",
                Some(json!({
                    "projectId": h.project.id,
                    "certificateTemplateId": template_id,
                    "publicKey": issued["publicKey"],
                    "principals": ["deploy"],
                    "ttl": "2h",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(signed["signedKey"]
            .as_str()
            .unwrap()
            .starts_with("ssh-ed25519-cert-v01@openssh.com "));
        assert_eq!(signed["ttl"], 7200);
    }

    #[tokio::test]
    async fn test_principal_outside_template_is_rejected() {
        let h = Harness::new().await;
        let (_, template_id) = setup(&h).await;

        let (status, _) = h
            .admin(
                Method::POST,
                "/api/v1/ssh/certificates/issue",
                Some(json!({
                    "projectId": h.project.id,
                    "certificateTemplateId": template_id,
                    "principals": ["root"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disabled_ca_refuses_to_sign() {
        let h = Harness::new().await;
        let (ca_id, template_id) = setup(&h).await;

        let (status, body) = h
            .admin(
                Method::PATCH,
                &format!("/api/v1/ssh/ca/{}", ca_id),
                Some(json!({ "projectId": h.project.id, "status": "disabled" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ca"]["status"], "disabled");

        let (status, _) = h
            .admin(
                Method::POST,
                "/api/v1/ssh/certificates/issue",
                Some(json!({
                    "projectId": h.project.id,
                    "certificateTemplateId": template_id,
                    "principals": ["ubuntu"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_member_signs_but_cannot_manage_cas() {
        let h = Harness::new().await;
        let (_, template_id) = setup(&h).await;
        let (member_id, member_token) = h.member("ops@acme.test", ProjectRole::Member).await;

        let (status, _) = h
            .call(
                Method::POST,
                "/api/v1/ssh/ca",
                Some(&member_token),
                Some(json!({ "projectId": h.project.id, "friendlyName": "rogue" })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = h
            .call(
                Method::POST,
                "/api/v1/ssh/certificates/issue",
                Some(&member_token),
                Some(json!({
                    "projectId": h.project.id,
                    "certificateTemplateId": template_id,
                    "principals": ["deploy"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keyId"], format!("user-{}", member_id));
    }
}
