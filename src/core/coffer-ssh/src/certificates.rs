//! Certificate signing under a template.

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::info;

use coffer_crypto::random;
use coffer_projects::now;

use crate::templates::{parse_ttl, principal_allowed, validate_principals};
use crate::wire::{self, CertFields, CertKind};
use crate::{
    IssueRequest, IssuedCredentials, SignRequest, SignedCertificate, SshCertTemplate,
    SshCertType, SshEngine, SshError, SshStatus,
};

const NONCE_LEN: usize = 32;
const MAX_KEY_ID_LEN: usize = 255;

struct Validated {
    ttl: u64,
    valid_after: u64,
    valid_before: u64,
    key_id: String,
    principals: Vec<String>,
}

fn validate_request(
    template: &SshCertTemplate,
    cert_type: SshCertType,
    principals: &[String],
    ttl: Option<&str>,
    key_id: Option<&str>,
    default_key_id: &str,
) -> Result<Validated, SshError> {
    let (kind, allowed, patterns) = match cert_type {
        SshCertType::User => ("user", template.allow_user_certificates, &template.allowed_users),
        SshCertType::Host => ("host", template.allow_host_certificates, &template.allowed_hosts),
    };
    if !allowed {
        return Err(SshError::Invalid(format!(
            "{:?} certificates are not allowed by this template",
            cert_type
        )));
    }

    if principals.is_empty() {
        return Err(SshError::Invalid("at least one principal is required".into()));
    }
    let principals = validate_principals(kind, principals)?;
    if let Some(denied) = principals.iter().find(|p| !principal_allowed(patterns, p)) {
        return Err(SshError::Invalid(format!(
            "principal '{}' is not allowed by this template",
            denied
        )));
    }

    let ttl = match ttl {
        Some(ttl) => parse_ttl(ttl)?,
        None => template.ttl,
    };
    if ttl > template.max_ttl {
        return Err(SshError::Invalid("TTL cannot be larger than max TTL".into()));
    }
    let valid_after = now();
    let valid_before = valid_after
        .checked_add(ttl)
        .ok_or_else(|| SshError::Invalid(format!("TTL of {}s is too large", ttl)))?;

    let key_id = match key_id.map(str::trim).filter(|k| !k.is_empty()) {
        Some(requested) if template.allow_custom_key_ids => requested.to_string(),
        Some(_) => {
            return Err(SshError::Invalid(
                "custom key ids are not allowed by this template".into(),
            ))
        },
        None => default_key_id.to_string(),
    };
    if key_id.len() > MAX_KEY_ID_LEN {
        return Err(SshError::Invalid("key id is too long".into()));
    }

    Ok(Validated {
        ttl,
        valid_after,
        valid_before,
        key_id,
        principals,
    })
}

fn serial_number() -> u64 {
    let bytes = random::generate_bytes(8);
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes);
    u64::from_be_bytes(arr)
}

impl SshEngine {
    async fn signing_context(
        &self,
        project_id: &str,
        template_id: &str,
    ) -> Result<(SshCertTemplate, SigningKey), SshError> {
        let template = self.get_template(project_id, template_id).await?;
        if template.status == SshStatus::Disabled {
            return Err(SshError::Disabled(format!("certificate template '{}'", template.name)));
        }
        let stored = self.load_ca(project_id, &template.ca_id).await?;
        if stored.ca.status == SshStatus::Disabled {
            return Err(SshError::Disabled(format!("SSH CA '{}'", stored.ca.friendly_name)));
        }
        let key = self.signing_key(&stored)?;
        Ok((template, key))
    }

    fn sign(
        ca_key: &SigningKey,
        public_key: &VerifyingKey,
        cert_type: SshCertType,
        validated: Validated,
    ) -> SignedCertificate {
        let serial = serial_number();
        let nonce = random::generate_bytes(NONCE_LEN);

        let signed_key = wire::sign_certificate(
            ca_key,
            &CertFields {
                nonce: &nonce,
                public_key,
                serial,
                kind: match cert_type {
                    SshCertType::User => CertKind::User,
                    SshCertType::Host => CertKind::Host,
                },
                key_id: &validated.key_id,
                principals: &validated.principals,
                valid_after: validated.valid_after,
                valid_before: validated.valid_before,
            },
        );

        SignedCertificate {
            serial_number: serial.to_string(),
            signed_key,
            key_id: validated.key_id,
            principals: validated.principals,
            cert_type,
            ttl: validated.ttl,
            valid_after: validated.valid_after,
            valid_before: validated.valid_before,
        }
    }

    /// Signs an existing ed25519 public key.
    ///
    /// `default_key_id` is embedded when the template forbids custom key ids
    /// or none was requested.
    pub async fn sign_key(
        &self,
        project_id: &str,
        request: SignRequest,
        default_key_id: &str,
    ) -> Result<SignedCertificate, SshError> {
        let (template, ca_key) = self.signing_context(project_id, &request.template_id).await?;
        let validated = validate_request(
            &template,
            request.cert_type,
            &request.principals,
            request.ttl.as_deref(),
            request.key_id.as_deref(),
            default_key_id,
        )?;
        let public_key = wire::parse_public_key(&request.public_key)?;

        let cert = Self::sign(&ca_key, &public_key, request.cert_type, validated);
        info!(
            template_id = %template.id,
            serial = %cert.serial_number,
            key_id = %cert.key_id,
            "SSH certificate signed"
        );
        Ok(cert)
    }

    /// Generates an ed25519 key pair and signs its public key.
    pub async fn issue_credentials(
        &self,
        project_id: &str,
        request: IssueRequest,
        default_key_id: &str,
    ) -> Result<IssuedCredentials, SshError> {
        let (template, ca_key) = self.signing_context(project_id, &request.template_id).await?;
        let validated = validate_request(
            &template,
            request.cert_type,
            &request.principals,
            request.ttl.as_deref(),
            request.key_id.as_deref(),
            default_key_id,
        )?;

        let key = SigningKey::from_bytes(&random::generate_key());
        let private_key = wire::format_private_key(&key, &validated.key_id);
        let public_key = wire::format_public_key(&key.verifying_key(), None);

        let cert = Self::sign(&ca_key, &key.verifying_key(), request.cert_type, validated);
        info!(
            template_id = %template.id,
            serial = %cert.serial_number,
            key_id = %cert.key_id,
            "SSH credentials issued"
        );
        Ok(IssuedCredentials {
            private_key: private_key.to_string(),
            public_key,
            certificate: cert,
        })
    }
}
