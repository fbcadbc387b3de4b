//! `totp` provider: one-time codes from an `otpauth://` URL or a manual
//! base32 secret.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use super::{parse_inputs, DynamicProvider, IssuedCredentials, LeaseRequest};
use crate::DynamicError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TotpAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl From<TotpAlgorithm> for Algorithm {
    fn from(alg: TotpAlgorithm) -> Self {
        match alg {
            TotpAlgorithm::Sha1 => Algorithm::SHA1,
            TotpAlgorithm::Sha256 => Algorithm::SHA256,
            TotpAlgorithm::Sha512 => Algorithm::SHA512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "configType", rename_all = "lowercase")]
enum TotpInputs {
    Url {
        url: String,
    },
    Manual {
        secret: String,
        #[serde(default)]
        period: Option<u64>,
        #[serde(default)]
        algorithm: Option<TotpAlgorithm>,
        #[serde(default)]
        digits: Option<usize>,
    },
}

impl TotpInputs {
    fn build(&self) -> Result<TOTP, DynamicError> {
        match self {
            TotpInputs::Url { url } => TOTP::from_url_unchecked(url)
                .map_err(|e| DynamicError::Invalid(format!("invalid OTP URL: {}", e))),
            TotpInputs::Manual {
                secret,
                period,
                algorithm,
                digits,
            } => {
                let bytes = Secret::Encoded(secret.to_uppercase())
                    .to_bytes()
                    .map_err(|e| DynamicError::Invalid(format!("invalid TOTP secret: {:?}", e)))?;
                Ok(TOTP::new_unchecked(
                    algorithm.unwrap_or(TotpAlgorithm::Sha1).into(),
                    digits.unwrap_or(6),
                    1,
                    period.unwrap_or(30),
                    bytes,
                    None,
                    String::new(),
                ))
            },
        }
    }
}

/// Issues TOTP codes.
#[derive(Debug, Default)]
pub struct TotpProvider;

impl TotpProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DynamicProvider for TotpProvider {
    fn validate_inputs(&self, inputs: Value) -> Result<Value, DynamicError> {
        let mut parsed: TotpInputs = parse_inputs(&inputs)?;
        match &mut parsed {
            TotpInputs::Url { url } => {
                *url = url.trim().to_string();
                if !url.starts_with("otpauth://") || !url.contains("secret=") {
                    return Err(DynamicError::Invalid(
                        "OTP URL must be an otpauth:// URL with a secret".into(),
                    ));
                }
            },
            TotpInputs::Manual {
                secret,
                period,
                digits,
                ..
            } => {
                *secret = secret.split_whitespace().collect();
                if secret.is_empty() {
                    return Err(DynamicError::Invalid("TOTP secret is required".into()));
                }
                if period.is_some_and(|p| p == 0) {
                    return Err(DynamicError::Invalid("TOTP period must be positive".into()));
                }
                if digits.is_some_and(|d| !(6..=8).contains(&d)) {
                    return Err(DynamicError::Invalid("TOTP digits must be 6 to 8".into()));
                }
            },
        }
        parsed.build()?;

        serde_json::to_value(parsed).map_err(|e| DynamicError::Invalid(e.to_string()))
    }

    async fn validate_connection(&self, _inputs: &Value) -> Result<(), DynamicError> {
        Ok(())
    }

    async fn create(
        &self,
        inputs: &Value,
        _request: &LeaseRequest,
    ) -> Result<IssuedCredentials, DynamicError> {
        let totp = parse_inputs::<TotpInputs>(inputs)?.build()?;
        let code = totp
            .generate_current()
            .map_err(|e| DynamicError::Provider(e.to_string()))?;
        let remaining = totp
            .ttl()
            .map_err(|e| DynamicError::Provider(e.to_string()))?;

        Ok(IssuedCredentials {
            entity_id: Uuid::new_v4().to_string(),
            data: json!({
                "TOTP": code,
                "TIME_REMAINING": remaining,
                "TIME_STEP": totp.step,
            }),
        })
    }

    async fn renew(
        &self,
        _inputs: &Value,
        entity_id: &str,
        _expire_at: u64,
    ) -> Result<String, DynamicError> {
        Ok(entity_id.to_string())
    }

    async fn revoke(&self, _inputs: &Value, entity_id: &str) -> Result<String, DynamicError> {
        Ok(entity_id.to_string())
    }
}
