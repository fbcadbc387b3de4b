//! Argon2id hashing for long-lived credentials.
//!
//! Client secrets and SCIM tokens are only ever stored as PHC strings.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// Hashes `secret` with Argon2id and a random salt, returning a PHC string.
pub fn hash_secret(secret: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::HashingFailed(e.to_string()))
}

/// Checks `secret` against a PHC string produced by [`hash_secret`].
///
/// A malformed stored hash is reported as an error, a mismatch as `Ok(false)`.
pub fn verify_secret(secret: &str, phc: &str) -> Result<bool, CryptoError> {
    let parsed = PasswordHash::new(phc).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let phc = hash_secret("cs-0123456789").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(verify_secret("cs-0123456789", &phc).unwrap());
        assert!(!verify_secret("cs-9876543210", &phc).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_secret("same").unwrap(), hash_secret("same").unwrap());
    }

    #[test]
    fn test_malformed_hash() {
        assert!(verify_secret("x", "not-a-phc-string").is_err());
    }
}
