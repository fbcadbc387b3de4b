//! Sealed envelopes stored alongside engine documents.
//!
//! A [`Sealed`] value is the base64 of an AES-GCM buffer. It serializes as a
//! plain string so engines can embed it directly in their JSON documents.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::DataKey;

/// Encrypted bytes, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sealed(String);

impl Sealed {
    /// Encrypts raw bytes.
    pub fn seal(key: &DataKey, plaintext: &[u8], aad: &str) -> Result<Self, CryptoError> {
        let buf = key.seal(plaintext, aad.as_bytes())?;
        Ok(Self(STANDARD.encode(buf)))
    }

    /// Serializes `value` to JSON and encrypts it.
    pub fn seal_json<T: Serialize>(
        key: &DataKey,
        value: &T,
        aad: &str,
    ) -> Result<Self, CryptoError> {
        let json = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| CryptoError::InvalidInput(e.to_string()))?,
        );
        Self::seal(key, &json, aad)
    }

    /// Decrypts to raw bytes.
    pub fn open(&self, key: &DataKey, aad: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let buf = STANDARD
            .decode(&self.0)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        key.open(&buf, aad.as_bytes())
    }

    /// Decrypts and deserializes a value sealed with [`Sealed::seal_json`].
    pub fn open_json<T: DeserializeOwned>(
        &self,
        key: &DataKey,
        aad: &str,
    ) -> Result<T, CryptoError> {
        let plain = self.open(key, aad)?;
        serde_json::from_slice(&plain).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::keys::RootKey;
    use serde_json::json;

    #[test]
    fn test_json_envelope() {
        let key = RootKey::generate().data_key("p1", "dynamic").unwrap();
        let inputs = json!({"host": "db.internal", "password": "s3cret"});

        let sealed = Sealed::seal_json(&key, &inputs, "ds-1").unwrap();
        let encoded = serde_json::to_string(&sealed).unwrap();
        assert!(!encoded.contains("s3cret"));

        let back: serde_json::Value = sealed.open_json(&key, "ds-1").unwrap();
        assert_eq!(back, inputs);
    }

    #[test]
    fn test_envelope_bound_to_aad() {
        let key = RootKey::generate().data_key("p1", "kmip").unwrap();
        let sealed = Sealed::seal(&key, &[1, 2, 3], "object-1").unwrap();
        assert!(sealed.open(&key, "object-2").is_err());
    }
}
