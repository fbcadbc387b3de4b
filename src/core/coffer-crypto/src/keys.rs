//! Key types with automatic memory zeroization.

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead::{self, KEY_SIZE};
use crate::error::CryptoError;
use crate::kdf::derive_project_key;
use crate::random::generate_key;

fn copy_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// The server-wide root key every data key is derived from.
///
/// Loaded from configuration (base64) or generated in dev mode.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    bytes: [u8; KEY_SIZE],
}

impl RootKey {
    /// Generates a new random root key.
    pub fn generate() -> Self {
        Self {
            bytes: *generate_key(),
        }
    }

    /// Creates a root key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: copy_key(bytes)?,
        })
    }

    /// Parses a base64-encoded root key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&raw)
    }

    /// Encodes the key as base64, for printing in dev mode.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Derives the data key for `purpose` within `project_id`.
    pub fn data_key(&self, project_id: &str, purpose: &str) -> Result<DataKey, CryptoError> {
        let derived = derive_project_key(&self.bytes, project_id, purpose)?;
        Ok(DataKey { bytes: *derived })
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-project, per-purpose AES-256 key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    /// Creates a data key from raw bytes, e.g. imported KMIP key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: copy_key(bytes)?,
        })
    }

    /// Encrypts `plaintext`, binding `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::seal(&self.bytes, plaintext, aad)
    }

    /// Decrypts a value produced by [`DataKey::seal`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        aead::open(&self.bytes, sealed, aad)
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_root_key_base64_roundtrip() {
        let key = RootKey::generate();
        let parsed = RootKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.bytes, parsed.bytes);
    }

    #[test]
    fn test_root_key_rejects_short_input() {
        let result = RootKey::from_base64("c2hvcnQ=");
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = RootKey::from_bytes(&[0x42; KEY_SIZE]).unwrap();
        let out = format!("{:?}", key);
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("66"));
    }

    #[test]
    fn test_data_key_cannot_open_other_project() {
        let root = RootKey::generate();
        let a = root.data_key("p1", "secrets").unwrap();
        let b = root.data_key("p2", "secrets").unwrap();

        let sealed = a.seal(b"hunter2", b"").unwrap();
        assert_eq!(&*a.open(&sealed, b"").unwrap(), b"hunter2");
        assert!(b.open(&sealed, b"").is_err());
    }
}
