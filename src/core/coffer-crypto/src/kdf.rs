//! HKDF-SHA256 key derivation (RFC 5869).
//!
//! Coffer never encrypts with the root key directly. Each project and each
//! purpose gets its own data key derived from the root key.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;

/// Derives `length` bytes of key material from `ikm`.
pub fn derive_key(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 || length > 255 * 32 {
        return Err(CryptoError::InvalidInput(format!(
            "invalid HKDF output length {}",
            length
        )));
    }

    let mut okm = Zeroizing::new(vec![0u8; length]);
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyGenerationFailed("HKDF expansion failed".to_string()))?;

    Ok(okm)
}

/// Derives the AES-256 data key for `purpose` inside `project_id`.
///
/// The info string is `coffer-v1:{purpose}:{project_id}`.
pub fn derive_project_key(
    root_key: &[u8],
    project_id: &str,
    purpose: &str,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let info = format!("coffer-v1:{}:{}", purpose, project_id);
    let okm = derive_key(root_key, None, info.as_bytes(), KEY_SIZE)?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&okm);
    Ok(key)
}
