//! AES-256-GCM authenticated encryption.
//!
//! Every value Coffer persists encrypted (secret values, dynamic secret
//! provider inputs, KMIP key material, SSH CA private keys) goes through
//! [`seal`] and [`open`]. The output layout is `nonce (12) || ciphertext || tag (16)`.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::generate_nonce;

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypts `plaintext` under `key`, binding `aad` into the tag.
///
/// A fresh random nonce is generated per call and prepended to the output.
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    let nonce_bytes = generate_nonce();

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a buffer produced by [`seal`].
///
/// Fails if the key, the AAD or any byte of the buffer differs from what
/// was used at encryption time.
pub fn open(key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher(key)?;

    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidInput("ciphertext too short".to_string()));
    }

    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
        .map_err(|_| CryptoError::DecryptionFailed("authentication failed".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::random::generate_key;

    #[test]
    fn test_seal_open() {
        let key = generate_key();
        let sealed = seal(&*key, b"postgres://app:pw@db", b"project-1").unwrap();
        let opened = open(&*key, &sealed, b"project-1").unwrap();
        assert_eq!(&*opened, b"postgres://app:pw@db");
    }

    #[test]
    fn test_open_with_other_aad_fails() {
        let key = generate_key();
        let sealed = seal(&*key, b"value", b"/prod/API_KEY").unwrap();
        assert!(open(&*key, &sealed, b"/dev/API_KEY").is_err());
    }

    #[test]
    fn test_open_with_other_key_fails() {
        let sealed = seal(&*generate_key(), b"value", b"").unwrap();
        assert!(open(&*generate_key(), &sealed, b"").is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        let result = seal(&[0u8; 16], b"value", b"");
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_output_layout() {
        let key = generate_key();
        let sealed = seal(&*key, b"abcd", b"").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 4 + TAG_SIZE);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let key = generate_key();
        let result = open(&*key, &[0u8; NONCE_SIZE], b"");
        assert!(matches!(result, Err(CryptoError::InvalidInput(_))));
    }

    #[test]
    fn test_tampered_body_fails() {
        let key = generate_key();
        let mut sealed = seal(&*key, b"value", b"").unwrap();
        sealed[NONCE_SIZE] ^= 0x01;
        assert!(open(&*key, &sealed, b"").is_err());
    }
}
