//! Cryptographically secure random generation.
//!
//! Everything here draws from the operating system CSPRNG.

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{KEY_SIZE, NONCE_SIZE};

/// Generates a random 256-bit key.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut *key);
    key
}

/// Generates a random AES-GCM nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generates `len` random bytes.
pub fn generate_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generates a lowercase hex token from `byte_len` random bytes.
pub fn generate_token(byte_len: usize) -> String {
    generate_bytes(byte_len)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Generates an alphanumeric password of `len` characters.
///
/// Used for database users created by dynamic secret providers.
pub fn generate_password(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates a lowercase username that starts with a letter.
///
/// Most SQL engines reject identifiers that start with a digit.
pub fn generate_username(len: usize) -> String {
    let len = len.max(1);
    let mut rng = OsRng;
    let first = char::from(b'a' + rng.gen_range(0..26u8));
    let rest: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len - 1)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}{}", first, rest)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_token_is_hex() {
        let token = generate_token(16);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_do_not_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(generate_token(8)));
        }
    }

    #[test]
    fn test_generate_password() {
        let pw = generate_password(48);
        assert_eq!(pw.len(), 48);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_username_starts_with_letter() {
        for _ in 0..50 {
            let name = generate_username(20);
            assert_eq!(name.len(), 20);
            assert!(name.chars().next().unwrap().is_ascii_lowercase());
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }
}
