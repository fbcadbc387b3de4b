//! # Coffer Crypto
//!
//! Cryptographic primitives shared by every Coffer engine.
//!
//! - Authenticated encryption (AES-256-GCM)
//! - Key derivation (HKDF-SHA256), including per-project data keys
//! - Sealed JSON envelopes for provider inputs and key material
//! - Argon2id hashing for client secrets and SCIM tokens
//! - Secure random keys, tokens, usernames and passwords

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod random;

pub use envelope::Sealed;
pub use error::CryptoError;
pub use keys::{DataKey, RootKey};
