//! # Coffer Auth
//!
//! Authentication for the Coffer API.
//!
//! ## Supported Modes
//!
//! - `jwt`: user tokens signed by the server (HS256)
//! - `identity-access-token`: tokens issued to machine identities by
//!   universal auth login (client id + client secret)
//! - `scim-token`: organization-scoped tokens used by SCIM provisioning
//!
//! Routes declare which modes they accept; the [`Authenticator`] dispatches
//! a bearer token to the backend that recognizes it and rejects modes the
//! route does not allow.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authenticator;
pub mod backend;
pub mod context;
pub mod error;
pub mod jwt;
pub mod scim;
pub mod universal_auth;

pub use authenticator::Authenticator;
pub use backend::AuthBackend;
pub use context::{Actor, AuthContext, AuthMode};
pub use error::AuthError;
pub use jwt::{JwtBackend, JwtConfig};
pub use scim::{ScimToken, ScimTokenBackend};
pub use universal_auth::{ClientSecret, Identity, LoginResult, UniversalAuth};

/// Returns the current Unix timestamp.
pub(crate) fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
