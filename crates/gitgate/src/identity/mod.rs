//! Identity resolution.
//!
//! The session authenticates clients by public-key fingerprint through the
//! [`IdentityResolver`] capability. Two interchangeable implementations exist:
//! an in-memory table ([`local::LocalDirectory`]) and a mutual-TLS client
//! against the admin API ([`remote::RemoteDirectory`]). The session depends
//! only on the trait and fails closed on every resolver error.

mod local;
mod remote;

pub use local::LocalDirectory;
pub use remote::{RemoteDirectory, RemoteDirectoryConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A public key registered for an identity.
///
/// Field names serialize in PascalCase for wire compatibility with the admin
/// API's JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticatorKey {
    /// Unique name of this key for the identity (e.g. "laptop").
    pub name: String,
    /// SHA-256 fingerprint in `SHA256:<base64>` form, the lookup key.
    pub fingerprint: String,
    /// The public key material, if known.
    #[serde(default)]
    pub public_key: String,
}

/// A resolved principal: a name plus its registered keys.
///
/// Resolved once per session at authentication time; immutable for the
/// session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Identity {
    /// Unique name for the identity.
    pub name: String,
    /// All public keys registered for this identity.
    #[serde(default)]
    pub public_keys: Vec<AuthenticatorKey>,
}

/// Why a fingerprint could not be resolved.
///
/// Callers must reject the authentication attempt on both kinds, but log them
/// differently: `NotFound` is a genuinely unknown key, `Transport` is a
/// retryable infrastructure failure.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No identity has the supplied fingerprint registered.
    #[error("no identity matches the supplied public key")]
    NotFound,

    /// The resolver backend could not be reached or returned garbage.
    #[error("identity resolver transport failure: {0}")]
    Transport(String),
}

/// Capability consumed by the session: bind a public-key fingerprint to an
/// identity. Implementations are selected at construction time by
/// configuration, never by runtime type inspection.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve the identity that has `fingerprint` registered.
    async fn resolve_by_fingerprint(&self, fingerprint: &str) -> Result<Identity, ResolveError>;
}
