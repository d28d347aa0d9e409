//! In-memory identity directory.

use std::path::Path;
use std::sync::RwLock;

use tracing::debug;

use super::{Identity, IdentityResolver, ResolveError};
use crate::error::{Error, Result};

/// In-memory table of known identities.
///
/// Lookup is a linear scan over identities and their keys, which is fine at
/// the expected scale of a small team and documented as a scaling limit.
/// Reads vastly outnumber writes, so the table sits behind an `RwLock`:
/// many sessions resolve concurrently, updates take the lock exclusively.
pub struct LocalDirectory {
    identities: RwLock<Vec<Identity>>,
}

impl LocalDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(Vec::new()),
        }
    }

    /// Create a directory seeded with the given identities.
    pub fn with_identities(identities: Vec<Identity>) -> Self {
        Self {
            identities: RwLock::new(identities),
        }
    }

    /// Load identities from a JSON file (an array of identity objects).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let identities: Vec<Identity> = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("invalid identities file: {e}")))?;
        debug!(count = identities.len(), "loaded local identity directory");
        Ok(Self::with_identities(identities))
    }

    /// Insert or replace an identity by name.
    ///
    /// The server never mutates the directory itself; `upsert` and `remove`
    /// are the management surface for embedders that register keys at
    /// runtime instead of loading a file.
    pub fn upsert(&self, identity: Identity) {
        let mut identities = self.identities.write().expect("identity table poisoned");
        match identities.iter_mut().find(|i| i.name == identity.name) {
            Some(existing) => *existing = identity,
            None => identities.push(identity),
        }
    }

    /// Remove an identity by name. Returns whether anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut identities = self.identities.write().expect("identity table poisoned");
        let before = identities.len();
        identities.retain(|i| i.name != name);
        identities.len() != before
    }
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl IdentityResolver for LocalDirectory {
    async fn resolve_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> std::result::Result<Identity, ResolveError> {
        let identities = self.identities.read().expect("identity table poisoned");
        identities
            .iter()
            .find(|identity| {
                identity
                    .public_keys
                    .iter()
                    .any(|key| key.fingerprint == fingerprint)
            })
            .cloned()
            .ok_or(ResolveError::NotFound)
    }
}
