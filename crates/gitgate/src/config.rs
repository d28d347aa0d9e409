//! Server configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Which identity resolver backend to construct.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// In-memory directory, optionally seeded from a JSON identities file.
    Local {
        #[serde(default)]
        identities_path: Option<PathBuf>,
    },
    /// Mutual-TLS client against the admin API.
    Remote {
        /// Base address, e.g. `https://localhost:9998`.
        address: String,
        client_cert_path: PathBuf,
        client_key_path: PathBuf,
        #[serde(default)]
        ca_path: Option<PathBuf>,
        /// Accept self-signed admin API certificates. Development only.
        #[serde(default)]
        insecure_skip_verify: bool,
    },
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::Local {
            identities_path: None,
        }
    }
}

/// Top-level configuration for the gate server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Address the SSH listener binds to.
    pub listen_address: String,

    /// Root path under which the repositories live.
    pub repositories_path: PathBuf,

    /// Path to the PEM-encoded host key presented to clients.
    pub host_key_path: PathBuf,

    /// Directory containing the `git-*` service binaries. When unset the
    /// binaries are resolved through `PATH`.
    pub git_bin_dir: Option<PathBuf>,

    /// Identity resolver selection.
    pub resolver: ResolverConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9999".to_string(),
            repositories_path: PathBuf::from("data/repositories"),
            host_key_path: PathBuf::from("data/gitgate.key"),
            git_bin_dir: None,
            resolver: ResolverConfig::default(),
        }
    }
}

impl GateConfig {
    /// Load configuration from a JSON file. Missing fields fall back to the
    /// defaults above.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("invalid config file: {e}")))
    }
}
