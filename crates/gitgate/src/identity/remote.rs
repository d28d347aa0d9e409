//! Remote identity directory: mutual-TLS client against the admin API.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use url::Url;

use super::{Identity, IdentityResolver, ResolveError};
use crate::error::{Error, Result};

/// Request timeout for resolver calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle connections kept towards the admin API.
const MAX_IDLE_CONNS: usize = 20;

/// How long an idle connection may be pooled.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for [`RemoteDirectory`].
#[derive(Debug, Clone)]
pub struct RemoteDirectoryConfig {
    /// Base address of the admin API, e.g. `https://localhost:9998`.
    pub address: String,
    /// PEM-encoded client certificate presented to the admin API.
    pub client_cert_path: PathBuf,
    /// PEM-encoded private key for the client certificate.
    pub client_key_path: PathBuf,
    /// CA bundle that issued the admin API's server certificate.
    pub ca_path: Option<PathBuf>,
    /// Skip server certificate verification. Only for self-signed
    /// development setups.
    pub insecure_skip_verify: bool,
}

/// Identity directory backed by the admin API over client-certificate TLS.
///
/// The fingerprint travels as a query parameter; the response body is a JSON
/// identity object. A non-success status is treated as "not found", while
/// network and decode failures surface as [`ResolveError::Transport`] so
/// callers can tell a retryable outage from a genuinely unknown key.
pub struct RemoteDirectory {
    address: Url,
    client: Client,
}

impl RemoteDirectory {
    /// Build the TLS client and validate the configured address.
    pub fn new(config: &RemoteDirectoryConfig) -> Result<Self> {
        let address = Url::parse(&config.address)
            .map_err(|e| Error::Config(format!("invalid admin api address: {e}")))?;

        // reqwest wants certificate and key in one PEM bundle.
        let mut pem = std::fs::read(&config.client_cert_path)?;
        pem.extend_from_slice(&std::fs::read(&config.client_key_path)?);
        let client_identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::Config(format!("invalid client certificate: {e}")))?;

        let mut builder = Client::builder()
            .identity(client_identity)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .use_rustls_tls();

        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(ca_path) = &config.ca_path {
            let ca = reqwest::Certificate::from_pem(&std::fs::read(ca_path)?)
                .map_err(|e| Error::Config(format!("invalid ca bundle: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("could not build admin api client: {e}")))?;

        Ok(Self { address, client })
    }
}

#[async_trait::async_trait]
impl IdentityResolver for RemoteDirectory {
    async fn resolve_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> std::result::Result<Identity, ResolveError> {
        let mut url = self
            .address
            .join("/api/v1/users")
            .map_err(|e| ResolveError::Transport(e.to_string()))?;
        url.query_pairs_mut().append_pair("fingerprint", fingerprint);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "admin api returned non-success for fingerprint lookup");
            return Err(ResolveError::NotFound);
        }

        response
            .json::<Identity>()
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))
    }
}
