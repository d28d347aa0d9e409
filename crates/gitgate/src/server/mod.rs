//! SSH listener and per-connection dispatch.

pub mod pipeline;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Server;
use tracing::{info, warn};

use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityResolver;
use session::SessionHandler;

/// Version banner presented to clients during the SSH handshake.
pub const SERVER_ID: &str = "SSH-2.0-Gitgate_0.1.0";

/// The SSH server: accepts raw connections and spawns one
/// [`SessionHandler`] task per connection. A fatal condition inside one
/// session tears down that session only; the listener and sibling sessions
/// are unaffected.
pub struct GateServer {
    config: GateConfig,
    resolver: Arc<dyn IdentityResolver>,
}

impl GateServer {
    pub fn new(config: GateConfig, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { config, resolver }
    }

    /// Bind the listener and serve until the process is stopped.
    pub async fn run(mut self) -> Result<()> {
        let host_key = russh::keys::load_secret_key(&self.config.host_key_path, None)
            .map_err(|e| Error::Config(format!("could not load host key: {e}")))?;

        let ssh_config = russh::server::Config {
            server_id: russh::SshId::Standard(SERVER_ID.into()),
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        };

        let address = self.config.listen_address.clone();
        info!(address = %address, "git server listening");
        self.run_on_address(Arc::new(ssh_config), address.as_str())
            .await?;
        Ok(())
    }
}

impl Server for GateServer {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SessionHandler {
        info!(peer = ?peer_addr, "new connection established");
        SessionHandler::new(
            Arc::clone(&self.resolver),
            self.config.repositories_path.clone(),
            self.config.git_bin_dir.clone(),
            peer_addr,
        )
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        // Handshake and protocol failures are per-session, never fatal here.
        warn!(error = %error, "session ended with error");
    }
}
