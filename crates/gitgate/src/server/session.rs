//! Per-connection SSH session handler.
//!
//! One [`SessionHandler`] exists per accepted connection. It authenticates
//! the client through the identity resolver (failing closed on both unknown
//! keys and resolver outages), accepts only `session` channels, filters env
//! requests against the allow-list, and dispatches at most one exec request
//! per channel to the process pipeline.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command;
use crate::error::Error;
use crate::identity::{Identity, IdentityResolver, ResolveError};
use crate::repo;
use crate::server::pipeline::{self, ChannelSink};

/// Environment variable names a client may set for the spawned git process.
/// Everything else is dropped and logged, never surfaced to the client.
pub const ALLOWED_ENV: &[&str] = &["GIT_PROTOCOL"];

/// Per-channel request state.
struct ChannelState {
    /// Feed for a running pipeline's client → stdin copy. Present only while
    /// an exec is active and the client has not sent EOF.
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    /// Whether an exec request has been serviced on this channel. A second
    /// request of any type terminates the channel.
    exec_started: bool,
}

/// Per-connection session state and protocol callbacks.
pub struct SessionHandler {
    resolver: Arc<dyn IdentityResolver>,
    repositories_path: PathBuf,
    git_bin_dir: Option<PathBuf>,
    peer_addr: Option<SocketAddr>,
    /// Assigned identity; set at most once, before any channel is accepted.
    identity: Option<Identity>,
    /// Accumulated environment sequence, in arrival order. Duplicates are
    /// kept; materialization at spawn time lets the first occurrence win.
    env: Vec<String>,
    channels: HashMap<ChannelId, ChannelState>,
    /// Cancelled on connection teardown and passed to every pipeline this
    /// session starts, so no git process outlives its connection.
    cancel: CancellationToken,
}

impl SessionHandler {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        repositories_path: PathBuf,
        git_bin_dir: Option<PathBuf>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            resolver,
            repositories_path,
            git_bin_dir,
            peer_addr,
            identity: None,
            env: Vec::new(),
            channels: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn identity_name(&self) -> &str {
        self.identity.as_ref().map_or("<unauthenticated>", |i| &i.name)
    }

    /// Reject a request on a channel and terminate the channel's request
    /// loop. Used for every post-exec request and for unsupported types.
    fn terminate_channel(&mut self, channel: ChannelId, session: &mut Session) {
        self.channels.remove(&channel);
        let _ = session.close(channel);
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // Connection teardown: propagate to in-flight git processes.
        self.cancel.cancel();
    }
}

/// Bridge from the pipeline's sink seam to a live SSH channel.
struct SshChannelSink {
    handle: russh::server::Handle,
    channel: ChannelId,
}

#[async_trait::async_trait]
impl ChannelSink for SshChannelSink {
    async fn data(&self, data: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.channel, data.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }

    async fn error_data(&self, data: &[u8]) -> io::Result<()> {
        self.handle
            .extended_data(self.channel, 1, data.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }

    async fn exit_status(&self, code: u32) {
        if let Err(e) = self.handle.exit_status_request(self.channel, code).await {
            debug!(error = ?e, "could not send exit status");
        }
    }

    async fn finish(&self) {
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

impl Handler for SessionHandler {
    type Error = Error;

    /// Authenticate a client by public-key fingerprint.
    ///
    /// Fails closed: an unknown key and a resolver transport failure both
    /// reject the attempt. They are logged differently — one is a genuinely
    /// unknown key, the other a retryable outage.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        debug!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fingerprint,
            "public-key auth attempt"
        );

        match self.resolver.resolve_by_fingerprint(&fingerprint).await {
            Ok(identity) => {
                info!(
                    peer = ?self.peer_addr,
                    identity = %identity.name,
                    fingerprint = %fingerprint,
                    "authenticated"
                );
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            Err(ResolveError::NotFound) => {
                warn!(peer = ?self.peer_addr, fingerprint = %fingerprint, "unknown public key");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
            Err(ResolveError::Transport(reason)) => {
                error!(
                    peer = ?self.peer_addr,
                    fingerprint = %fingerprint,
                    error = %reason,
                    "identity resolver unavailable"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    /// Accept `session` channels from authenticated clients.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.identity.is_none() {
            // The transport enforces auth before channels; refuse anyway.
            warn!(peer = ?self.peer_addr, "session channel before authentication");
            return Ok(false);
        }
        self.channels.insert(
            channel.id(),
            ChannelState {
                stdin: None,
                exec_started: false,
            },
        );
        Ok(true)
    }

    /// All non-`session` channel types are rejected before any request is
    /// read from them.
    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            peer = ?self.peer_addr,
            host = %host_to_connect,
            port = port_to_connect,
            "rejected direct-tcpip channel"
        );
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(peer = ?self.peer_addr, "rejected x11 channel");
        Ok(false)
    }

    /// Accumulate allow-listed environment variables in arrival order.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get(&channel) {
            Some(state) if state.exec_started => {
                warn!(identity = %self.identity_name(), "env request after exec, closing channel");
                self.terminate_channel(channel, session);
                return Ok(());
            }
            Some(_) => {}
            None => return Ok(()),
        }

        if !ALLOWED_ENV.contains(&variable_name) {
            // Dropped silently from the client's point of view.
            info!(
                peer = ?self.peer_addr,
                name = %variable_name,
                "environment variable not allowed"
            );
            return Ok(());
        }
        debug!(name = %variable_name, "accepted env request");
        self.env.push(format!("{variable_name}={variable_value}"));
        Ok(())
    }

    /// Service one exec request: sanitize, parse, check the repository, then
    /// hand off to the pipeline. The positive reply is sent only after the
    /// subprocess is confirmed started.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get(&channel) {
            Some(state) if state.exec_started => {
                warn!(identity = %self.identity_name(), "second exec on channel, closing");
                self.terminate_channel(channel, session);
                return Ok(());
            }
            Some(_) => {}
            None => return Ok(()),
        }

        let payload = command::sanitize_payload(data);
        info!(
            peer = ?self.peer_addr,
            identity = %self.identity_name(),
            payload = %payload,
            "incoming exec request"
        );

        let parsed = match command::parse(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Policy rejection: no internal detail goes back to the
                // client, the channel just closes.
                warn!(payload = %payload, error = %e, "rejected exec payload");
                let _ = session.channel_failure(channel);
                self.terminate_channel(channel, session);
                return Ok(());
            }
        };

        if !repo::repository_exists(&self.repositories_path, &parsed.repository) {
            warn!(repository = %parsed.repository, "repository not found");
            let _ = session.channel_failure(channel);
            self.terminate_channel(channel, session);
            return Ok(());
        }

        let cmd = pipeline::service_command(
            &parsed,
            &self.env,
            &self.repositories_path,
            self.git_bin_dir.as_deref(),
        );
        let sink = Arc::new(SshChannelSink {
            handle: session.handle(),
            channel,
        });

        match pipeline::start(cmd, sink, self.cancel.child_token()) {
            Ok(handle) => {
                let state = self
                    .channels
                    .get_mut(&channel)
                    .expect("channel state checked above");
                state.exec_started = true;
                state.stdin = Some(handle.stdin);
                // Reply after the subprocess is confirmed started. A failed
                // reply is logged but never aborts the running pipeline.
                if let Err(e) = session.channel_success(channel) {
                    warn!(error = %e, "could not acknowledge exec request");
                }
                debug!(
                    service = parsed.service.program(),
                    repository = %parsed.repository,
                    "pipeline started"
                );
            }
            Err(e) => {
                error!(
                    service = parsed.service.program(),
                    repository = %parsed.repository,
                    error = %e,
                    "could not start git service"
                );
                let _ = session.channel_failure(channel);
                self.terminate_channel(channel, session);
            }
        }
        Ok(())
    }

    /// Forward client bytes to the running subprocess's stdin copy.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            if let Some(stdin) = &state.stdin {
                if stdin.send(data.to_vec()).await.is_err() {
                    // Pipeline is gone; stop forwarding.
                    state.stdin = None;
                }
            }
        }
        Ok(())
    }

    /// Client EOF closes the subprocess's stdin.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    /// Interactive shells are not served.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(identity = %self.identity_name(), "unsupported request type: shell");
        let _ = session.data(channel, b"Unsupported request type.\r\n".to_vec());
        let _ = session.channel_failure(channel);
        self.terminate_channel(channel, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            identity = %self.identity_name(),
            subsystem = %name,
            "unsupported request type: subsystem"
        );
        let _ = session.data(channel, b"Unsupported request type.\r\n".to_vec());
        let _ = session.channel_failure(channel);
        self.terminate_channel(channel, session);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(identity = %self.identity_name(), "unsupported request type: pty");
        let _ = session.data(channel, b"Unsupported request type.\r\n".to_vec());
        let _ = session.channel_failure(channel);
        self.terminate_channel(channel, session);
        Ok(())
    }
}
