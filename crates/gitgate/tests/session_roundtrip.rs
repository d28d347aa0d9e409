//! End-to-end session tests over a real socket.
//!
//! A gate server is started on a loopback port and exercised with a russh
//! client: authentication accept/reject, exec dispatch against a scratch
//! bare repository, and channel policy for invalid requests.
//!
//! Tests that need a real `git-upload-pack` skip silently when no git binary
//! is installed, so the suite stays hermetic.

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;
use std::time::Duration;

use russh::client::AuthResult;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelMsg;

use gitgate::{
    AuthenticatorKey, GateConfig, GateServer, Identity, IdentityResolver, LocalDirectory,
    ResolveError,
};

struct TestClient;

impl russh::client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A resolver whose backend is permanently down.
struct OutageResolver;

#[async_trait::async_trait]
impl IdentityResolver for OutageResolver {
    async fn resolve_by_fingerprint(
        &self,
        _fingerprint: &str,
    ) -> Result<Identity, ResolveError> {
        Err(ResolveError::Transport("connection refused".to_string()))
    }
}

struct TestServer {
    port: u16,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    repositories: PathBuf,
}

/// Reserve a loopback port. Tiny bind race, fine for tests.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_server(resolver: Arc<dyn IdentityResolver>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let repositories = dir.path().join("repositories");
    std::fs::create_dir(&repositories).unwrap();

    let host_key =
        PrivateKey::random(&mut rand_core::UnwrapErr(getrandom::SysRng), Algorithm::Ed25519)
            .unwrap();
    let host_key_path = dir.path().join("host.key");
    std::fs::write(&host_key_path, host_key.to_openssh(LineEnding::LF).unwrap()).unwrap();

    let port = free_port();
    let config = GateConfig {
        listen_address: format!("127.0.0.1:{port}"),
        repositories_path: repositories.clone(),
        host_key_path,
        ..GateConfig::default()
    };
    tokio::spawn(GateServer::new(config, resolver).run());

    TestServer {
        port,
        dir,
        repositories,
    }
}

async fn connect(port: u16) -> russh::client::Handle<TestClient> {
    let config = Arc::new(russh::client::Config::default());
    for _ in 0..50 {
        match russh::client::connect(Arc::clone(&config), ("127.0.0.1", port), TestClient).await {
            Ok(handle) => return handle,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("server did not come up on port {port}");
}

fn client_key() -> (PrivateKey, String) {
    let key = PrivateKey::random(&mut rand_core::UnwrapErr(getrandom::SysRng), Algorithm::Ed25519)
        .unwrap();
    let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
    (key, fingerprint)
}

fn directory_with(fingerprint: &str) -> Arc<LocalDirectory> {
    Arc::new(LocalDirectory::with_identities(vec![Identity {
        name: "alice".to_string(),
        public_keys: vec![AuthenticatorKey {
            name: "laptop".to_string(),
            fingerprint: fingerprint.to_string(),
            public_key: String::new(),
        }],
    }]))
}

async fn authenticate(
    handle: &mut russh::client::Handle<TestClient>,
    key: PrivateKey,
) -> AuthResult {
    handle
        .authenticate_publickey("git", PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .unwrap()
}

/// `git` binary availability; upload-pack round-trips need it.
fn git_available() -> bool {
    StdCommand::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn init_bare_repository(root: &Path, name: &str) {
    let status = StdCommand::new("git")
        .args(["init", "--bare", "--quiet", name])
        .current_dir(root)
        .status()
        .unwrap();
    assert!(status.success(), "git init --bare failed");
}

/// Drain a channel until it closes, collecting both output streams and the
/// exit status.
async fn drain(channel: &mut russh::Channel<russh::client::Msg>) -> (Vec<u8>, Vec<u8>, Option<u32>) {
    let mut data = Vec::new();
    let mut error_data = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data: chunk } => data.extend_from_slice(&chunk),
            ChannelMsg::ExtendedData { data: chunk, ext: 1 } => {
                error_data.extend_from_slice(&chunk);
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    (data, error_data, exit_status)
}

#[tokio::test]
async fn unknown_key_is_rejected() {
    let server = start_server(directory_with("SHA256:somebody-else"));
    let mut handle = connect(server.port).await;
    let (key, _) = client_key();
    let result = authenticate(&mut handle, key).await;
    assert!(
        !matches!(result, AuthResult::Success),
        "unknown fingerprint must not authenticate"
    );
}

#[tokio::test]
async fn resolver_outage_fails_closed() {
    let server = start_server(Arc::new(OutageResolver));
    let mut handle = connect(server.port).await;
    let (key, _) = client_key();
    let result = authenticate(&mut handle, key).await;
    assert!(
        !matches!(result, AuthResult::Success),
        "transport failure must reject authentication"
    );
}

#[tokio::test]
async fn known_key_runs_upload_pack() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let (key, fingerprint) = client_key();
    let server = start_server(directory_with(&fingerprint));
    init_bare_repository(&server.repositories, "project.git");

    let mut handle = connect(server.port).await;
    let result = authenticate(&mut handle, key).await;
    assert!(matches!(result, AuthResult::Success));

    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .exec(true, "git-upload-pack 'project.git'")
        .await
        .unwrap();
    // A flush-pkt ends the negotiation; upload-pack exits cleanly.
    channel.data(&b"0000"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let (data, _error_data, exit_status) = drain(&mut channel).await;
    // The ref advertisement is pkt-line framed and ends with a flush-pkt.
    assert!(!data.is_empty(), "expected a ref advertisement");
    assert!(data.ends_with(b"0000"), "advertisement must end with a flush-pkt");
    assert_eq!(exit_status, Some(0));
}

#[tokio::test]
async fn leading_slash_is_relative_to_repository_root() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let (key, fingerprint) = client_key();
    let server = start_server(directory_with(&fingerprint));
    init_bare_repository(&server.repositories, "rooted.git");

    let mut handle = connect(server.port).await;
    assert!(matches!(authenticate(&mut handle, key).await, AuthResult::Success));

    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .exec(true, "git-upload-pack '/rooted.git'")
        .await
        .unwrap();
    channel.data(&b"0000"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let (data, _, exit_status) = drain(&mut channel).await;
    assert!(!data.is_empty());
    assert_eq!(exit_status, Some(0));
}

#[tokio::test]
async fn missing_repository_closes_channel_without_output() {
    let (key, fingerprint) = client_key();
    let server = start_server(directory_with(&fingerprint));

    let mut handle = connect(server.port).await;
    assert!(matches!(authenticate(&mut handle, key).await, AuthResult::Success));

    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .exec(true, "git-upload-pack 'missing.git'")
        .await
        .unwrap();

    let (data, error_data, exit_status) = drain(&mut channel).await;
    assert!(data.is_empty(), "no repository detail may leak to the client");
    assert!(error_data.is_empty());
    assert_eq!(exit_status, None, "no process was started");
}

#[tokio::test]
async fn arbitrary_commands_are_rejected() {
    let (key, fingerprint) = client_key();
    let server = start_server(directory_with(&fingerprint));

    let mut handle = connect(server.port).await;
    assert!(matches!(authenticate(&mut handle, key).await, AuthResult::Success));

    for payload in [
        "rm -rf /",
        "git-upload-pack '../../etc'",
        "git-upload-pack ; touch /tmp/pwned",
    ] {
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.exec(true, payload).await.unwrap();
        let (data, error_data, exit_status) = drain(&mut channel).await;
        assert!(data.is_empty(), "rejected payload produced output: {payload}");
        assert!(error_data.is_empty());
        assert_eq!(exit_status, None);
    }
}

#[tokio::test]
async fn shell_requests_are_refused() {
    let (key, fingerprint) = client_key();
    let server = start_server(directory_with(&fingerprint));

    let mut handle = connect(server.port).await;
    assert!(matches!(authenticate(&mut handle, key).await, AuthResult::Success));

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();
    let (data, _, exit_status) = drain(&mut channel).await;
    assert_eq!(data.as_slice(), b"Unsupported request type.\r\n");
    assert_eq!(exit_status, None);
}

#[tokio::test]
async fn second_exec_on_a_channel_terminates_it() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let (key, fingerprint) = client_key();
    let server = start_server(directory_with(&fingerprint));
    init_bare_repository(&server.repositories, "one.git");

    let mut handle = connect(server.port).await;
    assert!(matches!(authenticate(&mut handle, key).await, AuthResult::Success));

    let mut channel = handle.channel_open_session().await.unwrap();
    // First exec: upload-pack starts and waits for negotiation input.
    channel.exec(true, "git-upload-pack 'one.git'").await.unwrap();
    // Second request on the same channel must terminate it instead of
    // spawning another process.
    channel.exec(true, "git-upload-pack 'one.git'").await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            if matches!(msg, ChannelMsg::Close) {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "channel must close after a second exec");
}
