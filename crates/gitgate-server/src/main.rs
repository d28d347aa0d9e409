//! Gitgate server - SSH gatekeeper for git repositories
//!
//! Usage:
//!   gitgate-server --config gitgate.json
//!   gitgate-server --listen 0.0.0.0:2222 --repositories /srv/git --host-key /etc/gitgate/host.key

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use gitgate::{
    GateConfig, GateServer, IdentityResolver, LocalDirectory, RemoteDirectory,
    RemoteDirectoryConfig, ResolverConfig,
};

/// Gitgate - SSH gatekeeper for git repositories
#[derive(Parser, Debug)]
#[command(name = "gitgate-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the SSH listener binds to (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Root path under which repositories live (overrides the config file)
    #[arg(long)]
    repositories: Option<PathBuf>,

    /// Path to the PEM-encoded SSH host key (overrides the config file)
    #[arg(long)]
    host_key: Option<PathBuf>,
}

fn build_resolver(config: &ResolverConfig) -> Result<Arc<dyn IdentityResolver>> {
    match config {
        ResolverConfig::Local { identities_path } => {
            let directory = match identities_path {
                Some(path) => LocalDirectory::load(path)
                    .with_context(|| format!("failed to load identities: {}", path.display()))?,
                None => LocalDirectory::new(),
            };
            Ok(Arc::new(directory))
        }
        ResolverConfig::Remote {
            address,
            client_cert_path,
            client_key_path,
            ca_path,
            insecure_skip_verify,
        } => {
            let directory = RemoteDirectory::new(&RemoteDirectoryConfig {
                address: address.clone(),
                client_cert_path: client_cert_path.clone(),
                client_key_path: client_key_path.clone(),
                ca_path: ca_path.clone(),
                insecure_skip_verify: *insecure_skip_verify,
            })
            .context("failed to build admin api client")?;
            Ok(Arc::new(directory))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GateConfig::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => GateConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    if let Some(repositories) = args.repositories {
        config.repositories_path = repositories;
    }
    if let Some(host_key) = args.host_key {
        config.host_key_path = host_key;
    }

    info!("starting git server");
    let resolver = build_resolver(&config.resolver)?;
    GateServer::new(config, resolver)
        .run()
        .await
        .context("git server failed")?;

    info!("shutting the server down");
    Ok(())
}
