//! Gitgate - SSH gatekeeper for git repositories
//!
//! Gitgate sits between untrusted network clients and local git
//! subprocesses. Each connection is authenticated by public-key fingerprint
//! (resolved locally or via a mutual-TLS call to an admin API), the
//! requested command and repository path are validated against injection and
//! traversal, and the client's byte streams are proxied to a spawned git
//! service process for the duration of the operation.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gitgate::{GateConfig, GateServer, LocalDirectory};
//!
//! #[tokio::main]
//! async fn main() -> gitgate::Result<()> {
//!     let config = GateConfig::default();
//!     let resolver = Arc::new(LocalDirectory::new());
//!     GateServer::new(config, resolver).run().await
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod repo;
pub mod server;

pub use command::{GitCommand, ServiceKind};
pub use config::{GateConfig, ResolverConfig};
pub use error::{Error, Result};
pub use identity::{
    AuthenticatorKey, Identity, IdentityResolver, LocalDirectory, RemoteDirectory,
    RemoteDirectoryConfig, ResolveError,
};
pub use server::GateServer;
