//! Error types for Gitgate
//!
//! This module provides error types for the session engine with the following
//! design goals:
//! - Clear categorization for programmatic handling (the session loop decides
//!   between log-and-drop and reply-and-close based on the kind)
//! - No leakage of sensitive information to clients (filesystem layout,
//!   internal addresses, resolver transport detail)

use thiserror::Error;

/// Result type alias using Gitgate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Gitgate error types.
///
/// Messages are safe to surface on the wire; server-side detail belongs in
/// log fields, not in the error text.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad protocol framing on an incoming request. Logged and dropped;
    /// other channels keep being served.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The exec command token is not one of the recognized git services.
    #[error("command is not a git command")]
    UnsupportedCommand,

    /// The exec payload is not a well-formed git command (missing repository
    /// argument or quoting).
    #[error("invalid git command")]
    InvalidGitCommand,

    /// The repository path failed validation (charset or traversal).
    #[error("repository path is not valid")]
    InvalidRepositoryPath,

    /// The resolver could not bind an identity to the offered key.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The validated repository does not exist under the repository root.
    /// Deliberately generic: no filesystem detail reaches the client.
    #[error("repository not found")]
    RepositoryNotFound,

    /// The git subprocess could not be started.
    #[error("failed to start git service: {0}")]
    ProcessSpawn(std::io::Error),

    /// A subprocess pipe could not be acquired or failed mid-copy.
    #[error("pipe failure: {0}")]
    Pipe(std::io::Error),

    /// I/O error outside the subprocess pipeline.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
