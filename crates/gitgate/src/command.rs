//! Exec payload parsing and validation.
//!
//! A pure function from the raw exec request payload to a validated
//! [`GitCommand`], with no I/O and no state. This is the sole defense against
//! path traversal and argument injection: the repository path is later passed
//! as a literal subprocess argument, never through a shell, so everything
//! rides on the charset and `..` checks here.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// The three git services a client may request over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl ServiceKind {
    /// The program name spawned for this service (also the wire token).
    pub fn program(self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "git-upload-pack",
            ServiceKind::UploadArchive => "git-upload-archive",
            ServiceKind::ReceivePack => "git-receive-pack",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "git-upload-pack" => Some(ServiceKind::UploadPack),
            "git-upload-archive" => Some(ServiceKind::UploadArchive),
            "git-receive-pack" => Some(ServiceKind::ReceivePack),
            _ => None,
        }
    }
}

/// A validated git command. Constructed once per exec request; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    /// Which git service to spawn.
    pub service: ServiceKind,
    /// Repository path relative to the repository root. Guaranteed to match
    /// the allowed charset and to contain no `..`.
    pub repository: String,
    /// The raw payload as received, kept for logging.
    pub original: String,
}

static REPOSITORY_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("valid repository path regex"));

/// Whitespace for the purposes of command splitting. `0x05` is treated as
/// whitespace for compatibility with the upstream client payload format.
fn is_command_space(c: char) -> bool {
    c.is_whitespace() || c == '\u{0005}'
}

/// Split the payload into the command token and the remainder on the first
/// whitespace-class character. Returns `None` when there is no split point.
fn split_on_space(s: &str) -> Option<(&str, &str)> {
    // The split character itself is consumed; it may be multi-byte
    // (is_whitespace covers Unicode spaces), so advance by its UTF-8 length.
    let (idx, c) = s.char_indices().find(|&(_, c)| is_command_space(c))?;
    Some((&s[..idx], &s[idx + c.len_utf8()..]))
}

/// Extract the repository argument: the substring between the first and
/// second single quotes, with one leading path separator stripped (clients
/// send an absolute-looking path that is actually relative to the root).
fn quoted_repository(s: &str) -> Option<&str> {
    let start = s.find('\'')?;
    let rest = &s[start + 1..];
    let end = rest.find('\'')?;
    let repository = &rest[..end];
    Some(repository.strip_prefix('/').unwrap_or(repository))
}

fn valid_repository_path(s: &str) -> bool {
    REPOSITORY_PATH.is_match(s) && !s.contains("..")
}

/// Recover the command string from an exec request payload.
///
/// Strips embedded NUL bytes entirely, then trims leading bytes up to the
/// first alphabetic character. This removes protocol framing noise that some
/// clients leave in front of the command.
pub fn sanitize_payload(payload: &[u8]) -> String {
    let text: String = String::from_utf8_lossy(payload)
        .chars()
        .filter(|c| *c != '\0')
        .collect();
    match text.find(|c: char| c.is_alphabetic()) {
        Some(idx) => text[idx..].to_string(),
        None => text,
    }
}

/// Parse a raw exec payload into a validated [`GitCommand`].
///
/// Error kinds are distinguishable so the session can decide how to log and
/// whether to reply:
/// - [`Error::InvalidGitCommand`]: missing repository argument or quoting
/// - [`Error::UnsupportedCommand`]: command token is not a git service
/// - [`Error::InvalidRepositoryPath`]: charset violation or `..`
pub fn parse(raw: &str) -> Result<GitCommand> {
    let (token, remainder) = split_on_space(raw).ok_or(Error::InvalidGitCommand)?;

    let service = ServiceKind::from_token(token).ok_or(Error::UnsupportedCommand)?;

    let repository = quoted_repository(remainder).ok_or(Error::InvalidGitCommand)?;

    if !valid_repository_path(repository) {
        return Err(Error::InvalidRepositoryPath);
    }

    Ok(GitCommand {
        service,
        repository: repository.to_string(),
        original: raw.to_string(),
    })
}
