//! Repository existence check.
//!
//! The session never manipulates repository contents itself; everything
//! beyond this predicate is delegated to the spawned git tooling, including
//! file-level locking across concurrent sessions.

use std::path::Path;

/// Marker file whose presence identifies a git repository directory.
const GIT_DIR_MARKER: &str = "HEAD";

/// Whether a repository named `repository` exists under `root`.
///
/// `repository` must already have passed [`crate::command::parse`] validation,
/// so joining it cannot escape the root.
pub fn repository_exists(root: &Path, repository: &str) -> bool {
    root.join(repository).join(GIT_DIR_MARKER).is_file()
}
