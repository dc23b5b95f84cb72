//! Workspace identity.
//!
//! The singleton lock is scoped per workspace so two editor windows on
//! different workspaces can both run brokers against the same base
//! directory. The identifier is the MD5 hex digest of the absolute
//! workspace root path; the digest algorithm is part of the on-disk
//! contract (clients compute the same name when probing the lock).

use std::path::Path;

use md5::{Digest, Md5};

/// Derives the stable workspace identifier for `root`.
///
/// Relative paths are resolved against the current directory first so the
/// identifier does not depend on the caller's working directory. A path that
/// cannot be canonicalized (for example, not yet created) is hashed as
/// given.
#[must_use]
pub fn workspace_id(root: &Path) -> String {
    let absolute = root
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default().join(root));
    let mut hasher = Md5::new();
    hasher.update(absolute.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Computes the MD5 hex digest of arbitrary text.
///
/// Clients attach this digest of the prompt text as an optional integrity
/// checksum on `submitPrompt` requests.
#[must_use]
pub fn md5_hex(text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
