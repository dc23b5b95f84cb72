//! Directory layout under the exchange base.
//!
//! The broker owns seven well-known subdirectories. They are created on
//! start if missing and never deleted; external observers rely on the names
//! staying stable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Subdirectory for client-authored request documents.
pub const REQUESTS_DIR: &str = "requests";
/// Subdirectory for broker-authored response documents.
pub const RESPONSES_DIR: &str = "responses";
/// Subdirectory holding in-flight claims.
pub const PROCESSING_DIR: &str = "processing";
/// Subdirectory mirroring terminal failures for post-mortem.
pub const FAILED_DIR: &str = "failed";
/// Subdirectory for append-only text logs.
pub const LOGS_DIR: &str = "logs";
/// Subdirectory for broker-durable state (state map, lock records).
pub const STATE_DIR: &str = "state";
/// Subdirectory for advisory configuration snapshots.
pub const CONFIG_DIR: &str = "config";

/// Filename of the durable processing-state map inside [`STATE_DIR`].
pub const STATE_FILE_NAME: &str = "processing_state.json";

/// Filename of the advisory snapshot inside [`CONFIG_DIR`].
pub const SNAPSHOT_FILE_NAME: &str = "current_state.json";

/// Resolved paths for the exchange tree. Cheap to clone; the single source
/// of truth for where documents live.
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    /// Creates a layout rooted at `base` without touching the filesystem.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Creates any missing subdirectory. Existing directories are left
    /// untouched.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.requests(),
            self.responses(),
            self.processing(),
            self.failed(),
            self.logs(),
            self.state(),
            self.config(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// The base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `requests/` directory.
    #[must_use]
    pub fn requests(&self) -> PathBuf {
        self.base.join(REQUESTS_DIR)
    }

    /// `responses/` directory.
    #[must_use]
    pub fn responses(&self) -> PathBuf {
        self.base.join(RESPONSES_DIR)
    }

    /// `processing/` directory.
    #[must_use]
    pub fn processing(&self) -> PathBuf {
        self.base.join(PROCESSING_DIR)
    }

    /// `failed/` directory.
    #[must_use]
    pub fn failed(&self) -> PathBuf {
        self.base.join(FAILED_DIR)
    }

    /// `logs/` directory.
    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.base.join(LOGS_DIR)
    }

    /// `state/` directory.
    #[must_use]
    pub fn state(&self) -> PathBuf {
        self.base.join(STATE_DIR)
    }

    /// `config/` directory.
    #[must_use]
    pub fn config(&self) -> PathBuf {
        self.base.join(CONFIG_DIR)
    }

    /// Path of a request document for `id`.
    #[must_use]
    pub fn request_file(&self, id: &str) -> PathBuf {
        self.requests().join(format!("{id}.json"))
    }

    /// Path of an in-flight claim for `id`.
    #[must_use]
    pub fn processing_file(&self, id: &str) -> PathBuf {
        self.processing().join(format!("{id}.json"))
    }

    /// Path of a response document for `id` (after prefix stripping).
    #[must_use]
    pub fn response_file(&self, id: &str) -> PathBuf {
        self.responses().join(format!("{id}.json"))
    }

    /// Path of a failure mirror for `id`.
    #[must_use]
    pub fn failed_file(&self, id: &str) -> PathBuf {
        self.failed().join(format!("{id}.json"))
    }

    /// Path of the per-request attempt log for `id`.
    #[must_use]
    pub fn request_log_file(&self, id: &str) -> PathBuf {
        self.logs().join(format!("{id}.log"))
    }

    /// Path of the durable processing-state map.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state().join(STATE_FILE_NAME)
    }

    /// Path of the workspace lock record for `workspace_id`.
    #[must_use]
    pub fn lock_file(&self, workspace_id: &str) -> PathBuf {
        self.state().join(format!("ws.{workspace_id}.lock"))
    }

    /// Path of the advisory snapshot.
    #[must_use]
    pub fn snapshot_file(&self) -> PathBuf {
        self.config().join(SNAPSHOT_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_all_subdirectories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path().join("exchange"));
        layout.ensure().expect("ensure");

        for sub in [
            REQUESTS_DIR,
            RESPONSES_DIR,
            PROCESSING_DIR,
            FAILED_DIR,
            LOGS_DIR,
            STATE_DIR,
            CONFIG_DIR,
        ] {
            assert!(dir.path().join("exchange").join(sub).is_dir(), "{sub}");
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        layout.ensure().expect("first");
        layout.ensure().expect("second");
    }

    #[test]
    fn file_paths_derive_from_id() {
        let layout = Layout::new("/tmp/exchange");
        assert_eq!(
            layout.request_file("r1"),
            PathBuf::from("/tmp/exchange/requests/r1.json")
        );
        assert_eq!(
            layout.lock_file("abc123"),
            PathBuf::from("/tmp/exchange/state/ws.abc123.lock")
        );
    }
}
