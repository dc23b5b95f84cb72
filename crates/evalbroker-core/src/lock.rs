//! Workspace-scoped singleton lock.
//!
//! At most one broker may be active per workspace: two brokers driving the
//! same dispatcher would corrupt request ordering. The lock is a file at
//! `state/ws.<workspace_id>.lock` whose contents are the owning process id.
//! Liveness is probed with a signal-0 `kill`; a lock held by a dead process
//! is taken over. A background heartbeat rewrites the pid on an interval,
//! both proving liveness and letting a restarted incarnation with the same
//! pid reclaim its own lock as a no-op.
//!
//! Acquisition I/O errors are fatal: the broker must not activate without
//! holding the lock. Heartbeat I/O errors are logged and tolerated.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs_safe::{self, FsError};
use crate::layout::Layout;

/// Maximum size of a lock record. The content is one pid in decimal.
const MAX_LOCK_FILE_SIZE: u64 = 64;

/// Errors from lock acquisition and release.
#[derive(Debug, Error)]
pub enum LockError {
    /// Filesystem failure while acquiring or releasing.
    #[error("lock I/O error: {context}: {source}")]
    Io {
        /// Description of the failing operation.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Atomic write of the lock record failed.
    #[error("lock write failed: {0}")]
    Write(#[from] FsError),
}

impl LockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This process now owns the workspace lock.
    Acquired,
    /// Another live process owns the lock.
    Denied {
        /// Pid recorded in the lock file.
        owner_pid: u32,
    },
}

/// Manages the singleton lock for one workspace.
#[derive(Debug)]
pub struct LockManager {
    lock_path: PathBuf,
    workspace_id: String,
    held: AtomicBool,
}

impl LockManager {
    /// Creates a manager for `workspace_id` under the exchange layout.
    #[must_use]
    pub fn new(layout: &Layout, workspace_id: impl Into<String>) -> Self {
        let workspace_id = workspace_id.into();
        Self {
            lock_path: layout.lock_file(&workspace_id),
            workspace_id,
            held: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the workspace lock.
    ///
    /// If the lock file names a dead process, the stale record is removed
    /// and acquisition is retried once.
    pub fn acquire(&self) -> Result<AcquireOutcome, LockError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LockError::io("create state directory", e))?;
        }

        for takeover in [false, true] {
            match self.read_owner()? {
                None => {
                    self.write_pid()?;
                    self.held.store(true, Ordering::SeqCst);
                    info!(
                        workspace_id = %self.workspace_id,
                        pid = std::process::id(),
                        "workspace lock acquired"
                    );
                    return Ok(AcquireOutcome::Acquired);
                },
                Some(owner_pid) if owner_pid == std::process::id() => {
                    // Our own record from a previous incarnation with the
                    // same pid; overwriting is a no-op.
                    self.write_pid()?;
                    self.held.store(true, Ordering::SeqCst);
                    return Ok(AcquireOutcome::Acquired);
                },
                Some(owner_pid) if is_pid_alive(owner_pid) => {
                    return Ok(AcquireOutcome::Denied { owner_pid });
                },
                Some(owner_pid) => {
                    if takeover {
                        // A second stale owner appearing within one
                        // acquisition is a race we refuse to chase.
                        return Ok(AcquireOutcome::Denied { owner_pid });
                    }
                    info!(
                        workspace_id = %self.workspace_id,
                        stale_pid = owner_pid,
                        "taking over lock from dead process"
                    );
                    std::fs::remove_file(&self.lock_path)
                        .map_err(|e| LockError::io("remove stale lock", e))?;
                },
            }
        }

        unreachable!("acquisition loop always returns within two passes")
    }

    /// Refreshes the lock record with the current pid.
    ///
    /// Called from the heartbeat task. Errors are surfaced so the caller
    /// can log them; they are not fatal.
    pub fn refresh(&self) -> Result<(), LockError> {
        if !self.held.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.write_pid()?;
        debug!(workspace_id = %self.workspace_id, "lock heartbeat refreshed");
        Ok(())
    }

    /// Releases the lock if this process still owns it. Idempotent.
    pub fn release(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.read_owner() {
            Ok(Some(owner_pid)) if owner_pid == std::process::id() => {
                if let Err(e) = std::fs::remove_file(&self.lock_path) {
                    warn!(error = %e, "failed to remove lock file on release");
                } else {
                    info!(workspace_id = %self.workspace_id, "workspace lock released");
                }
            },
            Ok(Some(owner_pid)) => {
                warn!(
                    owner_pid,
                    "lock no longer names this process; leaving it in place"
                );
            },
            Ok(None) => {},
            Err(e) => warn!(error = %e, "failed to read lock file on release"),
        }
    }

    /// Reads the pid recorded in the lock file.
    ///
    /// Unparseable content is treated as a stale record from a dead owner.
    pub fn read_owner(&self) -> Result<Option<u32>, LockError> {
        if !self.lock_path.exists() {
            return Ok(None);
        }
        let bytes = match fs_safe::bounded_read(&self.lock_path, MAX_LOCK_FILE_SIZE) {
            Ok(bytes) => bytes,
            Err(FsError::FileTooLarge { .. } | FsError::Deserialize(_)) => Vec::new(),
            Err(FsError::Io { context, source }) => {
                if source.kind() == io::ErrorKind::NotFound {
                    return Ok(None);
                }
                return Err(LockError::Io { context, source });
            },
            Err(_) => Vec::new(),
        };
        let text = String::from_utf8_lossy(&bytes);
        match text.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                warn!(
                    path = %self.lock_path.display(),
                    "lock file content unparseable; treating as stale"
                );
                Ok(Some(0))
            },
        }
    }

    fn write_pid(&self) -> Result<(), LockError> {
        let pid = std::process::id().to_string();
        fs_safe::atomic_write(&self.lock_path, pid.as_bytes())?;
        Ok(())
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release();
    }
}

/// Probes whether `pid` is a live process.
///
/// Pid 0 (the unparseable-record sentinel) is always dead. `EPERM` means
/// the process exists but belongs to another user, so it counts as alive.
#[must_use]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: kill(pid, 0) is a standard POSIX existence probe; it
        // delivers no signal and cannot cause undefined behavior. pid_t is
        // i32 and valid Linux pids fit well within range.
        #[allow(unsafe_code, clippy::cast_possible_wrap)]
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        // Without a liveness probe, assume alive: never falsely take over.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> LockManager {
        let layout = Layout::new(dir.path());
        layout.ensure().expect("ensure");
        LockManager::new(&layout, "wsid")
    }

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        assert_eq!(lock.acquire().expect("acquire"), AcquireOutcome::Acquired);

        let content = std::fs::read_to_string(dir.path().join("state/ws.wsid.lock"))
            .expect("read lock");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn live_owner_is_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        // Pid 1 (init) is always alive and is not this process.
        std::fs::write(dir.path().join("state/ws.wsid.lock"), "1").expect("seed lock");

        assert_eq!(
            lock.acquire().expect("acquire"),
            AcquireOutcome::Denied { owner_pid: 1 }
        );
        // The lock file still names the owner.
        let content =
            std::fs::read_to_string(dir.path().join("state/ws.wsid.lock")).expect("read");
        assert_eq!(content.trim(), "1");
    }

    #[test]
    fn dead_owner_is_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        // A pid from the non-reachable range on Linux (max pid is < 2^22).
        std::fs::write(dir.path().join("state/ws.wsid.lock"), "4194000").expect("seed lock");

        assert_eq!(lock.acquire().expect("acquire"), AcquireOutcome::Acquired);
        let content =
            std::fs::read_to_string(dir.path().join("state/ws.wsid.lock")).expect("read");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn garbage_lock_content_is_treated_as_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        std::fs::write(dir.path().join("state/ws.wsid.lock"), "not-a-pid").expect("seed lock");

        assert_eq!(lock.acquire().expect("acquire"), AcquireOutcome::Acquired);
    }

    #[test]
    fn release_is_idempotent_and_scoped_to_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        lock.acquire().expect("acquire");
        lock.release();
        assert!(!dir.path().join("state/ws.wsid.lock").exists());
        // Second release is a no-op.
        lock.release();
    }

    #[test]
    fn release_leaves_foreign_lock_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        lock.acquire().expect("acquire");
        // Another process overwrote the record in the meantime.
        std::fs::write(dir.path().join("state/ws.wsid.lock"), "1").expect("overwrite");
        lock.release();
        assert!(dir.path().join("state/ws.wsid.lock").exists());
    }

    #[test]
    fn refresh_rewrites_pid_only_while_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = manager(&dir);
        // Not held yet: refresh is a no-op.
        lock.refresh().expect("refresh");
        assert!(!dir.path().join("state/ws.wsid.lock").exists());

        lock.acquire().expect("acquire");
        std::fs::remove_file(dir.path().join("state/ws.wsid.lock")).expect("remove");
        lock.refresh().expect("refresh");
        assert!(dir.path().join("state/ws.wsid.lock").exists());
    }
}
