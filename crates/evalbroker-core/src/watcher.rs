//! Observation of the `requests/` directory.
//!
//! Filesystem events are hints, not truths: the watcher only forwards
//! candidate paths; the lifecycle engine re-checks existence after a settle
//! delay and owns all duplicate suppression. On Linux the watcher is an
//! inotify thread; elsewhere (or when inotify cannot be initialized) it
//! degrades to a bounded polling loop. In both modes the broker enumerates
//! `requests/` once at startup so documents written while it was down are
//! picked up.
//!
//! The watcher never blocks on dispatch: candidates are pushed into an
//! unbounded channel and scheduling happens on the engine's worker pool.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::layout::Layout;

/// How the watcher is observing the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherMode {
    /// Kernel-notified (inotify).
    Native,
    /// Bounded polling fallback.
    Polling,
}

/// A running watcher thread.
#[derive(Debug)]
pub struct RequestWatcher {
    mode: WatcherMode,
}

impl RequestWatcher {
    /// Starts watching `requests/` and forwarding candidate paths to `tx`.
    ///
    /// Prefers the native watch; any initialization failure falls back to
    /// polling at the configured interval. The background thread stops
    /// forwarding once `shutdown` is cancelled; a native thread parked in a
    /// blocking read is detached and exits with the process.
    #[must_use]
    pub fn spawn(
        layout: &Layout,
        config: &BrokerConfig,
        tx: UnboundedSender<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        let requests_dir = layout.requests();

        match spawn_native(&requests_dir, tx.clone(), shutdown.clone()) {
            Ok(()) => {
                info!("request watcher running in native mode");
                Self {
                    mode: WatcherMode::Native,
                }
            },
            Err(reason) => {
                warn!(
                    reason = %reason,
                    interval_ms = config.polling_interval_ms,
                    "native watch unavailable; falling back to polling"
                );
                spawn_polling(
                    requests_dir,
                    Duration::from_millis(config.polling_interval_ms),
                    tx,
                    shutdown,
                );
                Self {
                    mode: WatcherMode::Polling,
                }
            },
        }
    }

    /// The active observation mode.
    #[must_use]
    pub const fn mode(&self) -> WatcherMode {
        self.mode
    }

    /// Enumerates existing request documents and forwards each candidate.
    ///
    /// Called once at startup; also used by the maintenance rescan as a
    /// safety net for events lost to watcher degradation.
    pub fn enumerate(layout: &Layout, tx: &UnboundedSender<PathBuf>) -> usize {
        let mut forwarded = 0;
        for path in scan_candidates(&layout.requests()) {
            if tx.send(path).is_ok() {
                forwarded += 1;
            }
        }
        forwarded
    }
}

/// Lists `.json` regular files in `dir`, sorted by name for deterministic
/// startup ordering.
fn scan_candidates(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_candidate(path))
        .collect();
    candidates.sort();
    candidates
}

fn is_candidate(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return false;
    }
    // Reject symlinks, FIFOs, and directories named *.json outright.
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn spawn_native(
    requests_dir: &Path,
    tx: UnboundedSender<PathBuf>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let mask = AddWatchFlags::IN_CREATE | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO;
    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)
        .map_err(|e| format!("inotify init failed: {e}"))?;
    inotify
        .add_watch(requests_dir, mask)
        .map_err(|e| format!("inotify add watch failed: {e}"))?;

    let dir = requests_dir.to_path_buf();
    std::thread::Builder::new()
        .name("evalbroker-watch".to_string())
        .spawn(move || {
            loop {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "inotify read failed; watcher thread exiting");
                        return;
                    },
                };
                if shutdown.is_cancelled() {
                    return;
                }

                let mut overflowed = false;
                for event in events {
                    if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        overflowed = true;
                        continue;
                    }
                    let Some(name) = event.name else { continue };
                    let path = dir.join(&name);
                    if is_candidate(&path) && tx.send(path).is_err() {
                        return;
                    }
                }

                if overflowed {
                    // Events were lost; fall back to a full enumeration so
                    // nothing is missed.
                    warn!("inotify queue overflow; rescanning requests directory");
                    for path in scan_candidates(&dir) {
                        if tx.send(path).is_err() {
                            return;
                        }
                    }
                }
            }
        })
        .map_err(|e| format!("watch thread spawn failed: {e}"))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn spawn_native(
    _requests_dir: &Path,
    _tx: UnboundedSender<PathBuf>,
    _shutdown: CancellationToken,
) -> Result<(), String> {
    Err("native filesystem watch is only wired up on Linux".to_string())
}

fn spawn_polling(
    requests_dir: PathBuf,
    interval: Duration,
    tx: UnboundedSender<PathBuf>,
    shutdown: CancellationToken,
) {
    let spawned = std::thread::Builder::new()
        .name("evalbroker-poll".to_string())
        .spawn(move || {
            let mut previous: HashSet<OsString> = HashSet::new();
            while !shutdown.is_cancelled() {
                let candidates = scan_candidates(&requests_dir);
                let current: HashSet<OsString> = candidates
                    .iter()
                    .filter_map(|path| path.file_name().map(OsString::from))
                    .collect();

                for path in candidates {
                    let Some(name) = path.file_name().map(OsString::from) else {
                        continue;
                    };
                    // Only newly-appeared names are forwarded; a file still
                    // sitting in the directory was already handed over and
                    // the maintenance rescan covers stragglers.
                    if !previous.contains(&name) && tx.send(path).is_err() {
                        return;
                    }
                }
                previous = current;
                std::thread::sleep(interval);
            }
            debug!("polling watcher stopped");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "poll thread spawn failed; relying on maintenance rescan");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_lists_only_json_regular_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.json"), b"{}").expect("write");
        std::fs::write(dir.path().join("b.txt"), b"x").expect("write");
        std::fs::create_dir(dir.path().join("c.json")).expect("mkdir");

        let found = scan_candidates(dir.path());
        assert_eq!(found, vec![dir.path().join("a.json")]);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(scan_candidates(&missing).is_empty());
    }

    #[tokio::test]
    async fn enumerate_forwards_existing_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        layout.ensure().expect("ensure");
        std::fs::write(layout.requests().join("r1.json"), b"{}").expect("write");
        std::fs::write(layout.requests().join("r2.json"), b"{}").expect("write");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let forwarded = RequestWatcher::enumerate(&layout, &tx);
        assert_eq!(forwarded, 2);
        assert_eq!(rx.recv().await, Some(layout.requests().join("r1.json")));
        assert_eq!(rx.recv().await, Some(layout.requests().join("r2.json")));
    }

    #[tokio::test]
    async fn polling_watcher_reports_new_files_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        layout.ensure().expect("ensure");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        spawn_polling(
            layout.requests(),
            Duration::from_millis(20),
            tx,
            shutdown.clone(),
        );

        std::fs::write(layout.requests().join("r1.json"), b"{}").expect("write");
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timely")
            .expect("path");
        assert_eq!(received, layout.requests().join("r1.json"));

        // The same untouched file is not re-forwarded on the next tick.
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(quiet.is_err(), "no duplicate forwarding expected");
        shutdown.cancel();
    }
}
