//! Crash recovery of in-flight requests.
//!
//! Runs once at startup, after lock acquisition and state-store load. A
//! claim left in `processing/` by a previous incarnation is either resumed
//! (the dispatch is simply retried) or, when it has been idle past the
//! stuck threshold, force-failed with a recovery reason so the client stops
//! waiting. Requests that arrived while the broker was down are handed to
//! the engine as if a watcher event had fired.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::clock;
use crate::config::BrokerConfig;
use crate::engine::LifecycleEngine;
use crate::layout::Layout;
use crate::response::{FinalStatus, Response, ResponseWriter};
use crate::state_store::{ProcessingStatus, StateStore};
use crate::watcher;

/// Failure reason recorded when recovery abandons a stuck claim.
pub const REASON_RECOVERY_TIMEOUT: &str = "processing timeout during recovery";

/// Summary of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Claims resumed through the engine.
    pub resumed: usize,
    /// Claims force-failed as stuck.
    pub force_failed: usize,
    /// Request documents re-enqueued from `requests/`.
    pub reenqueued: usize,
}

/// Runs the startup recovery pass.
pub fn recover(
    layout: &Layout,
    config: &BrokerConfig,
    store: &Arc<StateStore>,
    engine: &Arc<LifecycleEngine>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let writer = ResponseWriter::new(layout.clone());

    for path in claimed_files(layout) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };

        let stuck = store.get(&stem).is_some_and(|state| {
            state.status == ProcessingStatus::Processing
                && clock::age_secs(Utc::now(), state.last_update) > config.stuck_threshold_secs
        });

        if stuck {
            force_fail_claimed(store, &writer, &stem, &path, REASON_RECOVERY_TIMEOUT);
            report.force_failed += 1;
        } else {
            Arc::clone(engine).resume_claimed(path);
            report.resumed += 1;
        }
    }

    report.reenqueued = enqueue_pending(layout, engine);

    info!(
        resumed = report.resumed,
        force_failed = report.force_failed,
        reenqueued = report.reenqueued,
        "crash recovery pass complete"
    );
    report
}

/// Hands every document already in `requests/` to the engine.
pub fn enqueue_pending(layout: &Layout, engine: &Arc<LifecycleEngine>) -> usize {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let count = watcher::RequestWatcher::enumerate(layout, &tx);
    drop(tx);
    while let Ok(path) = rx.try_recv() {
        Arc::clone(engine).submit(path);
    }
    count
}

/// Terminal failure for a claim the broker will not resume.
///
/// Publishes a `failed` response (empty attempt log: the dispatch outcome
/// of the previous incarnation is unknown), mirrors it into `failed/`, and
/// removes the claim file. Shared by recovery and the maintenance loop.
pub fn force_fail_claimed(
    store: &Arc<StateStore>,
    writer: &ResponseWriter,
    id: &str,
    claimed: &Path,
    reason: &str,
) {
    warn!(request_id = %id, reason, "force-failing stuck in-flight request");
    let now = Utc::now();
    let request_timestamp = store.get(id).map_or(now, |state| state.start_time);
    let response = Response {
        request_id: id.to_string(),
        final_status: FinalStatus::Failed,
        attempts: Vec::new(),
        request_timestamp,
        timestamp: now,
        model_used: None,
        mode_used: None,
        response_length: 0,
        execution_time_s: 0.0,
    };
    if let Err(e) = writer.write_response(&response) {
        warn!(request_id = %id, error = %e, "force-fail response write failed");
    }
    if let Err(e) = writer.write_failure_mirror(&response, reason) {
        warn!(request_id = %id, error = %e, "force-fail mirror write failed");
    }
    store.mark(id, ProcessingStatus::Failed, Some(reason.to_string()));
    if let Err(e) = std::fs::remove_file(claimed) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(request_id = %id, error = %e, "could not remove stuck claim file");
        }
    }
}

fn claimed_files(layout: &Layout) -> Vec<std::path::PathBuf> {
    let Ok(entries) = std::fs::read_dir(layout.processing()) else {
        return Vec::new();
    };
    let mut files: Vec<std::path::PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|e| e.to_str()) == Some("json")
                && std::fs::symlink_metadata(path)
                    .map(|meta| meta.file_type().is_file())
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}
