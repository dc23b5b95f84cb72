//! Periodic maintenance.
//!
//! Every tick the loop prunes expired completed state, force-fails
//! processing entries that have been idle past the threshold, republishes
//! the advisory snapshot at `config/current_state.json`, and rescans
//! `requests/` as a safety net for watcher events lost to degradation.
//! The snapshot is advisory only; clients may read it but nothing in the
//! protocol depends on it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::engine::LifecycleEngine;
use crate::fs_safe;
use crate::layout::Layout;
use crate::recovery;
use crate::response::ResponseWriter;
use crate::state_store::{StateStore, StatusCounts};
use crate::watcher::RequestWatcher;

/// Advisory snapshot published each maintenance tick.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// Broker crate version.
    pub version: &'static str,
    /// Exchange base directory.
    pub base_directory: PathBuf,
    /// Counts of processing states by status.
    pub counts: StatusCounts,
    /// Wall-clock time of publication.
    pub timestamp: DateTime<Utc>,
}

/// Runs the maintenance loop until `shutdown` is cancelled.
pub async fn run(
    layout: Layout,
    config: BrokerConfig,
    store: Arc<StateStore>,
    engine: Arc<LifecycleEngine>,
    rescan_tx: UnboundedSender<PathBuf>,
    shutdown: CancellationToken,
) {
    let interval = Duration::from_millis(config.maintenance_interval_ms);
    let writer = ResponseWriter::new(layout.clone());
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {},
            () = shutdown.cancelled() => return,
        }
        tick(&layout, &config, &store, &engine, &writer, &rescan_tx);
    }
}

/// One maintenance pass.
pub fn tick(
    layout: &Layout,
    config: &BrokerConfig,
    store: &Arc<StateStore>,
    engine: &Arc<LifecycleEngine>,
    writer: &ResponseWriter,
    rescan_tx: &UnboundedSender<PathBuf>,
) {
    let pruned = store.prune_completed(config.completed_retention_secs);
    if pruned > 0 {
        debug!(pruned, "removed expired completed states");
    }

    for id in store.stale_processing(config.force_fail_idle_secs) {
        // A dispatch the engine is still driving is not stuck, however long
        // it has been running.
        if engine.is_in_flight(&id) {
            continue;
        }
        let claimed = layout.processing_file(&id);
        recovery::force_fail_claimed(store, writer, &id, &claimed, "processing timeout");
    }

    publish_snapshot(layout, store);

    let rescanned = RequestWatcher::enumerate(layout, rescan_tx);
    if rescanned > 0 {
        debug!(rescanned, "maintenance rescan forwarded request documents");
    }
}

/// Publishes the advisory snapshot. Called at activation and every tick.
pub fn publish_snapshot(layout: &Layout, store: &Arc<StateStore>) {
    let snapshot = StateSnapshot {
        version: env!("CARGO_PKG_VERSION"),
        base_directory: layout.base().to_path_buf(),
        counts: store.counts(),
        timestamp: Utc::now(),
    };
    if let Err(e) = fs_safe::atomic_write_json(&layout.snapshot_file(), &snapshot) {
        warn!(error = %e, "advisory snapshot write failed");
    }
}
