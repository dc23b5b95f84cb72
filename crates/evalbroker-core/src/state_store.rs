//! Durable `request_id -> ProcessingState` map.
//!
//! The map is persisted as a single JSON document at
//! `state/processing_state.json`, loaded on start and saved after every
//! state transition. Writes are atomic (temp + rename). Corruption is
//! non-fatal: the damaged file is archived next to itself and the store
//! starts empty; the crash-recovery pass then rebuilds what it can from the
//! `processing/` directory.
//!
//! The in-memory map is guarded by a mutex held only across membership
//! checks, updates, and the persistence write; never across a dispatch.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::clock;
use crate::fs_safe::{self, FsError, MAX_DOCUMENT_SIZE};
use crate::layout::Layout;

/// Errors from state-store persistence.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// The persistence write failed.
    #[error("state persistence failed: {0}")]
    Persist(#[from] FsError),

    /// The map mutex was poisoned by a panicking holder.
    #[error("state store mutex poisoned")]
    Poisoned,
}

/// Lifecycle position of a request the broker has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Known but not yet claimed.
    Pending,
    /// Claimed; a dispatch is in flight.
    Processing,
    /// A retry has been re-emitted into `requests/`.
    Retry,
    /// Terminal success; response published.
    Completed,
    /// Terminal failure; response and failure mirror published.
    Failed,
}

impl ProcessingStatus {
    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Broker-owned durable record of where a request is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingState {
    /// Request identifier.
    pub request_id: String,
    /// Current lifecycle position.
    pub status: ProcessingStatus,
    /// Wall-clock time the request was first claimed.
    pub start_time: DateTime<Utc>,
    /// Wall-clock time of the last transition.
    pub last_update: DateTime<Utc>,
    /// Retries attempted so far.
    pub retry_count: u32,
    /// Most recent failure description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PersistedMap {
    #[serde(default)]
    states: HashMap<String, ProcessingState>,
}

/// Counts by status, published in the advisory snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Entries in `pending`.
    pub pending: usize,
    /// Entries in `processing`.
    pub processing: usize,
    /// Entries in `retry`.
    pub retry: usize,
    /// Entries in `completed`.
    pub completed: usize,
    /// Entries in `failed`.
    pub failed: usize,
}

/// Durable state store. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct StateStore {
    layout: Layout,
    states: Mutex<HashMap<String, ProcessingState>>,
}

impl StateStore {
    /// Loads the store from disk.
    ///
    /// A missing file yields an empty store. A file that fails to parse is
    /// archived alongside itself and the store starts empty.
    #[must_use]
    pub fn load(layout: Layout) -> Self {
        let path = layout.state_file();
        let states = if path.exists() {
            match fs_safe::bounded_read_json::<PersistedMap>(&path, MAX_DOCUMENT_SIZE) {
                Ok(persisted) => persisted.states,
                Err(e) => {
                    let archive = path.with_extension(format!(
                        "json.corrupt.{}",
                        Utc::now().timestamp()
                    ));
                    warn!(
                        error = %e,
                        archive = %archive.display(),
                        "processing state file unreadable; archiving and starting empty"
                    );
                    if let Err(rename_err) = std::fs::rename(&path, &archive) {
                        error!(error = %rename_err, "could not archive corrupt state file");
                    }
                    HashMap::new()
                },
            }
        } else {
            HashMap::new()
        };

        Self {
            layout,
            states: Mutex::new(states),
        }
    }

    /// Records a claim: the request is now `processing`.
    ///
    /// Creates the entry on first claim and preserves `start_time` across
    /// retries of the same id.
    pub fn mark_processing(&self, request_id: &str, retry_count: u32) {
        self.mutate(|states| {
            let now = Utc::now();
            states
                .entry(request_id.to_string())
                .and_modify(|state| {
                    state.status = ProcessingStatus::Processing;
                    state.last_update = now;
                    state.retry_count = retry_count;
                })
                .or_insert_with(|| ProcessingState {
                    request_id: request_id.to_string(),
                    status: ProcessingStatus::Processing,
                    start_time: now,
                    last_update: now,
                    retry_count,
                    error_message: None,
                });
        });
    }

    /// Records a transition for an existing entry.
    pub fn mark(
        &self,
        request_id: &str,
        status: ProcessingStatus,
        error_message: Option<String>,
    ) {
        self.mutate(|states| {
            let now = Utc::now();
            match states.entry(request_id.to_string()) {
                Entry::Occupied(mut entry) => {
                    let state = entry.get_mut();
                    state.status = status;
                    state.last_update = now;
                    if let Some(message) = error_message {
                        state.error_message = Some(message);
                    }
                },
                Entry::Vacant(entry) => {
                    entry.insert(ProcessingState {
                        request_id: request_id.to_string(),
                        status,
                        start_time: now,
                        last_update: now,
                        retry_count: 0,
                        error_message,
                    });
                },
            }
        });
    }

    /// Returns a copy of the entry for `request_id`.
    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<ProcessingState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(request_id).cloned())
    }

    /// Returns `true` when the entry is already `completed`.
    #[must_use]
    pub fn is_completed(&self, request_id: &str) -> bool {
        self.get(request_id)
            .is_some_and(|state| state.status == ProcessingStatus::Completed)
    }

    /// Removes `completed` entries whose last update is older than the
    /// retention window. Returns the number removed.
    pub fn prune_completed(&self, retention_secs: i64) -> usize {
        let cutoff = clock::secs_before(Utc::now(), retention_secs);
        let mut removed = 0;
        self.mutate(|states| {
            states.retain(|_, state| {
                let expired =
                    state.status == ProcessingStatus::Completed && state.last_update < cutoff;
                if expired {
                    removed += 1;
                }
                !expired
            });
        });
        removed
    }

    /// Returns ids of `processing` entries idle beyond `idle_secs`.
    #[must_use]
    pub fn stale_processing(&self, idle_secs: i64) -> Vec<String> {
        let cutoff = clock::secs_before(Utc::now(), idle_secs);
        self.states.lock().map_or_else(
            |_| Vec::new(),
            |states| {
                states
                    .values()
                    .filter(|state| {
                        state.status == ProcessingStatus::Processing && state.last_update < cutoff
                    })
                    .map(|state| state.request_id.clone())
                    .collect()
            },
        )
    }

    /// Returns counts by status for the advisory snapshot.
    #[must_use]
    pub fn counts(&self) -> StatusCounts {
        self.states.lock().map_or_else(
            |_| StatusCounts::default(),
            |states| {
                let mut counts = StatusCounts::default();
                for state in states.values() {
                    match state.status {
                        ProcessingStatus::Pending => counts.pending += 1,
                        ProcessingStatus::Processing => counts.processing += 1,
                        ProcessingStatus::Retry => counts.retry += 1,
                        ProcessingStatus::Completed => counts.completed += 1,
                        ProcessingStatus::Failed => counts.failed += 1,
                    }
                }
                counts
            },
        )
    }

    /// Persists the current map explicitly.
    ///
    /// Routine transitions persist on their own; this exists for shutdown,
    /// where a failed save must surface to the caller.
    pub fn persist(&self) -> Result<(), StateStoreError> {
        let states = self
            .states
            .lock()
            .map_err(|_| StateStoreError::Poisoned)?;
        let persisted = PersistedMap {
            states: states.clone(),
        };
        fs_safe::atomic_write_json(&self.layout.state_file(), &persisted)?;
        Ok(())
    }

    /// Applies a mutation and persists the result.
    ///
    /// Save failures on routine transitions are logged and do not interrupt
    /// the lifecycle; the next successful save repairs the file.
    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, ProcessingState>)) {
        let Ok(mut states) = self.states.lock() else {
            error!("state store mutex poisoned; dropping transition");
            return;
        };
        f(&mut states);
        let persisted = PersistedMap {
            states: states.clone(),
        };
        if let Err(e) = fs_safe::atomic_write_json(&self.layout.state_file(), &persisted) {
            error!(error = %e, "failed to persist processing state");
        }
    }
}
