//! Broker lifecycle: activation, background loops, cooperative shutdown.
//!
//! Activation is fail-closed: the directory tree must be creatable and the
//! workspace lock must be acquired before any background work starts. Once
//! active, four concerns run until shutdown:
//!
//! 1. the watcher thread feeding candidate paths into a channel,
//! 2. a pump task draining that channel into the lifecycle engine,
//! 3. the lock heartbeat,
//! 4. the maintenance loop.
//!
//! Shutdown stops the watcher, cancels in-flight dispatches, waits up to
//! the configured grace for workers to drain, persists the state store, and
//! releases the lock. Claims still in `processing/` at that point are
//! recovered on the next start.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::LifecycleEngine;
use crate::layout::Layout;
use crate::lock::{AcquireOutcome, LockError, LockManager};
use crate::maintenance;
use crate::recovery::{self, RecoveryReport};
use crate::state_store::{StateStore, StateStoreError};
use crate::watcher::{RequestWatcher, WatcherMode};
use crate::workspace;

/// Errors that prevent the broker from activating.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Another live broker owns this workspace.
    #[error("workspace lock held by live process {owner_pid}")]
    LockContended {
        /// Pid recorded in the lock file.
        owner_pid: u32,
    },

    /// Lock acquisition failed on I/O.
    #[error("lock acquisition failed: {0}")]
    Lock(#[from] LockError),

    /// The exchange directory tree could not be created.
    #[error("directory layout setup failed: {0}")]
    Layout(#[from] std::io::Error),

    /// State persistence failed during shutdown.
    #[error("state store error: {0}")]
    State(#[from] StateStoreError),
}

/// An activated broker. Dropping it without calling [`Broker::shutdown`]
/// releases the lock but skips the drain and final state save.
pub struct Broker {
    config: BrokerConfig,
    layout: Layout,
    lock: Arc<LockManager>,
    store: Arc<StateStore>,
    engine: Arc<LifecycleEngine>,
    shutdown: CancellationToken,
    watcher_mode: WatcherMode,
    recovery: RecoveryReport,
    background: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Activates the broker for `workspace_root`.
    ///
    /// Creates the directory tree, acquires the singleton lock, loads the
    /// state store, runs the crash-recovery pass, and starts the watcher,
    /// heartbeat, and maintenance loops.
    pub async fn activate(
        config: BrokerConfig,
        workspace_root: &Path,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, BrokerError> {
        let config = config.normalized();
        let layout = Layout::new(&config.base_directory);
        layout.ensure()?;

        let workspace_id = workspace::workspace_id(workspace_root);
        let lock = Arc::new(LockManager::new(&layout, workspace_id.clone()));
        match lock.acquire()? {
            AcquireOutcome::Acquired => {},
            AcquireOutcome::Denied { owner_pid } => {
                return Err(BrokerError::LockContended { owner_pid });
            },
        }

        let shutdown = CancellationToken::new();
        let store = Arc::new(StateStore::load(layout.clone()));
        let engine = LifecycleEngine::new(
            layout.clone(),
            config.clone(),
            dispatcher,
            Arc::clone(&store),
            shutdown.clone(),
        );

        // Establish the watch before the recovery enumeration so a document
        // arriving in between is seen by one of the two.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = RequestWatcher::spawn(&layout, &config, tx.clone(), shutdown.clone());

        let recovery = recovery::recover(&layout, &config, &store, &engine);
        maintenance::publish_snapshot(&layout, &store);

        let mut background = Vec::new();

        // Pump: candidates from the watcher (and maintenance rescans) into
        // the engine. The engine returns immediately; dispatch happens on
        // its worker pool.
        {
            let engine = Arc::clone(&engine);
            let stop = shutdown.clone();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        candidate = rx.recv() => match candidate {
                            Some(path) => Arc::clone(&engine).submit(path),
                            None => return,
                        },
                        () = stop.cancelled() => return,
                    }
                }
            }));
        }

        // Heartbeat: refresh the lock record on an interval. Errors are
        // logged and tolerated; the broker keeps running.
        {
            let lock = Arc::clone(&lock);
            let stop = shutdown.clone();
            let interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {},
                        () = stop.cancelled() => return,
                    }
                    if let Err(e) = lock.refresh() {
                        warn!(error = %e, "lock heartbeat failed");
                    }
                }
            }));
        }

        // Maintenance loop.
        background.push(tokio::spawn(maintenance::run(
            layout.clone(),
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&engine),
            tx,
            shutdown.clone(),
        )));

        info!(
            workspace_id = %workspace_id,
            base = %layout.base().display(),
            watcher_mode = ?watcher.mode(),
            "broker active"
        );

        Ok(Self {
            config,
            layout,
            lock,
            store,
            engine,
            shutdown,
            watcher_mode: watcher.mode(),
            recovery,
            background,
        })
    }

    /// The exchange layout this broker operates on.
    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The recovery report from activation.
    #[must_use]
    pub const fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// How the watcher is observing `requests/`.
    #[must_use]
    pub const fn watcher_mode(&self) -> WatcherMode {
        self.watcher_mode
    }

    /// Token tripped when a client submits the `shutdown` command.
    ///
    /// The host is expected to await this and then call
    /// [`Broker::shutdown`].
    #[must_use]
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.engine.shutdown_requested()
    }

    /// Cooperative shutdown.
    ///
    /// Cancels in-flight dispatches, waits up to the configured grace for
    /// workers to drain, persists the state store, and releases the lock.
    pub async fn shutdown(self) {
        info!("broker shutting down");
        self.shutdown.cancel();
        self.engine
            .drain(Duration::from_secs(self.config.shutdown_grace_secs))
            .await;

        for handle in &self.background {
            handle.abort();
        }

        if let Err(e) = self.store.persist() {
            error!(error = %e, "final state persistence failed");
        }
        self.lock.release();
        info!("broker shutdown complete");
    }
}
