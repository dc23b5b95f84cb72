//! Request lifecycle engine.
//!
//! The engine owns every file movement in the exchange tree. For each
//! candidate request it validates, claims (rename into `processing/`),
//! dispatches with a deadline-armed cancellation token, and publishes either
//! a response or a retry re-emission. Terminal failures are mirrored into
//! `failed/`.
//!
//! # Concurrency
//!
//! Per-request work runs as a tokio task gated by a fair semaphore, so
//! submissions beyond the cap queue FIFO. An in-memory `in_flight` set
//! guards each id from concurrent claims: it is entered before validation
//! and left only on a terminal outcome, a retry re-emission, or an abort.
//! Attempts for one id are therefore strictly sequential; no ordering is
//! promised across ids.
//!
//! # Ownership
//!
//! The engine is the sole owner of request-file deletion. No other
//! component may remove files from `requests/` or `processing/`; a second
//! deleter racing the engine has historically destabilized the exchange.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::dispatcher::{Dispatcher, DispatcherResult};
use crate::fs_safe::{self, MAX_DOCUMENT_SIZE};
use crate::layout::Layout;
use crate::request::{Command, Request, RequestError};
use crate::response::{self, Attempt, FinalStatus, Response, ResponseWriter};
use crate::state_store::{ProcessingStatus, StateStore};

/// Failure reason recorded when the retry budget is exhausted.
pub const REASON_MAX_RETRIES: &str = "max retries exceeded";

/// The central state machine driving every request to a terminal outcome.
pub struct LifecycleEngine {
    layout: Layout,
    config: BrokerConfig,
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<StateStore>,
    writer: ResponseWriter,
    in_flight: Mutex<HashSet<String>>,
    journal: Mutex<HashMap<String, Vec<Attempt>>>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    shutdown: CancellationToken,
    shutdown_request: CancellationToken,
}

impl LifecycleEngine {
    /// Creates an engine over the exchange layout.
    ///
    /// `shutdown` is the broker-wide stop token: cancelling it makes every
    /// worker abandon its dispatch and leave the claim in `processing/` for
    /// the next recovery pass.
    #[must_use]
    pub fn new(
        layout: Layout,
        config: BrokerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        store: Arc<StateStore>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let concurrency = config.effective_concurrency();
        let writer = ResponseWriter::new(layout.clone());
        Arc::new(Self {
            layout,
            config,
            dispatcher,
            store,
            writer,
            in_flight: Mutex::new(HashSet::new()),
            journal: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            shutdown,
            shutdown_request: CancellationToken::new(),
        })
    }

    /// Token tripped when a `shutdown` command reaches a terminal outcome.
    #[must_use]
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown_request.clone()
    }

    /// Returns `true` while a worker owns `id` (claim through terminal
    /// outcome or retry re-emission).
    #[must_use]
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    /// Returns once every worker permit is idle or `grace` has elapsed.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.semaphore.available_permits() == self.concurrency {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace elapsed with dispatches still in flight");
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Schedules a candidate request file for processing.
    ///
    /// Returns immediately; the work runs on the engine's worker pool. The
    /// candidate goes through the settle delay, duplicate suppression,
    /// claim, and dispatch.
    pub fn submit(self: Arc<Self>, path: PathBuf) {
        let engine = self;
        tokio::spawn(async move {
            if engine.shutdown.is_cancelled() {
                return;
            }
            let Ok(_permit) = engine.semaphore.acquire().await else {
                return;
            };
            engine.process_candidate(&path).await;
        });
    }

    /// Schedules an already-claimed file from `processing/` for resumption.
    ///
    /// Used by crash recovery: the claim rename already happened in a
    /// previous incarnation, so the settle delay and claim are skipped.
    pub fn resume_claimed(self: Arc<Self>, path: PathBuf) {
        let engine = self;
        tokio::spawn(async move {
            if engine.shutdown.is_cancelled() {
                return;
            }
            let Ok(_permit) = engine.semaphore.acquire().await else {
                return;
            };
            engine.process_resumed(&path).await;
        });
    }

    async fn process_candidate(&self, path: &Path) {
        sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        // Watcher events are hints, not truths; the file may be gone by the
        // time we look.
        if !path.exists() {
            return;
        }
        let Some(stem) = file_stem(path) else {
            warn!(path = %path.display(), "ignoring request file with unusable name");
            return;
        };

        if !self.enter_flight(&stem) {
            // Often the tail of a retry re-emission: the previous cycle is
            // still releasing its hold. One short second look; after that
            // the maintenance rescan is the backstop.
            sleep(Duration::from_millis(100)).await;
            if !path.exists() || !self.enter_flight(&stem) {
                debug!(request_id = %stem, "claim attempt while in flight; ignoring");
                return;
            }
        }

        // Step A: validate against the document still sitting in requests/.
        let request = match self.validate(path, &stem) {
            Validated::Proceed(request) => request,
            Validated::Finished => {
                self.leave_flight(&stem);
                return;
            },
        };
        self.store.mark(&stem, ProcessingStatus::Pending, None);

        // Step B: claim. A vanished file means another event raced us.
        let claimed = self.layout.processing_file(&stem);
        match std::fs::rename(path, &claimed) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(request_id = %stem, "request vanished before claim; aborting");
                self.leave_flight(&stem);
                return;
            },
            Err(e) => {
                error!(request_id = %stem, error = %e, "claim rename failed");
                self.leave_flight(&stem);
                return;
            },
        }

        self.run_claimed(&stem, request, &claimed).await;
    }

    async fn process_resumed(&self, path: &Path) {
        let Some(stem) = file_stem(path) else {
            warn!(path = %path.display(), "ignoring claimed file with unusable name");
            return;
        };
        if !self.enter_flight(&stem) {
            return;
        }
        let request: Request = match fs_safe::bounded_read_json(path, MAX_DOCUMENT_SIZE) {
            Ok(request) => request,
            Err(e) => {
                warn!(request_id = %stem, error = %e, "claimed file unreadable during recovery");
                self.write_error_response(&stem, Utc::now(), &format!("unreadable claim: {e}"));
                self.remove_file(path);
                self.store
                    .mark(&stem, ProcessingStatus::Failed, Some(e.to_string()));
                self.leave_flight(&stem);
                return;
            },
        };
        info!(request_id = %stem, "resuming in-flight request from previous incarnation");
        self.run_claimed(&stem, request, path).await;
    }

    /// Steps C through F for a claimed request.
    async fn run_claimed(&self, id: &str, request: Request, claimed: &Path) {
        let retry_count = request.effective_retry_count();
        let max_retries = request.effective_max_retries();
        self.store.mark_processing(id, retry_count);

        // Step C: a re-entered retry that already consumed its budget goes
        // terminal without another dispatch. First submissions (retry_count
        // zero) always get one attempt, even with a zero budget.
        if retry_count > 0 && retry_count >= max_retries {
            self.finish_failed(id, &request, claimed, REASON_MAX_RETRIES.to_string());
            return;
        }

        // Step D: dispatch with a deadline-armed token.
        let command = match request.parsed_command() {
            Ok(command) => command,
            Err(e) => {
                // A retry re-emission cannot change the command, so this
                // only fires for claims resumed from a damaged file.
                self.write_error_response(id, request.timestamp, &e.to_string());
                self.remove_file(claimed);
                self.store
                    .mark(id, ProcessingStatus::Failed, Some(e.to_string()));
                self.cleanup(id);
                return;
            },
        };

        if let Command::Shutdown = command {
            self.finish_shutdown(id, &request, claimed);
            return;
        }

        self.apply_mode_preference(id, &command).await;

        let outcome = match self.dispatch_bounded(id, &request, &command).await {
            Some(outcome) => outcome,
            None => {
                // Broker-wide shutdown: leave the claim for recovery.
                debug!(request_id = %id, "shutdown during dispatch; leaving claim in place");
                self.leave_flight(id);
                return;
            },
        };

        let attempt_no = retry_count + 1;
        let attempt = Attempt {
            attempt: attempt_no,
            success: outcome.success,
            data: outcome.data.clone(),
            error: outcome.error.clone(),
            timestamp: Utc::now(),
        };
        self.append_log(
            id,
            &format!(
                "attempt {attempt_no}: {}",
                if outcome.success {
                    "success".to_string()
                } else {
                    format!(
                        "failure: {}",
                        outcome.error.as_deref().unwrap_or("unspecified")
                    )
                }
            ),
        );
        self.push_attempt(id, attempt);

        if outcome.success {
            self.finish_success(id, &request, claimed, &outcome);
        } else {
            self.retry_or_fail(id, &request, claimed, &outcome).await;
        }
    }

    // -----------------------------------------------------------------------
    // Step A: validation
    // -----------------------------------------------------------------------

    fn validate(&self, path: &Path, stem: &str) -> Validated {
        let request: Request = match fs_safe::bounded_read_json(path, MAX_DOCUMENT_SIZE) {
            Ok(request) => request,
            Err(e) => {
                info!(request_id = %stem, error = %e, "rejecting unparseable request");
                self.write_error_response(stem, Utc::now(), &format!("invalid request: {e}"));
                self.remove_file(path);
                self.store
                    .mark(stem, ProcessingStatus::Failed, Some(e.to_string()));
                return Validated::Finished;
            },
        };

        if let Err(e) = self.validate_request(&request, stem) {
            info!(request_id = %stem, error = %e, "rejecting invalid request");
            self.write_error_response(stem, request.timestamp, &e.to_string());
            self.remove_file(path);
            self.store
                .mark(stem, ProcessingStatus::Failed, Some(e.to_string()));
            return Validated::Finished;
        }

        // Duplicate suppression: a strictly fresher response means this
        // document was already answered. A resubmission carrying a newer
        // timestamp is allowed through.
        if let Some(existing) = self.writer.read_existing(&request.request_id) {
            if existing.timestamp > request.timestamp {
                debug!(
                    request_id = %stem,
                    "fresher response already published; dropping duplicate request"
                );
                self.remove_file(path);
                return Validated::Finished;
            }
        }

        if self.store.is_completed(&request.request_id) {
            debug!(request_id = %stem, "request already completed; dropping duplicate");
            self.remove_file(path);
            return Validated::Finished;
        }

        Validated::Proceed(request)
    }

    fn validate_request(&self, request: &Request, stem: &str) -> Result<(), RequestError> {
        request.validate_identity(stem)?;
        request.validate_timestamp(
            Utc::now(),
            self.config.max_request_age_secs,
            self.config.timestamp_skew_secs,
        )?;
        request.validate_budget_and_integrity()?;
        // Resolve the command now so an unknown command or bad params is
        // rejected before the claim.
        request.parsed_command().map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Step D: dispatch
    // -----------------------------------------------------------------------

    /// Applies a mode preference carried by a `submitPrompt` request.
    ///
    /// Misapplication is a warning, not a failure.
    async fn apply_mode_preference(&self, id: &str, command: &Command) {
        let Command::SubmitPrompt {
            mode: Some(mode), ..
        } = command
        else {
            return;
        };
        let token = self.shutdown.child_token();
        let set_mode = Command::SetMode { mode: *mode };
        let result = self.dispatcher.dispatch(&set_mode, &token).await;
        if !result.success {
            warn!(
                request_id = %id,
                mode = %mode,
                error = result.error.as_deref().unwrap_or("unspecified"),
                "mode preference could not be applied; continuing"
            );
        }
    }

    /// Runs one dispatch under the request deadline.
    ///
    /// Returns `None` only when the broker itself is shutting down. A
    /// dispatcher that ignores its tripped token past the grace period is
    /// abandoned; the detached task may keep running but its result is
    /// discarded.
    async fn dispatch_bounded(
        &self,
        id: &str,
        request: &Request,
        command: &Command,
    ) -> Option<DispatcherResult> {
        let token = self.shutdown.child_token();
        let deadline = Duration::from_millis(request.effective_timeout_ms());
        let grace = Duration::from_secs(self.config.dispatch_grace_secs);

        let dispatcher = Arc::clone(&self.dispatcher);
        let task_token = token.clone();
        let task_command = command.clone();
        let mut handle = tokio::spawn(async move {
            dispatcher.dispatch(&task_command, &task_token).await
        });

        tokio::select! {
            joined = &mut handle => Some(join_outcome(joined)),
            () = sleep(deadline) => {
                token.cancel();
                tokio::select! {
                    joined = &mut handle => {
                        let mut outcome = join_outcome(joined);
                        if !outcome.success && outcome.error.is_none() {
                            outcome.error = Some(timeout_text(deadline));
                        }
                        Some(outcome)
                    },
                    () = sleep(grace) => {
                        warn!(
                            request_id = %id,
                            "dispatcher ignored cancellation; abandoning attempt"
                        );
                        Some(DispatcherResult::fail(timeout_text(deadline)))
                    },
                }
            },
            () = self.shutdown.cancelled() => {
                token.cancel();
                None
            },
        }
    }

    // -----------------------------------------------------------------------
    // Steps E/F: terminal outcomes and retry re-emission
    // -----------------------------------------------------------------------

    fn finish_success(
        &self,
        id: &str,
        request: &Request,
        claimed: &Path,
        outcome: &DispatcherResult,
    ) {
        let attempts = self.take_journal(id);
        let response = self.build_response(id, request, FinalStatus::Success, attempts, outcome);
        if let Err(e) = self.writer.write_response(&response) {
            // Without a response the request is not done; leave the claim
            // for the next recovery cycle.
            error!(request_id = %id, error = %e, "response write failed; leaving claim");
            self.leave_flight(id);
            return;
        }
        self.store.mark(id, ProcessingStatus::Completed, None);
        self.remove_file(claimed);
        self.append_log(id, "completed: success");
        self.cleanup(id);
    }

    async fn retry_or_fail(
        &self,
        id: &str,
        request: &Request,
        claimed: &Path,
        outcome: &DispatcherResult,
    ) {
        let next_retry = request.effective_retry_count() + 1;
        if next_retry < request.effective_max_retries() {
            self.emit_retry(id, request, claimed, next_retry).await;
        } else {
            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| REASON_MAX_RETRIES.to_string());
            self.finish_failed(id, request, claimed, reason);
        }
    }

    /// Re-emits the request into `requests/` with an incremented retry
    /// count and a refreshed timestamp, after a linear backoff.
    async fn emit_retry(&self, id: &str, request: &Request, claimed: &Path, next_retry: u32) {
        let backoff_ms = (self.config.retry_backoff_base_ms * u64::from(next_retry))
            .min(self.config.retry_backoff_cap_ms);
        let backoff = Duration::from_millis(backoff_ms);
        info!(
            request_id = %id,
            retry = next_retry,
            backoff_ms,
            "re-emitting request for retry"
        );
        tokio::select! {
            () = sleep(backoff) => {},
            () = self.shutdown.cancelled() => {
                // Keep the claim; recovery will retry it.
                self.leave_flight(id);
                return;
            },
        }

        let mut retry = request.clone();
        retry.retry_count = Some(next_retry);
        retry.timestamp = Utc::now();

        let target = self.layout.request_file(id);
        if let Err(e) = fs_safe::atomic_write_json(&target, &retry) {
            error!(request_id = %id, error = %e, "retry re-emission failed; leaving claim");
            self.leave_flight(id);
            return;
        }
        self.store.mark(id, ProcessingStatus::Retry, None);
        self.remove_file(claimed);
        self.append_log(id, &format!("retry {next_retry} scheduled"));
        // The journal survives so the final response carries every attempt.
        self.leave_flight(id);
    }

    fn finish_failed(&self, id: &str, request: &Request, claimed: &Path, reason: String) {
        let attempts = self.take_journal(id);
        let outcome = DispatcherResult::fail(reason.clone());
        let response = self.build_response(id, request, FinalStatus::Failed, attempts, &outcome);
        if let Err(e) = self.writer.write_response(&response) {
            error!(request_id = %id, error = %e, "response write failed; leaving claim");
            self.leave_flight(id);
            return;
        }
        if let Err(e) = self.writer.write_failure_mirror(&response, reason.clone()) {
            error!(request_id = %id, error = %e, "failure mirror write failed");
        }
        self.store.mark(id, ProcessingStatus::Failed, Some(reason));
        self.remove_file(claimed);
        self.append_log(id, "completed: failed");
        self.cleanup(id);
    }

    /// Terminal path for the `shutdown` command: publish success, then trip
    /// the shutdown-request token the broker listens on.
    fn finish_shutdown(&self, id: &str, request: &Request, claimed: &Path) {
        self.push_attempt(
            id,
            Attempt {
                attempt: request.effective_retry_count() + 1,
                success: true,
                data: Some(json!({"message": "shutting down"})),
                error: None,
                timestamp: Utc::now(),
            },
        );
        let attempts = self.take_journal(id);
        let outcome = DispatcherResult::ok(json!({"message": "shutting down"}));
        let response = self.build_response(id, request, FinalStatus::Success, attempts, &outcome);
        if let Err(e) = self.writer.write_response(&response) {
            error!(request_id = %id, error = %e, "shutdown response write failed");
        }
        self.store.mark(id, ProcessingStatus::Completed, None);
        self.remove_file(claimed);
        self.cleanup(id);
        info!(request_id = %id, "shutdown command accepted");
        self.shutdown_request.cancel();
    }

    // -----------------------------------------------------------------------
    // Response assembly
    // -----------------------------------------------------------------------

    #[allow(clippy::cast_precision_loss)]
    fn build_response(
        &self,
        id: &str,
        request: &Request,
        final_status: FinalStatus,
        attempts: Vec<Attempt>,
        outcome: &DispatcherResult,
    ) -> Response {
        let now = Utc::now();
        let execution_time_s = self.store.get(id).map_or(0.0, |state| {
            let millis = (now - state.start_time).num_milliseconds().max(0);
            millis as f64 / 1000.0
        });
        let response_length = attempts
            .last()
            .map_or(0, |attempt| response::data_length(attempt.data.as_ref()));
        Response {
            request_id: id.to_string(),
            final_status,
            attempts,
            request_timestamp: request.timestamp,
            timestamp: now,
            model_used: outcome.model_used.clone(),
            mode_used: outcome.mode_used.clone(),
            response_length,
            execution_time_s,
        }
    }

    /// Publishes an `error` response for a request that never dispatched.
    fn write_error_response(
        &self,
        id: &str,
        request_timestamp: chrono::DateTime<Utc>,
        detail: &str,
    ) {
        let response = Response {
            request_id: id.to_string(),
            final_status: FinalStatus::Error,
            attempts: Vec::new(),
            request_timestamp,
            timestamp: Utc::now(),
            model_used: None,
            mode_used: None,
            response_length: 0,
            execution_time_s: 0.0,
        };
        if let Err(e) = self.writer.write_response(&response) {
            error!(request_id = %id, error = %e, "error response write failed");
        }
        self.append_log(id, &format!("rejected: {detail}"));
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn enter_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|mut set| set.insert(id.to_string()))
            .unwrap_or(false)
    }

    fn leave_flight(&self, id: &str) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(id);
        }
    }

    fn cleanup(&self, id: &str) {
        self.leave_flight(id);
        if let Ok(mut journal) = self.journal.lock() {
            journal.remove(id);
        }
    }

    fn push_attempt(&self, id: &str, attempt: Attempt) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.entry(id.to_string()).or_default().push(attempt);
        }
    }

    fn take_journal(&self, id: &str) -> Vec<Attempt> {
        self.journal
            .lock()
            .ok()
            .and_then(|mut journal| journal.remove(id))
            .unwrap_or_default()
    }

    fn remove_file(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "file removal failed");
            }
        }
    }

    fn append_log(&self, id: &str, line: &str) {
        let path = self.layout.request_log_file(id);
        let stamped = format!("{} {line}", Utc::now().to_rfc3339());
        if let Err(e) = fs_safe::append_line(&path, &stamped) {
            debug!(request_id = %id, error = %e, "request log append failed");
        }
    }
}

enum Validated {
    Proceed(Request),
    Finished,
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToString::to_string)
}

fn timeout_text(deadline: Duration) -> String {
    format!("dispatch timed out after {}ms", deadline.as_millis())
}

fn join_outcome(
    joined: Result<DispatcherResult, tokio::task::JoinError>,
) -> DispatcherResult {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => DispatcherResult::fail(format!("dispatcher task failed: {e}")),
    }
}
