//! End-to-end lifecycle scenarios driven through the public broker surface.
//!
//! Each test activates a broker over a temp exchange tree, plays the client
//! role by dropping request documents into `requests/`, and asserts the
//! file-movement and response semantics external observers rely on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use evalbroker_core::broker::{Broker, BrokerError};
use evalbroker_core::config::BrokerConfig;
use evalbroker_core::dispatcher::{Dispatcher, DispatcherResult};
use evalbroker_core::layout::Layout;
use evalbroker_core::request::Command;
use evalbroker_core::workspace;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Dispatcher whose first `fail_attempts` dispatches fail, with optional
/// latency. Counts every dispatch so tests can assert exactly-once laws.
struct ScriptedDispatcher {
    fail_attempts: u32,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedDispatcher {
    fn new(fail_attempts: u32) -> Self {
        Self {
            fail_attempts,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> DispatcherResult {
        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {},
                () = cancel.cancelled() => {
                    return DispatcherResult::fail("dispatch cancelled by deadline");
                },
            }
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_attempts {
            return DispatcherResult::fail("scripted failure");
        }

        match command {
            Command::Ping => DispatcherResult::ok(json!({"message": "pong"}))
                .with_model("scripted")
                .with_mode("chat"),
            Command::SubmitPrompt { prompt, .. } => {
                DispatcherResult::ok(json!({"response": format!("echo: {prompt}")}))
                    .with_model("scripted")
                    .with_mode("chat")
            },
            Command::SetMode { mode } => DispatcherResult::ok(json!({"mode": mode.to_string()})),
            Command::GetCurrentState => {
                DispatcherResult::ok(json!({"model": "scripted", "mode": "chat"}))
            },
            Command::Shutdown => DispatcherResult::ok(json!({"message": "shutting down"})),
        }
    }
}

fn test_config(base: &Path) -> BrokerConfig {
    BrokerConfig {
        base_directory: base.to_path_buf(),
        settle_delay_ms: 10,
        retry_backoff_base_ms: 50,
        retry_backoff_cap_ms: 200,
        dispatch_grace_secs: 1,
        ..BrokerConfig::default()
    }
}

async fn activate(
    base: &Path,
    workspace_root: &Path,
    dispatcher: Arc<ScriptedDispatcher>,
) -> Broker {
    Broker::activate(test_config(base), workspace_root, dispatcher)
        .await
        .expect("broker activation")
}

fn write_request(layout: &Layout, id: &str, command: &str, extra: Value) {
    let mut request = json!({
        "request_id": id,
        "command": command,
        "params": {},
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let (Some(object), Some(extra_map)) = (request.as_object_mut(), extra.as_object()) {
        for (key, value) in extra_map {
            object.insert(key.clone(), value.clone());
        }
    }
    let path = layout.requests().join(format!("{id}.json"));
    std::fs::write(path, serde_json::to_vec_pretty(&request).expect("encode"))
        .expect("write request");
}

async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn wait_for_absence(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn read_json(path: &Path) -> Value {
    let raw = std::fs::read_to_string(path).expect("read json");
    serde_json::from_str(&raw).expect("parse json")
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_ping_publishes_success_response() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(&layout, "r1", "ping", json!({}));

    let response_path = layout.response_file("r1");
    assert!(
        wait_for_file(&response_path, Duration::from_secs(5)).await,
        "response should appear within 5s"
    );

    let response = read_json(&response_path);
    assert_eq!(response["final_status"], "success");
    assert_eq!(response["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(response["attempts"][0]["attempt"], 1);
    assert_eq!(response["attempts"][0]["success"], true);
    assert_eq!(response["attempts"][0]["data"]["message"], "pong");

    assert!(
        wait_for_absence(&layout.request_file("r1"), Duration::from_secs(2)).await,
        "request document should be consumed"
    );
    assert!(!layout.failed_file("r1").exists());
    assert!(!layout.processing_file("r1").exists());
    assert_eq!(dispatcher.calls(), 1);

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_then_success_accumulates_attempt_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(1));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(&layout, "r2", "ping", json!({"max_retries": 3}));

    let response_path = layout.response_file("r2");
    assert!(wait_for_file(&response_path, Duration::from_secs(10)).await);

    let response = read_json(&response_path);
    assert_eq!(response["final_status"], "success");
    let attempts = response["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2, "one failure then one success");
    assert_eq!(attempts[0]["success"], false);
    assert_eq!(attempts[1]["success"], true);
    assert!(!layout.failed_file("r2").exists());
    assert_eq!(dispatcher.calls(), 2);

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_publish_failure_and_mirror() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(u32::MAX));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(&layout, "r3", "ping", json!({"max_retries": 2}));

    let response_path = layout.response_file("r3");
    assert!(wait_for_file(&response_path, Duration::from_secs(10)).await);

    let response = read_json(&response_path);
    assert_eq!(response["final_status"], "failed");
    let attempts = response["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2, "attempts are capped by the retry budget");
    assert!(attempts.iter().all(|a| a["success"] == false));

    assert!(wait_for_file(&layout.failed_file("r3"), Duration::from_secs(2)).await);
    let mirror = read_json(&layout.failed_file("r3"));
    assert!(mirror["failure_reason"].is_string());
    assert!(mirror["failed_at"].is_string());
    assert_eq!(dispatcher.calls(), 2);

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_request_is_rejected_without_dispatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    let stale = (Utc::now() - ChronoDuration::hours(48)).to_rfc3339();
    write_request(&layout, "r4", "ping", json!({"timestamp": stale}));

    let response_path = layout.response_file("r4");
    assert!(wait_for_file(&response_path, Duration::from_secs(5)).await);

    let response = read_json(&response_path);
    assert_eq!(response["final_status"], "error");
    assert!(response["attempts"].as_array().unwrap().is_empty());
    assert!(!layout.request_file("r4").exists());
    assert_eq!(dispatcher.calls(), 0, "no dispatch for invalid requests");

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_command_is_rejected_as_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(&layout, "r6", "reboot", json!({}));

    let response_path = layout.response_file("r6");
    assert!(wait_for_file(&response_path, Duration::from_secs(5)).await);
    assert_eq!(read_json(&response_path)["final_status"], "error");
    assert_eq!(dispatcher.calls(), 0);

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_drop_results_in_single_dispatch_and_response() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    let timestamp = Utc::now().to_rfc3339();
    write_request(&layout, "r8", "ping", json!({"timestamp": &timestamp}));

    let response_path = layout.response_file("r8");
    assert!(wait_for_file(&response_path, Duration::from_secs(5)).await);
    let first = read_json(&response_path);

    // Same document again, byte-for-byte semantics: same id, same timestamp.
    write_request(&layout, "r8", "ping", json!({"timestamp": &timestamp}));
    assert!(
        wait_for_absence(&layout.request_file("r8"), Duration::from_secs(5)).await,
        "duplicate document should be consumed without re-dispatch"
    );

    assert_eq!(dispatcher.calls(), 1, "exactly one dispatch");
    let second = read_json(&response_path);
    assert_eq!(first, second, "response is immutable once published");

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_is_recorded_and_escalates_to_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0).with_delay(Duration::from_secs(30)));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(
        &layout,
        "r9",
        "ping",
        json!({"timeout_ms": 100, "max_retries": 1}),
    );

    let response_path = layout.response_file("r9");
    assert!(wait_for_file(&response_path, Duration::from_secs(10)).await);

    let response = read_json(&response_path);
    assert_eq!(response["final_status"], "failed");
    let attempts = response["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 1);
    let error = attempts[0]["error"].as_str().unwrap();
    assert!(
        error.contains("cancelled") || error.contains("timed out"),
        "attempt error should carry the timeout reason, got: {error}"
    );
    assert!(layout.failed_file("r9").exists());

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_prompt_response_reports_output_length() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(
        &layout,
        "r10",
        "submitPrompt",
        json!({"params": {"prompt": "say hi"}}),
    );

    let response_path = layout.response_file("r10");
    assert!(wait_for_file(&response_path, Duration::from_secs(5)).await);

    let response = read_json(&response_path);
    assert_eq!(response["final_status"], "success");
    assert_eq!(response["model_used"], "scripted");
    let expected = "echo: say hi".len() as u64;
    assert_eq!(response["response_length"], expected);
    assert!(response["execution_time_s"].is_number());

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_command_trips_the_shutdown_request_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;
    let requested = broker.shutdown_requested();

    write_request(&layout, "r11", "shutdown", json!({}));

    tokio::time::timeout(Duration::from_secs(5), requested.cancelled())
        .await
        .expect("shutdown request within 5s");

    let response = read_json(&layout.response_file("r11"));
    assert_eq!(response["final_status"], "success");

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_force_fails_stuck_claims_and_resumes_fresh_ones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    layout.ensure().expect("ensure");

    // A claim whose state says it has been processing for an hour.
    let stuck_request = json!({
        "request_id": "r5",
        "command": "ping",
        "params": {},
        "timestamp": Utc::now().to_rfc3339(),
    });
    std::fs::write(
        layout.processing_file("r5"),
        serde_json::to_vec_pretty(&stuck_request).expect("encode"),
    )
    .expect("seed stuck claim");
    let old = Utc::now() - ChronoDuration::hours(1);
    let state_doc = json!({
        "states": {
            "r5": {
                "request_id": "r5",
                "status": "processing",
                "start_time": old.to_rfc3339(),
                "last_update": old.to_rfc3339(),
                "retry_count": 0,
            }
        }
    });
    std::fs::write(
        layout.state_file(),
        serde_json::to_vec_pretty(&state_doc).expect("encode"),
    )
    .expect("seed state");

    // A claim with no recorded state: resumed as a fresh dispatch.
    let fresh_request = json!({
        "request_id": "r5b",
        "command": "ping",
        "params": {},
        "timestamp": Utc::now().to_rfc3339(),
    });
    std::fs::write(
        layout.processing_file("r5b"),
        serde_json::to_vec_pretty(&fresh_request).expect("encode"),
    )
    .expect("seed fresh claim");

    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    assert!(
        wait_for_file(&layout.failed_file("r5"), Duration::from_secs(5)).await,
        "stuck claim lands in failed/"
    );
    let mirror = read_json(&layout.failed_file("r5"));
    assert_eq!(mirror["failure_reason"], "processing timeout during recovery");

    assert!(
        wait_for_file(&layout.response_file("r5b"), Duration::from_secs(5)).await,
        "fresh claim resumes to a normal outcome"
    );
    assert_eq!(read_json(&layout.response_file("r5b"))["final_status"], "success");
    assert!(!layout.processing_file("r5").exists());
    assert!(
        wait_for_absence(&layout.processing_file("r5b"), Duration::from_secs(2)).await
    );

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_written_while_down_are_processed_on_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    layout.ensure().expect("ensure");

    // Client wrote these before any broker existed.
    let offline = json!({
        "request_id": "r12",
        "command": "ping",
        "params": {},
        "timestamp": Utc::now().to_rfc3339(),
    });
    std::fs::write(
        layout.request_file("r12"),
        serde_json::to_vec_pretty(&offline).expect("encode"),
    )
    .expect("seed request");

    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;
    assert_eq!(broker.recovery_report().reenqueued, 1);

    assert!(wait_for_file(&layout.response_file("r12"), Duration::from_secs(5)).await);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_broker_on_same_workspace_is_denied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    layout.ensure().expect("ensure");

    // Pid 1 is alive and is not this process.
    let workspace_root = dir.path().join("ws");
    std::fs::create_dir_all(&workspace_root).expect("mkdir");
    let id = workspace::workspace_id(&workspace_root);
    std::fs::write(layout.lock_file(&id), "1").expect("seed foreign lock");

    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let result = Broker::activate(test_config(dir.path()), &workspace_root, dispatcher).await;

    match result {
        Err(BrokerError::LockContended { owner_pid }) => assert_eq!(owner_pid, 1),
        Err(other) => panic!("unexpected activation error: {other}"),
        Ok(_) => panic!("expected lock contention"),
    }

    // The foreign lock record is untouched.
    let content = std::fs::read_to_string(layout.lock_file(&id)).expect("read lock");
    assert_eq!(content.trim(), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn req_prefixed_ids_map_to_stripped_response_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    let dispatcher = Arc::new(ScriptedDispatcher::new(0));
    let broker = activate(dir.path(), dir.path(), Arc::clone(&dispatcher)).await;

    write_request(&layout, "req_r13", "ping", json!({}));

    let response_path: PathBuf = layout.response_file("r13");
    assert!(
        wait_for_file(&response_path, Duration::from_secs(5)).await,
        "response name strips the req_ prefix"
    );
    assert_eq!(read_json(&response_path)["request_id"], "req_r13");

    broker.shutdown().await;
}
