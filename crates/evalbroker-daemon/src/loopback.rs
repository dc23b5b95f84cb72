//! Loopback dispatcher for local smoke runs.
//!
//! Answers every command locally without reaching any assistant: prompts
//! are acknowledged with a canned echo. Useful for exercising the full
//! directory protocol (clients, retries, timeouts, shutdown) before wiring
//! a real editor-backed dispatcher.

use std::sync::Mutex;

use async_trait::async_trait;
use evalbroker_core::dispatcher::{Dispatcher, DispatcherResult};
use evalbroker_core::request::{AssistantMode, Command};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Model name reported by the loopback dispatcher.
const LOOPBACK_MODEL: &str = "loopback";

/// Dispatcher that answers from local state.
#[derive(Debug)]
pub struct LoopbackDispatcher {
    mode: Mutex<AssistantMode>,
}

impl LoopbackDispatcher {
    /// Creates a dispatcher starting in chat mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(AssistantMode::Chat),
        }
    }

    fn current_mode(&self) -> AssistantMode {
        self.mode.lock().map(|mode| *mode).unwrap_or(AssistantMode::Chat)
    }
}

impl Default for LoopbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for LoopbackDispatcher {
    async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> DispatcherResult {
        if cancel.is_cancelled() {
            return DispatcherResult::fail("dispatch cancelled");
        }
        match command {
            Command::Ping => DispatcherResult::ok(json!({"message": "pong"}))
                .with_model(LOOPBACK_MODEL)
                .with_mode(self.current_mode().to_string()),
            Command::SubmitPrompt { prompt, .. } => {
                DispatcherResult::ok(json!({"response": format!("loopback: {prompt}")}))
                    .with_model(LOOPBACK_MODEL)
                    .with_mode(self.current_mode().to_string())
            },
            Command::SetMode { mode } => {
                if let Ok(mut current) = self.mode.lock() {
                    *current = *mode;
                }
                DispatcherResult::ok(json!({"mode": mode.to_string()}))
                    .with_model(LOOPBACK_MODEL)
                    .with_mode(mode.to_string())
            },
            Command::GetCurrentState => DispatcherResult::ok(json!({
                "model": LOOPBACK_MODEL,
                "mode": self.current_mode().to_string(),
            }))
            .with_model(LOOPBACK_MODEL)
            .with_mode(self.current_mode().to_string()),
            // The engine answers shutdown itself; this arm only fires if a
            // host dispatches it directly.
            Command::Shutdown => DispatcherResult::ok(json!({"message": "shutting down"})),
        }
    }
}
