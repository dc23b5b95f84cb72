//! The collaborator contract the broker drives.
//!
//! The broker does not know how a dispatcher reaches the assistant; the
//! only requirement is that `dispatch` eventually returns or honors the
//! cancellation token at its next suspension point. Outcomes are values,
//! never panics: a dispatcher that cannot execute a command reports
//! `success = false` with an error description.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::request::Command;

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatcherResult {
    /// Whether the command executed successfully.
    pub success: bool,
    /// Command-specific payload on success.
    pub data: Option<Value>,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Model the assistant used, when known.
    pub model_used: Option<String>,
    /// Mode the assistant used, when known.
    pub mode_used: Option<String>,
}

impl DispatcherResult {
    /// Builds a success result carrying `data`.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    /// Builds a failure result carrying an error description.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attaches the model identifier.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    /// Attaches the mode identifier.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode_used = Some(mode.into());
        self
    }
}

/// Executes commands against the assistant.
///
/// Implementations may suspend for as long as they need; the engine arms
/// each call with a deadline and trips `cancel` when it expires. A
/// well-behaved dispatcher checks the token at suspension points and
/// returns promptly once it is tripped; one that does not is abandoned
/// after a grace period and its eventual result is discarded.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Executes `command`, returning the outcome as a value.
    async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> DispatcherResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_builders_set_expected_fields() {
        let ok = DispatcherResult::ok(serde_json::json!({"message": "pong"}))
            .with_model("gpt-test")
            .with_mode("chat");
        assert!(ok.success);
        assert_eq!(ok.model_used.as_deref(), Some("gpt-test"));
        assert_eq!(ok.mode_used.as_deref(), Some("chat"));

        let fail = DispatcherResult::fail("assistant unavailable");
        assert!(!fail.success);
        assert_eq!(fail.error.as_deref(), Some("assistant unavailable"));
        assert!(fail.data.is_none());
    }
}
