//! Client-authored request documents.
//!
//! A request is a small JSON record dropped into `requests/<id>.json`. The
//! broker treats the document as read-only: it is parsed with bounded
//! decode, validated, and either claimed or rejected. Unknown top-level
//! fields are tolerated (clients ship extra metadata such as priorities),
//! but the command surface is a closed sum type: a command string outside
//! the recognized set is a validation error, never a dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock;
use crate::workspace::md5_hex;

/// Maximum accepted length for a request identifier.
pub const MAX_REQUEST_ID_LENGTH: usize = 128;

/// Default per-dispatch timeout applied when the request carries none.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Default retry budget applied when the request carries none.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors raised while validating a request document.
///
/// All of these are terminal: they produce an `error` response and the
/// request is never dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The `request_id` field is empty.
    #[error("request_id is empty")]
    EmptyRequestId,

    /// The `request_id` field exceeds the accepted length.
    #[error("request_id exceeds max length: {actual} > {max}")]
    RequestIdTooLong {
        /// Actual identifier length.
        actual: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// The filename stem does not equal the `request_id` field.
    #[error("filename stem `{stem}` does not match request_id `{request_id}`")]
    IdMismatch {
        /// Stem derived from the filename.
        stem: String,
        /// Identifier recorded inside the document.
        request_id: String,
    },

    /// The command string is outside the recognized set.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The unrecognized command string.
        command: String,
    },

    /// The params payload does not match the command's schema.
    #[error("invalid params for `{command}`: {detail}")]
    InvalidParams {
        /// Command the payload was for.
        command: &'static str,
        /// Parse failure detail.
        detail: String,
    },

    /// The request timestamp lies too far in the future.
    #[error("request timestamp is {skew_secs}s in the future (tolerance {tolerance_secs}s)")]
    FutureTimestamp {
        /// Observed forward skew in seconds.
        skew_secs: i64,
        /// Tolerated skew in seconds.
        tolerance_secs: i64,
    },

    /// The request is older than the accepted age window.
    #[error("request is {age_secs}s old (maximum {max_age_secs}s)")]
    StaleTimestamp {
        /// Observed age in seconds.
        age_secs: i64,
        /// Maximum accepted age in seconds.
        max_age_secs: i64,
    },

    /// `retry_count` exceeds `max_retries`.
    #[error("retry_count {retry_count} exceeds max_retries {max_retries}")]
    RetryBudgetExceeded {
        /// Recorded retry count.
        retry_count: u32,
        /// Recorded retry budget.
        max_retries: u32,
    },

    /// The optional prompt checksum does not match the prompt text.
    #[error("prompt checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Checksum recorded in the request.
        expected: String,
        /// Checksum computed from the prompt.
        computed: String,
    },
}

/// Assistant interaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantMode {
    /// Multi-step agentic mode.
    Agent,
    /// Single-turn chat mode.
    Chat,
}

impl std::fmt::Display for AssistantMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// The closed set of commands the broker recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Liveness probe; succeeds with `{"message": "pong"}`.
    Ping,
    /// Submits a prompt to the assistant. The optional mode is applied via a
    /// `setMode` dispatch before the prompt dispatch.
    SubmitPrompt {
        /// Prompt text handed to the assistant.
        prompt: String,
        /// Mode to apply before submission, if any.
        mode: Option<AssistantMode>,
    },
    /// Switches the assistant mode.
    SetMode {
        /// Target mode.
        mode: AssistantMode,
    },
    /// Reads the assistant's current model and mode.
    GetCurrentState,
    /// Writes a success response, then initiates broker shutdown.
    Shutdown,
}

impl Command {
    /// Returns the wire name of the command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SubmitPrompt { .. } => "submitPrompt",
            Self::SetMode { .. } => "setMode",
            Self::GetCurrentState => "getCurrentState",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitPromptParams {
    prompt: String,
    #[serde(default)]
    mode: Option<AssistantMode>,
}

#[derive(Debug, Deserialize)]
struct SetModeParams {
    mode: AssistantMode,
}

/// A request document as read from `requests/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen identifier; must equal the filename stem.
    pub request_id: String,

    /// Wire command name.
    pub command: String,

    /// Command-specific payload.
    #[serde(default)]
    pub params: Value,

    /// Wall-clock creation time (RFC3339).
    pub timestamp: DateTime<Utc>,

    /// Per-dispatch timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Retry budget override. Zero means single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Retries already attempted; set by the broker on re-emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Optional MD5 hex digest of the prompt text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Request {
    /// Resolves the typed command from the wire fields.
    pub fn parsed_command(&self) -> Result<Command, RequestError> {
        match self.command.as_str() {
            "ping" => Ok(Command::Ping),
            "submitPrompt" => {
                let params: SubmitPromptParams = serde_json::from_value(self.params.clone())
                    .map_err(|e| RequestError::InvalidParams {
                        command: "submitPrompt",
                        detail: e.to_string(),
                    })?;
                Ok(Command::SubmitPrompt {
                    prompt: params.prompt,
                    mode: params.mode,
                })
            },
            "setMode" => {
                let params: SetModeParams = serde_json::from_value(self.params.clone()).map_err(
                    |e| RequestError::InvalidParams {
                        command: "setMode",
                        detail: e.to_string(),
                    },
                )?;
                Ok(Command::SetMode { mode: params.mode })
            },
            "getCurrentState" => Ok(Command::GetCurrentState),
            "shutdown" => Ok(Command::Shutdown),
            other => Err(RequestError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }

    /// Validates identifier shape and filename binding.
    pub fn validate_identity(&self, stem: &str) -> Result<(), RequestError> {
        if self.request_id.is_empty() {
            return Err(RequestError::EmptyRequestId);
        }
        if self.request_id.len() > MAX_REQUEST_ID_LENGTH {
            return Err(RequestError::RequestIdTooLong {
                actual: self.request_id.len(),
                max: MAX_REQUEST_ID_LENGTH,
            });
        }
        if self.request_id != stem {
            return Err(RequestError::IdMismatch {
                stem: stem.to_string(),
                request_id: self.request_id.clone(),
            });
        }
        Ok(())
    }

    /// Validates timestamp sanity against the broker's clock policy.
    pub fn validate_timestamp(
        &self,
        now: DateTime<Utc>,
        max_age_secs: i64,
        skew_tolerance_secs: i64,
    ) -> Result<(), RequestError> {
        let skew = clock::skew_secs(now, self.timestamp);
        if skew > skew_tolerance_secs {
            return Err(RequestError::FutureTimestamp {
                skew_secs: skew,
                tolerance_secs: skew_tolerance_secs,
            });
        }
        let age = clock::age_secs(now, self.timestamp);
        if age > max_age_secs {
            return Err(RequestError::StaleTimestamp {
                age_secs: age,
                max_age_secs,
            });
        }
        Ok(())
    }

    /// Validates the retry bookkeeping and the optional prompt checksum.
    pub fn validate_budget_and_integrity(&self) -> Result<(), RequestError> {
        let retry_count = self.retry_count.unwrap_or(0);
        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if retry_count > max_retries {
            return Err(RequestError::RetryBudgetExceeded {
                retry_count,
                max_retries,
            });
        }

        if let Some(expected) = self.checksum.as_deref() {
            if let Ok(Command::SubmitPrompt { prompt, .. }) = self.parsed_command() {
                let computed = md5_hex(&prompt);
                if !computed.eq_ignore_ascii_case(expected) {
                    return Err(RequestError::ChecksumMismatch {
                        expected: expected.to_string(),
                        computed,
                    });
                }
            }
        }
        Ok(())
    }

    /// Effective timeout for a dispatch of this request.
    #[must_use]
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Effective retry budget. Zero means single attempt.
    #[must_use]
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// Retries already attempted; zero on first submission.
    #[must_use]
    pub fn effective_retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }
}

/// Derives the response filename stem for a request identifier.
///
/// A `req_` prefix is tolerated on input and stripped, matching the
/// documented client convention.
#[must_use]
pub fn response_stem(request_id: &str) -> &str {
    request_id.strip_prefix("req_").unwrap_or(request_id)
}
