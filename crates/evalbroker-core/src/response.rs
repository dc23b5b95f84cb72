//! Broker-authored response documents and the atomic response writer.
//!
//! Every terminal outcome becomes exactly one `responses/<id>.json`; terminal
//! failures are additionally mirrored into `failed/<id>.json` with a failure
//! reason for post-mortem and manual reprocessing. All writes go through the
//! atomic temp-and-rename protocol so a reader never observes a partial
//! document, and a response is never overwritten once it has appeared.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::fs_safe::{self, FsError, MAX_DOCUMENT_SIZE};
use crate::layout::Layout;
use crate::request::response_stem;

/// Terminal outcome classes. None of these are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    /// The dispatcher returned success.
    Success,
    /// The retry budget was exhausted without success.
    Failed,
    /// The request was invalid; no dispatch occurred.
    Error,
}

/// One dispatch attempt recorded in the response log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt ordinal.
    pub attempt: u32,
    /// Whether the dispatcher reported success.
    pub success: bool,
    /// Dispatcher payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure or timeout description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time the attempt concluded.
    pub timestamp: DateTime<Utc>,
}

/// A response document as published to `responses/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Identifier echoed from the request.
    pub request_id: String,
    /// Terminal outcome.
    pub final_status: FinalStatus,
    /// Ordered attempt log; empty for validation errors.
    pub attempts: Vec<Attempt>,
    /// Creation timestamp echoed from the request.
    pub request_timestamp: DateTime<Utc>,
    /// Wall-clock time the response was published.
    pub timestamp: DateTime<Utc>,
    /// Model reported by the dispatcher, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    /// Mode reported by the dispatcher, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_used: Option<String>,
    /// Length of the assistant output carried by the final attempt.
    pub response_length: u64,
    /// Wall-clock seconds from claim to terminal outcome.
    pub execution_time_s: f64,
}

/// The `failed/<id>.json` mirror: the response plus failure metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The mirrored terminal response.
    #[serde(flatten)]
    pub response: Response,
    /// Stable failure reason.
    pub failure_reason: String,
    /// Wall-clock time the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Measures the assistant output carried by a dispatcher payload.
///
/// A string-valued `response` or `message` field is measured directly;
/// any other payload is measured by its serialized length.
#[must_use]
pub fn data_length(data: Option<&Value>) -> u64 {
    match data {
        None => 0,
        Some(value) => {
            let text = value
                .get("response")
                .and_then(Value::as_str)
                .or_else(|| value.get("message").and_then(Value::as_str));
            match text {
                Some(text) => text.len() as u64,
                None => serde_json::to_string(value).map_or(0, |s| s.len() as u64),
            }
        },
    }
}

/// Atomic writer for responses and failure mirrors.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    layout: Layout,
}

impl ResponseWriter {
    /// Creates a writer over the exchange layout.
    #[must_use]
    pub const fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Publishes a response atomically.
    ///
    /// If a response for the same id already exists, the write is skipped:
    /// a published response is immutable.
    pub fn write_response(&self, response: &Response) -> Result<PathBuf, FsError> {
        let path = self
            .layout
            .response_file(response_stem(&response.request_id));
        if path.exists() {
            warn!(
                request_id = %response.request_id,
                path = %path.display(),
                "response already published; refusing to overwrite"
            );
            return Ok(path);
        }
        fs_safe::atomic_write_json(&path, response)?;
        Ok(path)
    }

    /// Mirrors a terminal failure into `failed/<id>.json`.
    pub fn write_failure_mirror(
        &self,
        response: &Response,
        failure_reason: impl Into<String>,
    ) -> Result<PathBuf, FsError> {
        let record = FailureRecord {
            response: response.clone(),
            failure_reason: failure_reason.into(),
            failed_at: Utc::now(),
        };
        let path = self.layout.failed_file(response_stem(&response.request_id));
        fs_safe::atomic_write_json(&path, &record)?;
        Ok(path)
    }

    /// Reads a previously published response, if one exists and parses.
    ///
    /// Absence and partial reads both yield `None`: readers treat them as
    /// "not yet".
    #[must_use]
    pub fn read_existing(&self, request_id: &str) -> Option<Response> {
        let path = self.layout.response_file(response_stem(request_id));
        if !path.exists() {
            return None;
        }
        fs_safe::bounded_read_json(&path, MAX_DOCUMENT_SIZE).ok()
    }
}
