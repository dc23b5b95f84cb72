//! Broker configuration.
//!
//! Keys are read once at broker start; the maintenance interval is re-read
//! each tick by the maintenance loop. The on-disk form is camelCase JSON to
//! match the editor settings surface the clients already use. Out-of-range
//! intervals are clamped, not rejected.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default base directory for the exchange tree.
pub const DEFAULT_BASE_DIRECTORY: &str = "/tmp/copilot-evaluation";

/// Clamp bounds for the watcher poll fallback interval (milliseconds).
pub const POLLING_INTERVAL_BOUNDS_MS: (u64, u64) = (100, 10_000);

/// Clamp bounds for the maintenance interval (milliseconds).
pub const MAINTENANCE_INTERVAL_BOUNDS_MS: (u64, u64) = (5_000, 300_000);

/// Log verbosity levels recognized in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operational logging.
    #[default]
    Info,
    /// Unexpected-but-recoverable conditions only.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Returns the level as a `tracing` filter directive.
    #[must_use]
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Broker configuration. Single source of truth for the base directory and
/// every interval the broker schedules against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Root of the exchange directory tree.
    pub base_directory: PathBuf,

    /// Whether the host should activate the broker on startup.
    pub auto_start: bool,

    /// Poll interval when no native filesystem watch is available.
    #[serde(rename = "pollingInterval")]
    pub polling_interval_ms: u64,

    /// Maintenance loop interval.
    #[serde(rename = "maintenanceInterval")]
    pub maintenance_interval_ms: u64,

    /// Log verbosity.
    pub log_level: LogLevel,

    /// Lock heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Delay after a watcher event before the file is trusted to be complete.
    pub settle_delay_ms: u64,

    /// Maximum requests processed concurrently. Zero selects a small
    /// multiple of the available workers.
    pub max_concurrency: usize,

    /// Default per-dispatch timeout when the request does not carry one.
    pub default_timeout_ms: u64,

    /// Default retry budget when the request does not carry one.
    pub default_max_retries: u32,

    /// Grace period past the deadline before an unresponsive dispatch is
    /// abandoned.
    pub dispatch_grace_secs: u64,

    /// Linear backoff base: the delay before retry N is `base * N`.
    pub retry_backoff_base_ms: u64,

    /// Upper bound on any single retry backoff delay.
    pub retry_backoff_cap_ms: u64,

    /// Maximum request age before it is rejected as stale.
    pub max_request_age_secs: i64,

    /// Tolerated forward clock skew on request timestamps.
    pub timestamp_skew_secs: i64,

    /// Idle threshold after which a recovered in-flight request is
    /// force-failed instead of resumed.
    pub stuck_threshold_secs: i64,

    /// Idle threshold after which maintenance force-fails a processing
    /// entry.
    pub force_fail_idle_secs: i64,

    /// Retention window for completed processing states.
    pub completed_retention_secs: i64,

    /// How long shutdown waits for in-flight dispatches to drain.
    pub shutdown_grace_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from(DEFAULT_BASE_DIRECTORY),
            auto_start: true,
            polling_interval_ms: 1_000,
            maintenance_interval_ms: 30_000,
            log_level: LogLevel::default(),
            heartbeat_interval_secs: 15,
            settle_delay_ms: 150,
            max_concurrency: 0,
            default_timeout_ms: 60_000,
            default_max_retries: 3,
            dispatch_grace_secs: 5,
            retry_backoff_base_ms: 2_000,
            retry_backoff_cap_ms: 30_000,
            max_request_age_secs: 86_400,
            timestamp_skew_secs: 60,
            stuck_threshold_secs: 300,
            force_fail_idle_secs: 600,
            completed_retention_secs: 3_600,
            shutdown_grace_secs: 10,
        }
    }
}

impl BrokerConfig {
    /// Returns a copy with every interval clamped into its documented range.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.polling_interval_ms = self
            .polling_interval_ms
            .clamp(POLLING_INTERVAL_BOUNDS_MS.0, POLLING_INTERVAL_BOUNDS_MS.1);
        self.maintenance_interval_ms = self.maintenance_interval_ms.clamp(
            MAINTENANCE_INTERVAL_BOUNDS_MS.0,
            MAINTENANCE_INTERVAL_BOUNDS_MS.1,
        );
        self
    }

    /// Resolves the effective concurrency cap.
    ///
    /// Zero means "pick for me": twice the available parallelism, at least
    /// two.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency > 0 {
            return self.max_concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_mul(2))
            .unwrap_or(4)
            .max(2)
    }
}
