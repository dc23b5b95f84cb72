//! Time sources for the broker.
//!
//! Monotonic time ([`std::time::Instant`]) drives timeouts, backoffs, and
//! heartbeat scheduling; wall time ([`chrono::Utc`]) is used only for request
//! age checks and user-facing timestamps. Wall time is observational and may
//! jump; elapsed-time comparisons on wall clocks saturate at zero so a
//! backwards jump never produces a negative age.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Returns the current wall-clock time.
#[must_use]
pub fn wall_now() -> DateTime<Utc> {
    Utc::now()
}

/// Returns the age of `timestamp` relative to `now`, saturating at zero.
///
/// A future-dated timestamp yields a zero age; future-dating is detected
/// separately via [`skew_secs`].
#[must_use]
pub fn age_secs(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> i64 {
    (now - timestamp).num_seconds().max(0)
}

/// Returns how far `timestamp` lies in the future of `now`, in seconds.
///
/// Zero when the timestamp is not future-dated.
#[must_use]
pub fn skew_secs(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> i64 {
    (timestamp - now).num_seconds().max(0)
}

/// Shifts a wall-clock time backwards by whole seconds.
///
/// Used by maintenance retention checks; saturates on overflow.
#[must_use]
pub fn secs_before(instant: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    instant - ChronoDuration::seconds(secs)
}
