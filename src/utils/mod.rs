//! Utility functions.
//!
//! Formatting helpers shared by reports.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Humanized distance between `then` and `now`, e.g. `3days 4h`.
///
/// Only the two most significant units are kept; sub-second precision is dropped.
pub fn human_delta(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds().max(0) as u64;
    if seconds == 0 {
        return "0s".to_string();
    }

    humantime::format_duration(Duration::from_secs(seconds))
        .to_string()
        .split(' ')
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Timestamp in the `2024-01-31 18:04:05 UTC` form used in reports.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
