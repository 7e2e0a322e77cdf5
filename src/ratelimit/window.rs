//! Fixed-window usage records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage of one identifier in its current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// The identifier this window bills
    pub identifier: String,
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window began
    pub window_start: DateTime<Utc>,
    /// When the most recent request was counted
    pub last_request: DateTime<Utc>,
}

impl UsageWindow {
    /// A fresh window holding a single request at `now`.
    pub fn open(identifier: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            count: 1,
            window_start: now,
            last_request: now,
        }
    }

    /// Whether a window of length `window` starting at `window_start` has
    /// fully elapsed at `now`.
    pub fn is_elapsed(&self, window: Duration, now: DateTime<Utc>) -> bool {
        elapsed_since(self.window_start, now) >= window
    }

    /// When the current window ends.
    pub fn reset_at(&self, window: Duration) -> DateTime<Utc> {
        window_end(self.window_start, window)
    }

    /// Start a new window at `now` holding a single request.
    pub fn roll_over(&mut self, now: DateTime<Utc>) {
        self.count = 1;
        self.window_start = now;
        self.last_request = self.last_request.max(now);
    }

    /// Count one more request in the current window.
    ///
    /// `last_request` never moves backwards, even if the clock does.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.last_request = self.last_request.max(now);
    }

    /// Whether nothing has been counted since `now - retention`.
    pub fn is_idle(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        elapsed_since(self.last_request, now) >= retention
    }
}

/// Time between `earlier` and `now`, zero if `earlier` is in the future.
pub fn elapsed_since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// End of a window of length `window` starting at `start`.
pub fn window_end(start: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds since the Unix epoch.
pub fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Inverse of [`to_millis`].
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}
