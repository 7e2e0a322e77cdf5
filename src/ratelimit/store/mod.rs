//! Window counter storage.
//!
//! The store exclusively owns [`UsageWindow`] lifecycle. Every mutation is a
//! single atomic operation per identifier; callers never read a window and
//! write it back separately.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod sweeper;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use sweeper::RetentionSweeper;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::window::UsageWindow;

/// Errors produced by [`WindowStore`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("Window store unavailable: {message}")]
    Unavailable { message: String },

    /// The operation did not complete in time.
    #[error("Window store operation timed out after {after:?}")]
    Timeout { after: Duration },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::unavailable(err.to_string())
    }
}

/// Outcome of an atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTicket {
    /// Whether the request was counted
    pub admitted: bool,
    /// Count after the operation
    pub count: u64,
    /// Start of the window the count belongs to
    pub window_start: DateTime<Utc>,
}

/// Aggregate figures across all live windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub total_identifiers: u64,
    pub total_requests: u64,
    /// Mean requests per identifier, rounded to two decimals
    pub average_requests_per_identifier: f64,
}

impl StoreSummary {
    /// Build a summary from raw totals.
    pub fn from_totals(total_identifiers: u64, total_requests: u64) -> Self {
        let average = if total_identifiers == 0 {
            0.0
        } else {
            let raw = total_requests as f64 / total_identifiers as f64;
            (raw * 100.0).round() / 100.0
        };

        Self {
            total_identifiers,
            total_requests,
            average_requests_per_identifier: average,
        }
    }
}

/// Keyed storage of usage windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Count a request against `identifier` unless its live window is full.
    ///
    /// Atomically:
    /// - no window, or a window at least `window` old: start a new window at
    ///   `now` with a count of 1;
    /// - a live window whose count has reached `quota`: change nothing and
    ///   report `admitted = false`;
    /// - otherwise increment the count.
    async fn admit_and_count(
        &self,
        identifier: &str,
        window: Duration,
        quota: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowTicket, StoreError>;

    /// Give back one request. Never goes below zero; no-op when absent.
    async fn decrement(&self, identifier: &str) -> Result<(), StoreError>;

    /// Read a window without touching it.
    async fn peek(&self, identifier: &str) -> Result<Option<UsageWindow>, StoreError>;

    /// Totals across all windows.
    async fn summary(&self) -> Result<StoreSummary, StoreError>;

    /// Up to `limit` windows, most recently active first.
    async fn recent(&self, limit: usize) -> Result<Vec<UsageWindow>, StoreError>;

    /// Drop the window of `identifier`. Returns whether one existed.
    async fn reset(&self, identifier: &str) -> Result<bool, StoreError>;

    /// Drop windows with no counted request since `now - retention`.
    /// Returns how many were removed.
    async fn purge_idle(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}
