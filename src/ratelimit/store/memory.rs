//! In-process [`WindowStore`] backed by a sharded concurrent map.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{StoreError, StoreSummary, WindowStore, WindowTicket};
use crate::ratelimit::window::UsageWindow;

/// Window store that keeps every window in memory.
///
/// Each identifier's window is mutated under its shard's entry guard, so
/// check-and-increment is atomic per identifier even across worker threads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, UsageWindow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of windows currently held.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Remove every window.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn admit_and_count(
        &self,
        identifier: &str,
        window: Duration,
        quota: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowTicket, StoreError> {
        let ticket = match self.windows.entry(identifier.to_string()) {
            Entry::Vacant(vacant) => {
                debug!(identifier = %identifier, "Opening usage window");
                let usage = vacant.insert(UsageWindow::open(identifier, now));
                WindowTicket {
                    admitted: true,
                    count: usage.count,
                    window_start: usage.window_start,
                }
            }
            Entry::Occupied(mut occupied) => {
                let usage = occupied.get_mut();
                let admitted = if usage.is_elapsed(window, now) {
                    trace!(identifier = %identifier, "Rolling usage window over");
                    usage.roll_over(now);
                    true
                } else if usage.count >= quota {
                    false
                } else {
                    usage.record(now);
                    true
                };

                WindowTicket {
                    admitted,
                    count: usage.count,
                    window_start: usage.window_start,
                }
            }
        };

        Ok(ticket)
    }

    async fn decrement(&self, identifier: &str) -> Result<(), StoreError> {
        if let Some(mut usage) = self.windows.get_mut(identifier) {
            usage.count = usage.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn peek(&self, identifier: &str) -> Result<Option<UsageWindow>, StoreError> {
        Ok(self.windows.get(identifier).map(|usage| usage.clone()))
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let (identifiers, requests) = self
            .windows
            .iter()
            .fold((0u64, 0u64), |(identifiers, requests), usage| {
                (identifiers + 1, requests.saturating_add(usage.count))
            });

        Ok(StoreSummary::from_totals(identifiers, requests))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<UsageWindow>, StoreError> {
        let mut windows: Vec<UsageWindow> =
            self.windows.iter().map(|usage| usage.value().clone()).collect();

        windows.sort_by(|a, b| b.last_request.cmp(&a.last_request));
        windows.truncate(limit);

        Ok(windows)
    }

    async fn reset(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.windows.remove(identifier).is_some())
    }

    async fn purge_idle(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.windows.retain(|_, usage| {
            let keep = !usage.is_idle(retention, now);
            if !keep {
                removed += 1;
            }
            keep
        });

        Ok(removed)
    }
}
