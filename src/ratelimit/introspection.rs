//! Read-only usage reporting over the window store.
//!
//! Nothing here mutates windows. Reports are eventually consistent with
//! concurrent admissions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use super::clock::Clock;
use super::decision::iso8601;
use super::policy::Policy;
use super::store::{StoreSummary, WindowStore};
use super::window::{window_end, UsageWindow};
use crate::error::Result;

/// One identifier's standing under a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: String,
    pub window_ms: u64,
    pub last_request: Option<String>,
}

/// Wire form of [`StoreSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub total_users: u64,
    pub total_requests: u64,
    pub avg_requests_per_user: f64,
}

impl From<StoreSummary> for SummaryReport {
    fn from(summary: StoreSummary) -> Self {
        Self {
            total_users: summary.total_identifiers,
            total_requests: summary.total_requests,
            avg_requests_per_user: summary.average_requests_per_identifier,
        }
    }
}

/// One row of recent activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub identifier: String,
    pub count: u64,
    pub last_request: String,
}

impl From<UsageWindow> for ActivityEntry {
    fn from(window: UsageWindow) -> Self {
        Self {
            identifier: window.identifier,
            count: window.count,
            last_request: iso8601(window.last_request),
        }
    }
}

/// Usage across every identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub summary: SummaryReport,
    pub recent_activity: Vec<ActivityEntry>,
}

/// Reports usage from the window store.
pub struct UsageService {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl UsageService {
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current usage of `identifier` under `policy`.
    ///
    /// A missing or already elapsed window is reported as unused, with a
    /// fresh window starting now.
    #[instrument(skip(self, policy), fields(policy = %policy.name()))]
    pub async fn usage(&self, identifier: &str, policy: &Policy) -> Result<UsageReport> {
        let now = self.clock.now();
        let window = self.store.peek(identifier).await?;

        let (current_usage, window_start, last_request) = match window {
            Some(w) if !w.is_elapsed(policy.window(), now) => {
                (w.count, w.window_start, Some(w.last_request))
            }
            Some(w) => (0, now, Some(w.last_request)),
            None => (0, now, None),
        };

        Ok(report(policy, current_usage, window_start, last_request))
    }

    /// Totals plus the `recent_limit` most recently active windows.
    #[instrument(skip(self))]
    pub async fn global_stats(&self, recent_limit: usize) -> Result<GlobalStats> {
        let summary = self.store.summary().await?;
        let recent = self.store.recent(recent_limit).await?;

        Ok(GlobalStats {
            summary: summary.into(),
            recent_activity: recent.into_iter().map(ActivityEntry::from).collect(),
        })
    }
}

fn report(
    policy: &Policy,
    current_usage: u64,
    window_start: DateTime<Utc>,
    last_request: Option<DateTime<Utc>>,
) -> UsageReport {
    UsageReport {
        current_usage,
        limit: policy.quota(),
        remaining: policy.quota().saturating_sub(current_usage),
        reset_time: iso8601(window_end(window_start, policy.window())),
        window_ms: policy.window_ms(),
        last_request: last_request.map(iso8601),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::identifier::IdentifierStrategy;
    use crate::ratelimit::store::MemoryStore;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (UsageService, ManualClock, Arc<MemoryStore>, Policy) {
        let clock = ManualClock::new(t0());
        let store = Arc::new(MemoryStore::new());
        let service = UsageService::new(store.clone(), Arc::new(clock.clone()));
        let policy =
            Policy::new("general", Duration::from_secs(60), 10, IdentifierStrategy::Ip).unwrap();
        (service, clock, store, policy)
    }

    #[tokio::test]
    async fn test_usage_of_unknown_identifier() {
        let (service, _, _, policy) = setup();
        let report = service.usage("nobody", &policy).await.unwrap();

        assert_eq!(report.current_usage, 0);
        assert_eq!(report.remaining, 10);
        assert_eq!(report.window_ms, 60_000);
        assert_eq!(report.reset_time, "2024-05-01T12:01:00.000Z");
        assert_eq!(report.last_request, None);
    }

    #[tokio::test]
    async fn test_usage_reflects_live_window() {
        let (service, clock, store, policy) = setup();
        for _ in 0..3 {
            store
                .admit_and_count("10.0.0.1", policy.window(), policy.quota(), clock.now())
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let first = service.usage("10.0.0.1", &policy).await.unwrap();
        let second = service.usage("10.0.0.1", &policy).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.current_usage, 3);
        assert_eq!(first.remaining, 7);
        assert_eq!(first.reset_time, "2024-05-01T12:01:00.000Z");
        assert_eq!(first.last_request.as_deref(), Some("2024-05-01T12:00:02.000Z"));
        assert_eq!(store.peek("10.0.0.1").await.unwrap().unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_elapsed_window_reports_fresh_usage() {
        let (service, clock, store, policy) = setup();
        store
            .admit_and_count("10.0.0.1", policy.window(), policy.quota(), clock.now())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(90));
        let report = service.usage("10.0.0.1", &policy).await.unwrap();

        assert_eq!(report.current_usage, 0);
        assert_eq!(report.reset_time, "2024-05-01T12:02:30.000Z");
        assert_eq!(report.last_request.as_deref(), Some("2024-05-01T12:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_global_stats() {
        let (service, clock, store, policy) = setup();
        for id in ["a", "b", "b"] {
            store
                .admit_and_count(id, policy.window(), policy.quota(), clock.now())
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let stats = service.global_stats(10).await.unwrap();
        assert_eq!(stats.summary.total_users, 2);
        assert_eq!(stats.summary.total_requests, 3);
        assert_eq!(stats.summary.avg_requests_per_user, 1.5);
        assert_eq!(stats.recent_activity[0].identifier, "b");
        assert_eq!(stats.recent_activity[0].count, 2);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["summary"]["avgRequestsPerUser"].is_number());
        assert!(json["recentActivity"][0]["lastRequest"].is_string());
    }
}
