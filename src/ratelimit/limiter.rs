//! Core admission engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::decision::{Decision, RateLimitInfo, Rejection, SkipReason};
use super::identifier::{Identifier, RequestOrigin};
use super::policy::Policy;
use super::store::{StoreError, WindowStore, WindowTicket};
use super::window::{elapsed_since, window_end};

/// Default upper bound for a single store operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Decides whether requests are admitted under a policy.
///
/// The engine holds no counters itself; every decision is one atomic
/// check-and-increment against the window store. Store failures and
/// timeouts fail open.
pub struct AdmissionEngine {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl AdmissionEngine {
    /// Create an engine over `store` using the system clock.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every store operation by `timeout`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Resolve the request's identifier under the policy and decide.
    pub async fn check(&self, origin: &RequestOrigin, policy: &Policy) -> Decision {
        let identifier = origin.resolve(policy.strategy());
        self.decide(identifier.as_ref(), policy).await
    }

    /// Decide for an already resolved identifier.
    ///
    /// `None` means the identifier could not be resolved; the store is not
    /// consulted and the request is let through.
    pub async fn decide(&self, identifier: Option<&Identifier>, policy: &Policy) -> Decision {
        let Some(identifier) = identifier else {
            return Decision::Skipped(SkipReason::IdentityUnresolvable);
        };

        let now = self.clock.now();

        trace!(
            identifier = %identifier,
            policy = %policy.name(),
            "Checking admission"
        );

        let ticket = match self
            .bounded(
                self.store
                    .admit_and_count(&identifier.key, policy.window(), policy.quota(), now),
            )
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    policy = %policy.name(),
                    error = %e,
                    "Window store failed; admitting request"
                );
                return Decision::Skipped(SkipReason::StoreUnavailable);
            }
        };

        self.to_decision(identifier, policy, ticket, now)
    }

    /// Give back the slot taken by an earlier admitted request.
    ///
    /// Best effort: failures are logged and dropped.
    pub async fn release(&self, identifier: &Identifier) {
        if let Err(e) = self.bounded(self.store.decrement(&identifier.key)).await {
            warn!(identifier = %identifier, error = %e, "Failed to release admission slot");
        }
    }

    async fn bounded<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                after: self.operation_timeout,
            }),
        }
    }

    fn to_decision(
        &self,
        identifier: &Identifier,
        policy: &Policy,
        ticket: WindowTicket,
        now: DateTime<Utc>,
    ) -> Decision {
        let reset_at = window_end(ticket.window_start, policy.window());

        if ticket.admitted {
            return Decision::Admitted(RateLimitInfo {
                limit: policy.quota(),
                remaining: policy.quota().saturating_sub(ticket.count),
                reset_at,
                kind: identifier.kind,
            });
        }

        let retry_after_secs = retry_after_secs(reset_at, now);

        debug!(
            identifier = %identifier,
            policy = %policy.name(),
            count = ticket.count,
            retry_after_secs = retry_after_secs,
            "Rate limit exceeded"
        );

        Decision::Rejected(Rejection {
            info: RateLimitInfo {
                limit: policy.quota(),
                remaining: 0,
                reset_at,
                kind: identifier.kind,
            },
            retry_after_secs,
            message: policy.message().to_string(),
        })
    }
}

/// Whole seconds, rounded up, from `now` until `reset_at`; at least 1.
fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = elapsed_since(now, reset_at).as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::identifier::{CallerIdentity, IdentifierKind, IdentifierStrategy};
    use crate::ratelimit::store::{MemoryStore, StoreSummary};
    use crate::ratelimit::window::UsageWindow;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn per_minute(quota: u64, strategy: IdentifierStrategy) -> Policy {
        Policy::new("test", Duration::from_secs(60), quota, strategy).unwrap()
    }

    fn engine_at(start: DateTime<Utc>) -> (AdmissionEngine, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(start);
        let store = Arc::new(MemoryStore::new());
        let engine = AdmissionEngine::new(store.clone()).with_clock(Arc::new(clock.clone()));
        (engine, clock, store)
    }

    /// Store whose every operation fails.
    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn admit_and_count(
            &self,
            _: &str,
            _: Duration,
            _: u64,
            _: DateTime<Utc>,
        ) -> Result<WindowTicket, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn decrement(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn peek(&self, _: &str) -> Result<Option<UsageWindow>, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn summary(&self) -> Result<StoreSummary, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn recent(&self, _: usize) -> Result<Vec<UsageWindow>, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn reset(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn purge_idle(&self, _: Duration, _: DateTime<Utc>) -> Result<usize, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
    }

    /// Store that never answers an admission.
    struct HangingStore(MemoryStore);

    #[async_trait]
    impl WindowStore for HangingStore {
        async fn admit_and_count(
            &self,
            _: &str,
            _: Duration,
            _: u64,
            _: DateTime<Utc>,
        ) -> Result<WindowTicket, StoreError> {
            std::future::pending().await
        }
        async fn decrement(&self, id: &str) -> Result<(), StoreError> {
            self.0.decrement(id).await
        }
        async fn peek(&self, id: &str) -> Result<Option<UsageWindow>, StoreError> {
            self.0.peek(id).await
        }
        async fn summary(&self) -> Result<StoreSummary, StoreError> {
            self.0.summary().await
        }
        async fn recent(&self, limit: usize) -> Result<Vec<UsageWindow>, StoreError> {
            self.0.recent(limit).await
        }
        async fn reset(&self, id: &str) -> Result<bool, StoreError> {
            self.0.reset(id).await
        }
        async fn purge_idle(&self, r: Duration, now: DateTime<Utc>) -> Result<usize, StoreError> {
            self.0.purge_idle(r, now).await
        }
    }

    #[tokio::test]
    async fn test_quota_sequence_then_rejection() {
        let (engine, clock, _) = engine_at(t0());
        let policy = per_minute(60, IdentifierStrategy::Ip);
        let origin = RequestOrigin::anonymous("203.0.113.9");

        for expected_remaining in (0..60).rev() {
            match engine.check(&origin, &policy).await {
                Decision::Admitted(info) => {
                    assert_eq!(info.remaining, expected_remaining);
                    assert_eq!(info.limit, 60);
                    assert_eq!(info.kind, IdentifierKind::Ip);
                }
                other => panic!("expected admission, got {:?}", other),
            }
            clock.advance(Duration::from_millis(500));
        }

        match engine.check(&origin, &policy).await {
            Decision::Rejected(rejection) => {
                assert_eq!(rejection.info.remaining, 0);
                assert!(rejection.retry_after_secs <= 60);
                assert_eq!(rejection.retry_after_secs, 30);
                assert_eq!(rejection.info.reset_at, t0() + chrono::Duration::seconds(60));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejections_do_not_consume_quota() {
        let (engine, _, store) = engine_at(t0());
        let policy = per_minute(2, IdentifierStrategy::Ip);
        let origin = RequestOrigin::anonymous("203.0.113.9");

        for _ in 0..5 {
            engine.check(&origin, &policy).await;
        }

        let usage = store.peek("203.0.113.9").await.unwrap().unwrap();
        assert_eq!(usage.count, 2);
    }

    #[tokio::test]
    async fn test_new_window_after_reset() {
        let (engine, clock, store) = engine_at(t0());
        let policy = per_minute(3, IdentifierStrategy::Ip);
        let origin = RequestOrigin::anonymous("203.0.113.9");

        for _ in 0..4 {
            engine.check(&origin, &policy).await;
        }

        clock.advance(Duration::from_secs(60));
        match engine.check(&origin, &policy).await {
            Decision::Admitted(info) => {
                assert_eq!(info.remaining, 2);
                assert_eq!(info.reset_at, t0() + chrono::Duration::seconds(120));
            }
            other => panic!("expected admission, got {:?}", other),
        }

        let usage = store.peek("203.0.113.9").await.unwrap().unwrap();
        assert_eq!(usage.window_start, t0() + chrono::Duration::seconds(60));
        assert_eq!(usage.count, 1);
    }

    #[tokio::test]
    async fn test_loopback_callers_share_a_window() {
        let (engine, _, store) = engine_at(t0());
        let policy = per_minute(10, IdentifierStrategy::Ip);

        engine.check(&RequestOrigin::anonymous("::1"), &policy).await;
        engine.check(&RequestOrigin::anonymous("127.0.0.1"), &policy).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.peek("localhost").await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_policies_on_one_store_share_a_window() {
        let (engine, _, store) = engine_at(t0());
        let general = per_minute(100, IdentifierStrategy::Ip);
        let login = Policy::new("login", Duration::from_secs(60), 2, IdentifierStrategy::Ip).unwrap();
        let origin = RequestOrigin::anonymous("198.51.100.30");

        engine.check(&origin, &general).await;
        engine.check(&origin, &general).await;
        assert!(!engine.check(&origin, &login).await.is_admitted());

        let (separate, _, _) = engine_at(t0());
        assert!(separate.check(&origin, &login).await.is_admitted());
        assert_eq!(store.peek("198.51.100.30").await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_hybrid_bills_user_and_address_separately() {
        let (engine, _, store) = engine_at(t0());
        let policy = per_minute(10, IdentifierStrategy::Hybrid);
        let anonymous = RequestOrigin::anonymous("198.51.100.20");
        let authed = anonymous.clone().with_caller(CallerIdentity::new("user-1"));

        let a = engine.check(&anonymous, &policy).await;
        let b = engine.check(&authed, &policy).await;

        assert_eq!(a.info().unwrap().kind, IdentifierKind::Ip);
        assert_eq!(b.info().unwrap().kind, IdentifierKind::Token);
        assert_eq!(store.peek("198.51.100.20").await.unwrap().unwrap().count, 1);
        assert_eq!(store.peek("user-1").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_identity_is_skipped() {
        let (engine, _, store) = engine_at(t0());
        let policy = per_minute(1, IdentifierStrategy::Token);

        let decision = engine
            .check(&RequestOrigin::anonymous("198.51.100.20"), &policy)
            .await;

        assert_eq!(decision, Decision::Skipped(SkipReason::IdentityUnresolvable));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let engine = AdmissionEngine::new(Arc::new(DownStore));
        let policy = per_minute(1, IdentifierStrategy::Ip);
        let origin = RequestOrigin::anonymous("198.51.100.20");

        for _ in 0..3 {
            let decision = engine.check(&origin, &policy).await;
            assert_eq!(decision, Decision::Skipped(SkipReason::StoreUnavailable));
            assert!(decision.info().is_none());
        }

        // Release swallows the failure.
        engine
            .release(&Identifier::address("198.51.100.20").unwrap())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_open() {
        let engine = AdmissionEngine::new(Arc::new(HangingStore(MemoryStore::new())))
            .with_operation_timeout(Duration::from_millis(50));
        let policy = per_minute(1, IdentifierStrategy::Ip);

        let decision = engine
            .check(&RequestOrigin::anonymous("198.51.100.20"), &policy)
            .await;

        assert_eq!(decision, Decision::Skipped(SkipReason::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_release_returns_a_slot() {
        let (engine, _, _) = engine_at(t0());
        let policy = per_minute(1, IdentifierStrategy::Ip);
        let origin = RequestOrigin::anonymous("198.51.100.20");
        let identifier = origin.resolve(policy.strategy()).unwrap();

        assert!(engine.check(&origin, &policy).await.is_admitted());
        assert!(!engine.check(&origin, &policy).await.is_admitted());

        engine.release(&identifier).await;
        assert!(engine.check(&origin, &policy).await.is_admitted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_match_quota() {
        let (engine, _, _) = engine_at(t0());
        let engine = Arc::new(engine);
        let policy = Arc::new(per_minute(40, IdentifierStrategy::Ip));
        let total = 150;

        let handles: Vec<_> = (0..total)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let policy = Arc::clone(&policy);
                tokio::spawn(async move {
                    engine
                        .check(&RequestOrigin::anonymous("192.0.2.1"), &policy)
                        .await
                })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let admitted = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Admitted(_)))
            .count();
        let rejected = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Rejected(_)))
            .count();

        assert_eq!(admitted, 40);
        assert_eq!(rejected, total - 40);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let reset = t0() + chrono::Duration::seconds(60);
        assert_eq!(retry_after_secs(reset, t0()), 60);
        assert_eq!(
            retry_after_secs(reset, t0() + chrono::Duration::milliseconds(59_001)),
            1
        );
        assert_eq!(
            retry_after_secs(reset, t0() + chrono::Duration::milliseconds(30_500)),
            30
        );
        assert_eq!(retry_after_secs(reset, reset), 1);
    }
}
