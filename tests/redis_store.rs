//! Redis window store against a live server.
//!
//! Run with `REDIS_URL=redis://127.0.0.1/ cargo test --features redis -- --ignored`.

#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tollgate::ratelimit::store::{RedisStore, RedisStoreConfig};
use tollgate::ratelimit::{
    AdmissionEngine, Decision, Identifier, IdentifierStrategy, ManualClock, Policy, WindowStore,
};

async fn store(test: &str) -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let config = RedisStoreConfig {
        key_prefix: format!("tollgate-test:{}:{}:", test, std::process::id()),
        ..RedisStoreConfig::default()
    };
    RedisStore::connect_with_config(&url, config).await.unwrap()
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_redis_window_lifecycle() {
    let store = store("lifecycle").await;
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let window = Duration::from_secs(60);

    for expected in 1..=3 {
        let ticket = store.admit_and_count("10.0.0.1", window, 3, t0).await.unwrap();
        assert!(ticket.admitted);
        assert_eq!(ticket.count, expected);
        assert_eq!(ticket.window_start, t0);
    }

    let full = store.admit_and_count("10.0.0.1", window, 3, t0).await.unwrap();
    assert!(!full.admitted);
    assert_eq!(full.count, 3);

    store.decrement("10.0.0.1").await.unwrap();
    assert_eq!(store.peek("10.0.0.1").await.unwrap().unwrap().count, 2);

    let later = t0 + chrono::Duration::seconds(61);
    let fresh = store.admit_and_count("10.0.0.1", window, 3, later).await.unwrap();
    assert_eq!(fresh.count, 1);
    assert_eq!(fresh.window_start, later);

    let summary = store.summary().await.unwrap();
    assert_eq!(summary.total_identifiers, 1);
    assert_eq!(store.recent(10).await.unwrap()[0].identifier, "10.0.0.1");

    assert!(store.reset("10.0.0.1").await.unwrap());
    assert!(store.peek("10.0.0.1").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_redis_admission_is_atomic() {
    let store: Arc<dyn WindowStore> = Arc::new(store("atomic").await);
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    let engine = Arc::new(AdmissionEngine::new(store.clone()).with_clock(Arc::new(clock)));
    let policy = Arc::new(
        Policy::new("burst", Duration::from_secs(60), 20, IdentifierStrategy::Ip).unwrap(),
    );
    let identifier = Identifier::address("192.0.2.1").unwrap();

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let engine = engine.clone();
            let policy = policy.clone();
            let identifier = identifier.clone();
            tokio::spawn(async move { engine.decide(Some(&identifier), &policy).await })
        })
        .collect();

    let mut admitted = 0;
    for task in futures::future::join_all(tasks).await {
        if matches!(task.unwrap(), Decision::Admitted(_)) {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 20);
    store.reset("192.0.2.1").await.unwrap();
}
