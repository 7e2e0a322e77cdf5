//! Background retention sweep.
//!
//! Windows of one-off callers would otherwise accumulate forever. The sweeper
//! periodically drops every window with no counted request inside the
//! retention horizon, regardless of any policy's window length.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::WindowStore;
use crate::ratelimit::clock::Clock;

/// Handle to a running retention sweep task.
pub struct RetentionSweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RetentionSweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep runs one `interval` after spawning.
    pub fn spawn(
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut signal) = watch::channel(false);

        info!(
            retention_secs = retention.as_secs(),
            interval_secs = interval.as_secs(),
            "Starting retention sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep_once(store.as_ref(), clock.as_ref(), retention).await;
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Retention sweeper stopped");
        });

        Self { shutdown, task }
    }

    /// Stop the sweep loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Retention sweeper task failed");
        }
    }
}

/// Run a single sweep, logging instead of propagating store failures.
pub async fn sweep_once(store: &dyn WindowStore, clock: &dyn Clock, retention: Duration) -> usize {
    match store.purge_idle(retention, clock.now()).await {
        Ok(removed) => {
            if removed > 0 {
                debug!(removed = removed, "Purged idle usage windows");
            }
            removed
        }
        Err(e) => {
            warn!(error = %e, "Retention sweep failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_sweep_once_removes_idle_windows() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = MemoryStore::new();

        store
            .admit_and_count("idle", Duration::from_secs(60), 10, start)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1800));
        store
            .admit_and_count("active", Duration::from_secs(60), 10, clock.now())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(1800));
        assert_eq!(sweep_once(&store, &clock, HOUR).await, 1);
        assert_eq!(store.len(), 1);
        assert!(store.peek("active").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_and_stops() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = Arc::new(MemoryStore::new());

        store
            .admit_and_count("idle", Duration::from_secs(60), 10, start)
            .await
            .unwrap();
        clock.advance(HOUR * 2);

        let sweeper = RetentionSweeper::spawn(
            store.clone(),
            Arc::new(clock.clone()),
            HOUR,
            Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());

        sweeper.shutdown().await;
    }
}
