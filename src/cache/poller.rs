use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AvailabilityCache;

/// Background task that keeps every watched day fresh.
pub async fn run_poller(cache: Arc<AvailabilityCache>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        poll_once(&cache).await;
    }
}

/// Refresh all watched days concurrently. Returns how many refreshes failed.
pub async fn poll_once(cache: &AvailabilityCache) -> usize {
    let days = cache.watched_days();
    let results = join_all(days.iter().map(|day| cache.refresh(day))).await;
    let mut failed = 0;
    for (day, result) in days.iter().zip(results) {
        match result {
            Ok(report) => debug!(day = %day, upserted = report.upserted, "polled"),
            Err(e) => {
                failed += 1;
                warn!(day = %day, "poll failed, keeping last-known-good: {e}");
            }
        }
    }
    metrics::gauge!(crate::observability::CACHE_ENTRIES).set(cache.entry_count() as f64);
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::DayKey;
    use crate::vendor::SimulatedVendor;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn poll_refreshes_only_watched_days() {
        let sim = Arc::new(SimulatedVendor::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = AvailabilityCache::new(sim.clone(), clock, Duration::from_secs(60), Duration::from_secs(1));

        let watched = DayKey::new("Fitness", "main", NaiveDate::from_ymd_opt(2025, 11, 18).unwrap());
        let ignored = DayKey::new("Fitness", "main", NaiveDate::from_ymd_opt(2025, 11, 19).unwrap());
        sim.add_hourly(&watched, 7, 10, 30);
        sim.add_hourly(&ignored, 7, 10, 30);
        cache.watch(&watched);

        assert_eq!(poll_once(&cache).await, 0);
        assert_eq!(cache.read(&watched).await.len(), 3);
        assert!(cache.read(&ignored).await.is_empty());
    }

    #[tokio::test]
    async fn poll_counts_failures() {
        let sim = Arc::new(SimulatedVendor::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = AvailabilityCache::new(sim.clone(), clock, Duration::from_secs(60), Duration::from_secs(1));
        let day = DayKey::new("X1", "B", NaiveDate::from_ymd_opt(2025, 11, 18).unwrap());
        cache.watch(&day);
        sim.fail_fetches(1);
        assert_eq!(poll_once(&cache).await, 1);
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let sim = Arc::new(SimulatedVendor::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = Arc::new(AvailabilityCache::new(sim, clock, Duration::from_secs(60), Duration::from_secs(1)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_poller(cache, Duration::from_millis(10), shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller should exit")
            .unwrap();
    }
}
