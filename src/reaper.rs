use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::model::{JobState, Ms};
use crate::notify::{NotifyHub, SnipeEvent};
use crate::store::{JobStore, StoreError, WalStore};

/// Move terminal jobs older than `retention` to `Archived`. Their attempts and
/// bookings stay queryable.
pub async fn archive_expired(
    store: &dyn JobStore,
    hub: &NotifyHub,
    now: Ms,
    retention: Duration,
) -> Result<usize, StoreError> {
    let retention = retention.as_millis() as Ms;
    let mut archived = 0;
    for job in store.list_jobs(None).await? {
        if !job.state.is_terminal() || job.updated_at + retention > now {
            continue;
        }
        if store
            .transition_job(job.id, job.state, JobState::Archived, None, now)
            .await?
        {
            hub.send(SnipeEvent::JobTransitioned {
                job_id: job.id,
                from: job.state,
                to: JobState::Archived,
                at: now,
            });
            hub.remove(&job.id);
            archived += 1;
        }
    }
    Ok(archived)
}

/// Background task that periodically archives finished jobs.
pub async fn run_archiver(
    store: Arc<dyn JobStore>,
    hub: Arc<NotifyHub>,
    clock: SharedClock,
    retention: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        match archive_expired(store.as_ref(), &hub, clock.now_ms(), retention).await {
            Ok(0) => {}
            Ok(n) => info!("archived {n} finished jobs"),
            Err(e) => warn!("archive pass failed: {e}"),
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => debug!("compaction skipped: {e}"),
        }
    }
}
