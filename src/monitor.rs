use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use crate::cache::{AvailabilityCache, RefreshReport, run_poller};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::model::*;
use crate::notify::{NotifyHub, SnipeEvent};
use crate::reaper::{run_archiver, run_compactor};
use crate::runs::consecutive_windows;
use crate::scheduler::{Executor, ExecutorSettings, Scheduler, SchedulerSettings, SnipeError};
use crate::store::{AccountStats, JobStore, StoreError, WalStore, stats};
use crate::vendor::{VendorClient, VendorError, with_timeout};

/// How often the archiver and compactor wake up.
const MAINTENANCE_EVERY: Duration = Duration::from_secs(60);

/// The slot monitor and snipe scheduler as one handle.
///
/// Owns the cache, the store, the scheduler and its executor, and the background
/// tasks (poller, dispatch loop, archiver, compactor) started by [`start`].
///
/// [`start`]: SlotMonitor::start
pub struct SlotMonitor {
    config: Config,
    store: Arc<dyn JobStore>,
    /// Set when the store is the WAL-backed one, so it can be compacted.
    wal_store: Option<Arc<WalStore>>,
    vendor: Arc<dyn VendorClient>,
    cache: Arc<AvailabilityCache>,
    hub: Arc<NotifyHub>,
    clock: SharedClock,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    background: Mutex<JoinSet<()>>,
}

impl SlotMonitor {
    /// Open (or create) the WAL under `config.data_dir` and wire everything to it.
    pub fn open(config: Config, vendor: Arc<dyn VendorClient>, clock: SharedClock) -> io::Result<Self> {
        let config = config.validated();
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(WalStore::open(&config.wal_path())?);
        let mut monitor = Self::new(config, store.clone(), vendor, clock);
        monitor.wal_store = Some(store);
        Ok(monitor)
    }

    /// Wire a monitor over any store. No compaction runs for non-WAL stores.
    pub fn new(config: Config, store: Arc<dyn JobStore>, vendor: Arc<dyn VendorClient>, clock: SharedClock) -> Self {
        let config = config.validated();
        let hub = Arc::new(NotifyHub::new());
        let cache = Arc::new(AvailabilityCache::new(
            vendor.clone(),
            clock.clone(),
            config.cache_ttl,
            config.vendor_timeout,
        ));
        let executor = Arc::new(Executor::new(
            vendor.clone(),
            store.clone(),
            cache.clone(),
            hub.clone(),
            clock.clone(),
            ExecutorSettings::from(&config),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            cache.clone(),
            executor,
            hub.clone(),
            clock.clone(),
            SchedulerSettings::from(&config),
        ));
        Self {
            config,
            store,
            wal_store: None,
            vendor,
            cache,
            hub,
            clock,
            scheduler,
            shutdown: CancellationToken::new(),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<AvailabilityCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Resolve jobs left behind by a previous process, then start the
    /// background tasks. Returns how many interrupted dispatches were closed.
    pub async fn start(&self) -> Result<usize, SnipeError> {
        let recovered = self.scheduler.recover().await?;
        let mut background = self.background.lock().await;

        background.spawn(run_poller(
            self.cache.clone(),
            self.config.poll_interval,
            self.shutdown.child_token(),
        ));
        background.spawn(self.scheduler.clone().run(self.shutdown.child_token()));
        background.spawn(run_archiver(
            self.store.clone(),
            self.hub.clone(),
            self.clock.clone(),
            self.config.archive_retention,
            MAINTENANCE_EVERY,
            self.shutdown.child_token(),
        ));
        if let Some(store) = &self.wal_store {
            background.spawn(run_compactor(
                store.clone(),
                self.config.compact_threshold,
                MAINTENANCE_EVERY,
                self.shutdown.child_token(),
            ));
        }
        info!(recovered, "slot monitor started");
        Ok(recovered)
    }

    /// Stop the background tasks and give running dispatches up to `drain` to
    /// finish before cancelling them.
    pub async fn shutdown(&self, drain: Duration) {
        self.shutdown.cancel();
        let mut background = std::mem::take(&mut *self.background.lock().await);
        while background.join_next().await.is_some() {}

        if tokio::time::timeout(drain, self.scheduler.join_running())
            .await
            .is_err()
        {
            warn!("drain deadline reached, cancelling running snipes");
            self.scheduler.cancel_running().await;
        }
        info!("slot monitor stopped");
    }

    // ── Snipes ───────────────────────────────────────────────

    pub async fn schedule_snipe(&self, spec: SnipeSpec) -> Result<JobId, SnipeError> {
        self.scheduler.schedule(spec).await
    }

    /// Cancel a snipe and return the state it ended in. A job that already
    /// finished keeps its outcome.
    pub async fn cancel_snipe(&self, id: JobId) -> Result<JobState, SnipeError> {
        self.scheduler.cancel(id).await
    }

    pub async fn job(&self, id: JobId) -> Result<SnipeJob, SnipeError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn jobs(&self, state: Option<JobState>) -> Result<Vec<SnipeJob>, SnipeError> {
        Ok(self.store.list_jobs(state).await?)
    }

    pub async fn attempts(&self, job_id: JobId) -> Result<Vec<AttemptRecord>, SnipeError> {
        Ok(self.store.attempts_for_job(job_id).await?)
    }

    // ── Availability ─────────────────────────────────────────

    pub async fn get_cached_availability(&self, location: &str, sub_location: &str, date: NaiveDate) -> Vec<CachedSlot> {
        self.cache
            .read(&DayKey::new(location, sub_location, date))
            .await
    }

    pub async fn refresh_availability(
        &self,
        location: &str,
        sub_location: &str,
        date: NaiveDate,
    ) -> Result<RefreshReport, SnipeError> {
        Ok(self
            .cache
            .refresh(&DayKey::new(location, sub_location, date))
            .await?)
    }

    /// Every `consecutive_hours`-slot window of bookable back-to-back slots over
    /// fresh entries, earliest start first, then most remaining capacity.
    /// Windows inside a longer run overlap; callers pick among them.
    pub async fn find_consecutive_runs(
        &self,
        location: &str,
        sub_location: &str,
        date: NaiveDate,
        consecutive_hours: u32,
    ) -> Vec<Vec<SlotAvailability>> {
        let fresh = self
            .cache
            .read_fresh(&DayKey::new(location, sub_location, date))
            .await;
        consecutive_windows(&fresh, consecutive_hours as usize)
    }

    // ── Events ───────────────────────────────────────────────

    pub fn register_callback<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SnipeEvent) + Send + 'static,
    {
        self.hub.register_callback(callback)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnipeEvent> {
        self.hub.subscribe()
    }

    pub fn subscribe_job(&self, job_id: JobId) -> broadcast::Receiver<SnipeEvent> {
        self.hub.subscribe_job(job_id)
    }

    // ── Accounts ─────────────────────────────────────────────

    pub async fn add_account(&self, username: &str, credentials_ref: &str) -> Result<Account, SnipeError> {
        let account = Account {
            id: Ulid::new(),
            username: username.to_string(),
            credentials_ref: credentials_ref.to_string(),
            active: true,
            created_at: self.clock.now_ms(),
        };
        self.store.add_account(account.clone()).await?;
        info!(account_id = %account.id, username, "account added");
        Ok(account)
    }

    /// Deactivated accounts are skipped by dispatches and refused by `schedule_snipe`.
    pub async fn deactivate_account(&self, id: AccountId) -> Result<(), SnipeError> {
        self.store.set_account_active(id, false).await?;
        info!(account_id = %id, "account deactivated");
        Ok(())
    }

    pub async fn accounts(&self, active_only: bool) -> Result<Vec<Account>, SnipeError> {
        Ok(self.store.list_accounts(active_only).await?)
    }

    pub async fn can_account_book(&self, account: AccountId, slot: &SlotKey) -> Result<bool, SnipeError> {
        Ok(self.store.can_account_book(account, slot).await?)
    }

    pub async fn account_statistics(&self, id: AccountId) -> Result<AccountStats, SnipeError> {
        Ok(stats::account_statistics(self.store.as_ref(), id).await?)
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn bookings_for_account(&self, id: AccountId) -> Result<Vec<Booking>, SnipeError> {
        Ok(self.store.bookings_for_account(id).await?)
    }

    /// Release a booking at the facility and mark it cancelled. A booking the
    /// facility no longer knows about counts as released.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, SnipeError> {
        let booking = self.store.get_booking(id).await?;
        if !booking.status.is_live() {
            return Err(StoreError::BookingClosed {
                id,
                status: booking.status,
            }
            .into());
        }
        if let Some(external_ref) = &booking.external_ref {
            let account = self.store.get_account(booking.account_id).await?;
            let timeout = self.config.vendor_timeout;
            let session = with_timeout(timeout, self.vendor.authenticate(&account)).await?;
            match with_timeout(timeout, self.vendor.cancel_booking(&session, external_ref)).await {
                Ok(()) => {}
                Err(VendorError::NotFound) => {
                    warn!(booking_id = %id, %external_ref, "facility has no such booking; marking cancelled");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let cancelled = self
            .store
            .set_booking_status(id, BookingStatus::Cancelled, self.clock.now_ms())
            .await?;
        info!(booking_id = %id, slot = %cancelled.slot, "booking cancelled");
        Ok(cancelled)
    }

    /// Record a status reported out of band (e.g. the facility confirmed or
    /// dropped a booking).
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, SnipeError> {
        Ok(self
            .store
            .set_booking_status(id, status, self.clock.now_ms())
            .await?)
    }
}
