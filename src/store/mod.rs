mod error;
pub mod stats;
#[cfg(test)]
mod tests;

pub use error::StoreError;
pub use stats::{AccountStats, AttemptStats};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::{MAX_CREDENTIALS_REF_LEN, MAX_NAME_LEN};
use crate::model::*;
use crate::wal::Wal;

pub type SharedJob = Arc<RwLock<SnipeJob>>;

const MAX_PERSIST_BACKOFF: Duration = Duration::from_secs(5);
const MIN_PERSIST_BACKOFF: Duration = Duration::from_millis(1);

/// Durable home of accounts, jobs, attempts and bookings.
///
/// `transition_job` is a compare-and-set: it only moves a job that is still in
/// `from`, and returns `false` (without writing anything) when another caller got
/// there first. `append_attempt` is idempotent on the attempt key and derives the
/// booking for a successful attempt in the same write.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn add_account(&self, account: Account) -> Result<(), StoreError>;
    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<(), StoreError>;
    async fn get_account(&self, id: AccountId) -> Result<Account, StoreError>;
    async fn list_accounts(&self, active_only: bool) -> Result<Vec<Account>, StoreError>;

    async fn insert_job(&self, job: SnipeJob) -> Result<(), StoreError>;
    async fn get_job(&self, id: JobId) -> Result<SnipeJob, StoreError>;
    /// All jobs, optionally filtered by state, ordered by scheduled time.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<SnipeJob>, StoreError>;
    async fn armed_jobs_due_before(&self, deadline: Ms) -> Result<Vec<SnipeJob>, StoreError>;
    async fn transition_job(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        summary: Option<JobSummary>,
        at: Ms,
    ) -> Result<bool, StoreError>;

    /// `Ok(false)` means the key was already logged and nothing changed.
    async fn append_attempt(&self, record: AttemptRecord) -> Result<bool, StoreError>;
    async fn attempts_for_job(&self, id: JobId) -> Result<Vec<AttemptRecord>, StoreError>;
    async fn attempts_for_account(&self, id: AccountId) -> Result<Vec<AttemptRecord>, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError>;
    async fn bookings_for_account(&self, id: AccountId) -> Result<Vec<Booking>, StoreError>;
    async fn live_booking(&self, account: AccountId, slot: &SlotKey) -> Result<Option<Booking>, StoreError>;
    async fn set_booking_status(&self, id: Ulid, status: BookingStatus, at: Ms) -> Result<Booking, StoreError>;

    /// An active account with no live booking on `slot`.
    async fn can_account_book(&self, account: AccountId, slot: &SlotKey) -> Result<bool, StoreError> {
        let account_row = self.get_account(account).await?;
        Ok(account_row.active && self.live_booking(account, slot).await?.is_none())
    }
}

/// Run `op` until it stops failing with a persistence error, backing off
/// exponentially between tries. Any other error is returned at once.
pub async fn retry_persist<T, F, Fut>(what: &str, base: Duration, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = base.clamp(MIN_PERSIST_BACKOFF, MAX_PERSIST_BACKOFF);
    loop {
        match op().await {
            Err(e) if e.is_persistence() => {
                warn!("{what} failed, retrying in {delay:?}: {e}");
                metrics::counter!(crate::observability::STORE_RETRIES_TOTAL).increment(1);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_PERSIST_BACKOFF);
            }
            other => return other,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<Pending> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so the partial batch does not leak into
    // the next one; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

fn apply_transition(job: &mut SnipeJob, event: &Event) {
    if let Event::JobTransitioned { to, summary, at, .. } = event {
        job.state = *to;
        if let Some(summary) = summary {
            job.summary = Some(summary.clone());
        }
        job.updated_at = *at;
    }
}

/// In-memory store rebuilt from, and persisted to, a write-ahead log.
pub struct WalStore {
    accounts: DashMap<AccountId, Account>,
    usernames: DashMap<String, AccountId>,
    jobs: DashMap<JobId, SharedJob>,
    /// Armed jobs → scheduled execution, for the dispatch reload.
    armed: DashMap<JobId, Ms>,
    attempts: DashMap<JobId, Vec<AttemptRecord>>,
    attempt_keys: DashSet<(JobId, AccountId, u32)>,
    bookings: DashMap<Ulid, Booking>,
    /// (account, slot) → the account's live booking on that slot.
    live: DashMap<(AccountId, SlotKey), Ulid>,
    account_bookings: DashMap<AccountId, Vec<Ulid>>,
    /// Serializes check-then-write for accounts, jobs, attempts and bookings.
    ledger: Mutex<()>,
    /// Shared by every write, exclusive during compaction.
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay `path` and start the group-commit writer. Must run inside a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            accounts: DashMap::new(),
            usernames: DashMap::new(),
            jobs: DashMap::new(),
            armed: DashMap::new(),
            attempts: DashMap::new(),
            attempt_keys: DashSet::new(),
            bookings: DashMap::new(),
            live: DashMap::new(),
            account_bookings: DashMap::new(),
            ledger: Mutex::new(()),
            gate: RwLock::new(()),
            wal_tx,
        };

        let mut jobs: HashMap<JobId, SnipeJob> = HashMap::new();
        for event in &events {
            match event {
                Event::JobCreated { job } => {
                    jobs.insert(job.id, job.clone());
                }
                Event::JobTransitioned { id, .. } => {
                    if let Some(job) = jobs.get_mut(id) {
                        apply_transition(job, event);
                    }
                }
                other => store.apply_ledger(other),
            }
        }
        for (id, job) in jobs {
            store.index_armed(&job);
            store.jobs.insert(id, Arc::new(RwLock::new(job)));
        }
        if !events.is_empty() {
            info!(events = events.len(), path = %path.display(), "store replayed");
        }
        Ok(store)
    }

    fn index_armed(&self, job: &SnipeJob) {
        if job.state == JobState::Armed {
            self.armed.insert(job.id, job.scheduled_execution);
        } else {
            self.armed.remove(&job.id);
        }
    }

    fn insert_booking(&self, booking: Booking) {
        if self.bookings.contains_key(&booking.id) {
            return;
        }
        if booking.status.is_live() {
            self.live
                .insert((booking.account_id, booking.slot.clone()), booking.id);
        }
        self.account_bookings
            .entry(booking.account_id)
            .or_default()
            .push(booking.id);
        self.bookings.insert(booking.id, booking);
    }

    /// Apply a non-job event. Job events go through the job's own lock.
    fn apply_ledger(&self, event: &Event) {
        match event {
            Event::AccountAdded { account } => {
                self.usernames.insert(account.username.clone(), account.id);
                self.accounts.insert(account.id, account.clone());
            }
            Event::AccountStatusChanged { id, active } => {
                if let Some(mut account) = self.accounts.get_mut(id) {
                    account.active = *active;
                }
            }
            Event::AttemptLogged { record, booking } => {
                if !self.attempt_keys.insert(record.key()) {
                    return;
                }
                self.attempts
                    .entry(record.job_id)
                    .or_default()
                    .push(record.clone());
                if let Some(booking) = booking {
                    self.insert_booking(booking.clone());
                }
            }
            Event::BookingRestored { booking } => self.insert_booking(booking.clone()),
            Event::BookingStatusChanged { id, status, at } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = *status;
                    booking.updated_at = *at;
                    if !status.is_live() {
                        self.live
                            .remove_if(&(booking.account_id, booking.slot.clone()), |_, live_id| live_id == id);
                    }
                }
            }
            Event::JobCreated { .. } | Event::JobTransitioned { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn persist_and_apply(&self, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        self.apply_ledger(&event);
        Ok(())
    }

    fn job_handle(&self, id: &JobId) -> Result<SharedJob, StoreError> {
        self.jobs
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(*id))
    }

    /// Copies of the given jobs in `state` (or all of them), in dispatch order.
    async fn snapshot_jobs(&self, handles: Vec<SharedJob>, state: Option<JobState>) -> Vec<SnipeJob> {
        let mut jobs = Vec::new();
        for handle in handles {
            let job = handle.read().await;
            if state.is_none_or(|s| job.state == s) {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by_key(|j| (j.scheduled_execution, j.priority, j.id));
        jobs
    }

    fn all_handles(&self) -> Vec<SharedJob> {
        self.jobs.iter().map(|e| e.value().clone()).collect()
    }

    /// Rewrite the log as the minimal event list that rebuilds the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;

        let mut events: Vec<Event> = self
            .accounts
            .iter()
            .map(|e| Event::AccountAdded {
                account: e.value().clone(),
            })
            .collect();
        for job in self.snapshot_jobs(self.all_handles(), None).await {
            events.push(Event::JobCreated { job });
        }
        for entry in self.attempts.iter() {
            for record in entry.value() {
                events.push(Event::AttemptLogged {
                    record: record.clone(),
                    booking: None,
                });
            }
        }
        for entry in self.bookings.iter() {
            events.push(Event::BookingRestored {
                booking: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for WalStore {
    async fn add_account(&self, account: Account) -> Result<(), StoreError> {
        if account.username.is_empty() || account.username.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("username must be 1..=128 bytes"));
        }
        if account.credentials_ref.len() > MAX_CREDENTIALS_REF_LEN {
            return Err(StoreError::LimitExceeded("credentials reference too long"));
        }
        let _shared = self.gate.read().await;
        let _ledger = self.ledger.lock().await;
        if self.usernames.contains_key(&account.username) {
            return Err(StoreError::AlreadyExists(format!("username {}", account.username)));
        }
        if self.accounts.contains_key(&account.id) {
            return Err(StoreError::AlreadyExists(format!("account {}", account.id)));
        }
        self.persist_and_apply(Event::AccountAdded { account }).await
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let _ledger = self.ledger.lock().await;
        let current = self
            .accounts
            .get(&id)
            .map(|a| a.active)
            .ok_or(StoreError::NotFound(id))?;
        if current == active {
            return Ok(());
        }
        self.persist_and_apply(Event::AccountStatusChanged { id, active })
            .await
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, StoreError> {
        self.accounts
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_accounts(&self, active_only: bool) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| !active_only || a.active)
            .map(|a| a.value().clone())
            .collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(accounts)
    }

    async fn insert_job(&self, job: SnipeJob) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let _ledger = self.ledger.lock().await;
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(format!("job {}", job.id)));
        }
        let event = Event::JobCreated { job: job.clone() };
        self.wal_append(&event).await?;
        self.index_armed(&job);
        self.jobs.insert(job.id, Arc::new(RwLock::new(job)));
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<SnipeJob, StoreError> {
        let handle = self.job_handle(&id)?;
        let job = handle.read().await;
        Ok(job.clone())
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<SnipeJob>, StoreError> {
        Ok(self.snapshot_jobs(self.all_handles(), state).await)
    }

    async fn armed_jobs_due_before(&self, deadline: Ms) -> Result<Vec<SnipeJob>, StoreError> {
        let handles: Vec<SharedJob> = self
            .armed
            .iter()
            .filter(|e| *e.value() <= deadline)
            .filter_map(|e| self.jobs.get(e.key()).map(|j| j.value().clone()))
            .collect();
        Ok(self.snapshot_jobs(handles, Some(JobState::Armed)).await)
    }

    async fn transition_job(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        summary: Option<JobSummary>,
        at: Ms,
    ) -> Result<bool, StoreError> {
        if !from.can_transition(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let handle = self.job_handle(&id)?;
        let _shared = self.gate.read().await;
        let mut job = handle.write().await;
        if job.state != from {
            return Ok(false);
        }
        let event = Event::JobTransitioned {
            id,
            from,
            to,
            summary,
            at,
        };
        self.wal_append(&event).await?;
        apply_transition(&mut job, &event);
        self.index_armed(&job);
        Ok(true)
    }

    async fn append_attempt(&self, record: AttemptRecord) -> Result<bool, StoreError> {
        let _shared = self.gate.read().await;
        let _ledger = self.ledger.lock().await;
        if self.attempt_keys.contains(&record.key()) {
            return Ok(false);
        }
        let booking = match &record.outcome {
            AttemptOutcome::Success { booking_ref }
                if !self
                    .live
                    .contains_key(&(record.account_id, record.slot.clone())) =>
            {
                Some(Booking {
                    id: Ulid::new(),
                    account_id: record.account_id,
                    job_id: Some(record.job_id),
                    slot: record.slot.clone(),
                    end: record.slot_end,
                    status: BookingStatus::Confirmed,
                    external_ref: Some(booking_ref.clone()),
                    created_at: record.at,
                    updated_at: record.at,
                })
            }
            _ => None,
        };
        self.persist_and_apply(Event::AttemptLogged { record, booking })
            .await?;
        Ok(true)
    }

    async fn attempts_for_job(&self, id: JobId) -> Result<Vec<AttemptRecord>, StoreError> {
        Ok(self
            .attempts
            .get(&id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn attempts_for_account(&self, id: AccountId) -> Result<Vec<AttemptRecord>, StoreError> {
        let mut records: Vec<AttemptRecord> = self
            .attempts
            .iter()
            .flat_map(|e| {
                e.value()
                    .iter()
                    .filter(|r| r.account_id == id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        records.sort_by_key(|r| (r.at, r.job_id, r.attempt_seq));
        Ok(records)
    }

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        self.bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn bookings_for_account(&self, id: AccountId) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .account_bookings
            .get(&id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings: Vec<Booking> = ids
            .iter()
            .filter_map(|bid| self.bookings.get(bid).map(|b| b.value().clone()))
            .collect();
        bookings.sort_by(|a, b| a.slot.cmp(&b.slot).then(a.created_at.cmp(&b.created_at)));
        Ok(bookings)
    }

    async fn live_booking(&self, account: AccountId, slot: &SlotKey) -> Result<Option<Booking>, StoreError> {
        let Some(id) = self.live.get(&(account, slot.clone())).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn set_booking_status(&self, id: Ulid, status: BookingStatus, at: Ms) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let _ledger = self.ledger.lock().await;
        let current = self.get_booking(id).await?;
        if !current.status.is_live() {
            return Err(StoreError::BookingClosed {
                id,
                status: current.status,
            });
        }
        if current.status == status {
            return Ok(current);
        }
        self.persist_and_apply(Event::BookingStatusChanged { id, status, at })
            .await?;
        self.get_booking(id).await
    }
}
