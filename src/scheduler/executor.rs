use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveTime;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::AvailabilityCache;
use crate::clock::SharedClock;
use crate::config::Config;
use crate::model::*;
use crate::notify::{NotifyHub, SnipeEvent};
use crate::runs::{best_effort_windows, consecutive_windows};
use crate::store::{JobStore, retry_persist};
use crate::vendor::{Session, VendorClient, VendorError, with_timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_attempt_retries: u32,
    pub retry_backoff: Duration,
    pub vendor_timeout: Duration,
    pub conflict_ends_slot: bool,
    pub store_retry_backoff: Duration,
}

impl From<&Config> for ExecutorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_attempt_retries: config.max_attempt_retries,
            retry_backoff: config.retry_backoff,
            vendor_timeout: config.vendor_timeout,
            conflict_ends_slot: config.conflict_ends_slot,
            store_retry_backoff: config.store_retry_backoff,
        }
    }
}

/// What one dispatch achieved. The scheduler turns it into a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub state: JobState,
    pub summary: JobSummary,
}

/// Terminal state for `claimed` out of `required` slots.
pub fn outcome_state(claimed: usize, required: usize) -> JobState {
    if claimed == 0 {
        JobState::Failed
    } else if claimed >= required {
        JobState::Succeeded
    } else {
        JobState::PartiallySucceeded
    }
}

/// Slots chosen for a dispatch, plus the ones given up before any attempt.
#[derive(Debug, Default)]
struct Plan {
    slots: Vec<SlotAvailability>,
    missed: Vec<NaiveTime>,
    note: Option<String>,
}

enum Call<T> {
    Done(Result<T, VendorError>),
    Abandoned,
}

enum SlotResult {
    Claimed(ClaimedSlot),
    Missed(NaiveTime),
}

/// State shared by the slot tasks of one dispatch.
struct Dispatch {
    job: SnipeJob,
    cancel: CancellationToken,
    accounts: HashMap<AccountId, Account>,
    sessions: DashMap<AccountId, Session>,
    /// Accounts that failed to authenticate; skipped for the rest of the dispatch.
    unusable: DashSet<AccountId>,
    /// Last attempt_seq used per account.
    seqs: DashMap<AccountId, u32>,
    notes: Mutex<Vec<String>>,
}

impl Dispatch {
    fn next_seq(&self, account_id: AccountId) -> u32 {
        let mut seq = self.seqs.entry(account_id).or_insert(0);
        *seq += 1;
        *seq
    }

    async fn note(&self, note: String) {
        self.notes.lock().await.push(note);
    }
}

/// Races the claim for one due job across its slots and accounts.
///
/// Never touches job state: it logs every attempt and hands back a report.
pub struct Executor {
    vendor: Arc<dyn VendorClient>,
    store: Arc<dyn JobStore>,
    cache: Arc<AvailabilityCache>,
    hub: Arc<NotifyHub>,
    clock: SharedClock,
    /// One lock per account, shared across jobs, so an account never has two
    /// vendor calls in flight.
    account_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        vendor: Arc<dyn VendorClient>,
        store: Arc<dyn JobStore>,
        cache: Arc<AvailabilityCache>,
        hub: Arc<NotifyHub>,
        clock: SharedClock,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            vendor,
            store,
            cache,
            hub,
            clock,
            account_locks: DashMap::new(),
            settings,
        }
    }

    pub async fn execute(self: &Arc<Self>, job: SnipeJob, cancel: CancellationToken) -> ExecutionReport {
        let required = job.target.required_len();
        let dispatch = Arc::new(self.prepare(job, cancel).await);
        let plan = self.plan(&dispatch.job, &dispatch.cancel).await;
        if let Some(note) = &plan.note {
            dispatch.note(note.clone()).await;
        }

        let planned: Vec<NaiveTime> = plan.slots.iter().map(|s| s.key.start).collect();
        let mut tasks = JoinSet::new();
        for slot in plan.slots {
            let this = self.clone();
            let dispatch = dispatch.clone();
            tasks.spawn(async move { this.claim_slot(&dispatch, slot).await });
        }

        let mut claimed: Vec<ClaimedSlot> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(SlotResult::Claimed(slot)) => claimed.push(slot),
                Ok(SlotResult::Missed(start)) => debug!(job_id = %dispatch.job.id, %start, "slot missed"),
                Err(e) => error!(job_id = %dispatch.job.id, "slot task failed: {e}"),
            }
        }
        claimed.sort_by_key(|c| c.start);

        let claimed_starts: BTreeSet<NaiveTime> = claimed.iter().map(|c| c.start).collect();
        let mut missed: BTreeSet<NaiveTime> = plan.missed.into_iter().collect();
        missed.extend(planned.into_iter().filter(|s| !claimed_starts.contains(s)));

        let cancelled = dispatch.cancel.is_cancelled();
        if cancelled {
            dispatch.note("cancelled during dispatch".into()).await;
        }
        let notes = dispatch.notes.lock().await.clone();
        let summary = JobSummary {
            claimed,
            missed: missed.into_iter().collect(),
            note: (!notes.is_empty()).then(|| notes.join("; ")),
        };
        let state = if cancelled {
            JobState::Cancelled
        } else {
            outcome_state(summary.claimed.len(), required)
        };
        ExecutionReport { state, summary }
    }

    async fn prepare(&self, job: SnipeJob, cancel: CancellationToken) -> Dispatch {
        let mut accounts = HashMap::new();
        let unusable = DashSet::new();
        for id in &job.accounts {
            match retry_persist("load account", self.settings.store_retry_backoff, || self.store.get_account(*id)).await
            {
                Ok(account) if account.active => {
                    accounts.insert(*id, account);
                }
                Ok(_) => {
                    debug!(job_id = %job.id, account_id = %id, "account inactive, skipping");
                    unusable.insert(*id);
                }
                Err(e) => {
                    warn!(job_id = %job.id, account_id = %id, "account unavailable: {e}");
                    unusable.insert(*id);
                }
            }
        }

        // Continue numbering after anything already logged for this job.
        let seqs = DashMap::new();
        match retry_persist("load logged attempts", self.settings.store_retry_backoff, || {
            self.store.attempts_for_job(job.id)
        })
        .await
        {
            Ok(previous) => {
                for record in previous {
                    let mut seq = seqs.entry(record.account_id).or_insert(0);
                    *seq = (*seq).max(record.attempt_seq);
                }
            }
            Err(e) => error!(job_id = %job.id, "logged attempts unavailable: {e}"),
        }

        Dispatch {
            job,
            cancel,
            accounts,
            sessions: DashMap::new(),
            unusable,
            seqs,
            notes: Mutex::new(Vec::new()),
        }
    }

    // ── Slot resolution ──────────────────────────────────────

    /// Refresh `day`, retrying transient failures with the attempt backoff.
    async fn refresh_with_retries(&self, day: &DayKey, cancel: &CancellationToken) -> Result<(), VendorError> {
        let mut tries = 0;
        loop {
            match self.cache.refresh(day).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && tries < self.settings.max_attempt_retries => {
                    tries += 1;
                    warn!(day = %day, tries, "availability refresh failed, retrying: {e}");
                    if !sleep_or_cancel(cancel, self.settings.retry_backoff).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn plan(&self, job: &SnipeJob, cancel: &CancellationToken) -> Plan {
        let day = job.day();
        let cached = self.cache.read(&day).await;
        let mut note = None;
        let needs_refresh = cached.is_empty()
            || cached
                .iter()
                .any(|c| c.is_stale && job.target.covers(c.slot.key.start, c.slot.end));
        if needs_refresh && let Err(e) = self.refresh_with_retries(&day, cancel).await {
            warn!(job_id = %job.id, day = %day, "no fresh availability: {e}");
            note = Some(format!("availability refresh failed: {e}"));
        }
        let fresh = self.cache.read_fresh(&day).await;

        match job.target {
            SlotTarget::Single { time_slot } => match fresh.into_iter().find(|s| s.key.start == time_slot) {
                Some(slot) if slot.is_bookable() => Plan {
                    slots: vec![slot],
                    missed: Vec::new(),
                    note,
                },
                Some(_) => Plan {
                    slots: Vec::new(),
                    missed: vec![time_slot],
                    note: note.or_else(|| Some("slot is fully booked".into())),
                },
                None => Plan {
                    slots: Vec::new(),
                    missed: vec![time_slot],
                    note: note.or_else(|| Some("slot is not listed".into())),
                },
            },
            SlotTarget::Window {
                start,
                end,
                consecutive_hours,
            } => {
                let len = consecutive_hours as usize;
                let inside: Vec<SlotAvailability> = fresh
                    .into_iter()
                    .filter(|s| job.target.covers(s.key.start, s.end))
                    .collect();
                if let Some(window) = consecutive_windows(&inside, len).into_iter().next() {
                    return Plan {
                        slots: window,
                        missed: Vec::new(),
                        note,
                    };
                }
                let Some(window) = best_effort_windows(&inside, len).into_iter().next() else {
                    return Plan {
                        note: note.or_else(|| {
                            Some(format!(
                                "no {len}-slot window listed between {} and {}",
                                start.format("%H:%M"),
                                end.format("%H:%M")
                            ))
                        }),
                        ..Plan::default()
                    };
                };
                let (slots, blocked): (Vec<_>, Vec<_>) = window.into_iter().partition(|s| s.is_bookable());
                Plan {
                    slots,
                    missed: blocked.iter().map(|s| s.key.start).collect(),
                    note: note.or_else(|| Some("no fully bookable window; claiming the open slots".into())),
                }
            }
        }
    }

    /// The slot's current entry, refreshed first if stale. `None` means the cache
    /// cannot vouch for it being bookable right now.
    async fn authorize(&self, dispatch: &Dispatch, key: &SlotKey) -> Option<SlotAvailability> {
        let day = key.day();
        let cached = self.cache.read(&day).await.into_iter().find(|c| c.slot.key == *key);
        let slot = match cached {
            Some(entry) if !entry.is_stale => entry.slot,
            _ => {
                if let Err(e) = self.refresh_with_retries(&day, &dispatch.cancel).await {
                    dispatch
                        .note(format!("{} not attempted: {e}", key.start.format("%H:%M")))
                        .await;
                    return None;
                }
                self.cache
                    .read_fresh(&day)
                    .await
                    .into_iter()
                    .find(|s| s.key == *key)?
            }
        };
        slot.is_bookable().then_some(slot)
    }

    // ── Attempts ─────────────────────────────────────────────

    fn account_lock(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        self.account_locks.entry(account_id).or_default().clone()
    }

    /// Bound a vendor call by the timeout and the job's cancellation.
    async fn call<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, VendorError>>,
    ) -> Call<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Call::Abandoned,
            result = with_timeout(self.settings.vendor_timeout, fut) => Call::Done(result),
        }
    }

    /// Log-then-publish one attempt. Persistence failures are retried until the
    /// row is durable.
    async fn record(
        &self,
        dispatch: &Dispatch,
        account_id: AccountId,
        slot: &SlotAvailability,
        outcome: AttemptOutcome,
        latency: Duration,
    ) {
        let record = AttemptRecord {
            job_id: dispatch.job.id,
            account_id,
            attempt_seq: dispatch.next_seq(account_id),
            slot: slot.key.clone(),
            slot_end: slot.end,
            outcome: outcome.clone(),
            latency_ms: latency.as_millis() as u64,
            at: self.clock.now_ms(),
        };
        metrics::counter!(crate::observability::ATTEMPTS_TOTAL, "outcome" => outcome.label()).increment(1);
        metrics::histogram!(crate::observability::ATTEMPT_DURATION_SECONDS).record(latency.as_secs_f64());

        let at = record.at;
        let appended = retry_persist("append attempt", self.settings.store_retry_backoff, || {
            self.store.append_attempt(record.clone())
        })
        .await;
        match appended {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %dispatch.job.id, %account_id, "attempt already logged"),
            Err(e) => error!(job_id = %dispatch.job.id, %account_id, "attempt not logged: {e}"),
        }
        self.hub.send(SnipeEvent::AttemptCompleted {
            job_id: dispatch.job.id,
            account_id,
            slot: slot.key.start,
            outcome,
            at,
        });
    }

    /// The account's session for this dispatch, logging in on first use.
    async fn session(&self, dispatch: &Dispatch, account: &Account, slot: &SlotAvailability) -> Option<Session> {
        if let Some(session) = dispatch.sessions.get(&account.id) {
            return Some(session.clone());
        }
        let mut tries = 0;
        loop {
            let started = Instant::now();
            let result = match self.call(&dispatch.cancel, self.vendor.authenticate(account)).await {
                Call::Done(result) => result,
                Call::Abandoned => return None,
            };
            match result {
                Ok(session) => {
                    dispatch.sessions.insert(account.id, session.clone());
                    return Some(session);
                }
                Err(e) if e.is_transient() && tries < self.settings.max_attempt_retries => {
                    tries += 1;
                    warn!(account_id = %account.id, tries, "login failed, retrying: {e}");
                    if !sleep_or_cancel(&dispatch.cancel, self.settings.retry_backoff).await {
                        return None;
                    }
                }
                Err(e) => {
                    warn!(job_id = %dispatch.job.id, account_id = %account.id, "account unusable for this dispatch: {e}");
                    dispatch.unusable.insert(account.id);
                    let outcome = AttemptOutcome::Error {
                        kind: ErrorKind::Auth,
                        message: e.to_string(),
                    };
                    self.record(dispatch, account.id, slot, outcome, started.elapsed())
                        .await;
                    return None;
                }
            }
        }
    }

    /// Try each account in order until one claims the slot.
    async fn claim_slot(&self, dispatch: &Dispatch, planned: SlotAvailability) -> SlotResult {
        let key = planned.key.clone();
        let start = key.start;
        let job_id = dispatch.job.id;

        for account_id in &dispatch.job.accounts {
            if dispatch.cancel.is_cancelled() {
                break;
            }
            if dispatch.unusable.contains(account_id) {
                continue;
            }
            let Some(account) = dispatch.accounts.get(account_id) else {
                continue;
            };

            // Already holding it (e.g. claimed before a restart) counts as claimed.
            if let Ok(Some(held)) = self.store.live_booking(*account_id, &key).await {
                info!(%job_id, %account_id, slot = %key, "slot already held");
                return SlotResult::Claimed(ClaimedSlot {
                    start,
                    account_id: *account_id,
                    booking_ref: held
                        .external_ref
                        .unwrap_or_else(|| BookingRef(held.id.to_string())),
                });
            }

            let lock = self.account_lock(*account_id);
            let _serialized = tokio::select! {
                guard = lock.lock_owned() => guard,
                _ = dispatch.cancel.cancelled() => break,
            };
            // Another slot task may have burned this account while we waited.
            if dispatch.unusable.contains(account_id) {
                continue;
            }
            let Some(session) = self.session(dispatch, account, &planned).await else {
                continue;
            };

            let mut retries = 0;
            loop {
                let Some(slot) = self.authorize(dispatch, &key).await else {
                    debug!(%job_id, slot = %key, "slot no longer bookable");
                    return SlotResult::Missed(start);
                };
                let started = Instant::now();
                let result = match self
                    .call(&dispatch.cancel, self.vendor.create_booking(&session, &slot.slot_ref))
                    .await
                {
                    Call::Done(result) => result,
                    Call::Abandoned => {
                        let outcome = AttemptOutcome::Error {
                            kind: ErrorKind::Cancelled,
                            message: "abandoned on cancel".into(),
                        };
                        self.record(dispatch, *account_id, &slot, outcome, started.elapsed())
                            .await;
                        return SlotResult::Missed(start);
                    }
                };
                let latency = started.elapsed();

                match result {
                    Ok(booking_ref) => {
                        let outcome = AttemptOutcome::Success {
                            booking_ref: booking_ref.clone(),
                        };
                        self.record(dispatch, *account_id, &slot, outcome, latency).await;
                        info!(%job_id, %account_id, slot = %key, %booking_ref, "slot claimed");
                        return SlotResult::Claimed(ClaimedSlot {
                            start,
                            account_id: *account_id,
                            booking_ref,
                        });
                    }
                    Err(VendorError::Conflict) => {
                        self.record(dispatch, *account_id, &slot, AttemptOutcome::Conflict, latency)
                            .await;
                        if self.settings.conflict_ends_slot {
                            return SlotResult::Missed(start);
                        }
                        break;
                    }
                    Err(e) => {
                        let outcome = AttemptOutcome::Error {
                            kind: error_kind(&e),
                            message: e.to_string(),
                        };
                        self.record(dispatch, *account_id, &slot, outcome, latency).await;
                        if let VendorError::Auth(_) = e {
                            dispatch.sessions.remove(account_id);
                            dispatch.unusable.insert(*account_id);
                            break;
                        }
                        if !e.is_transient() || retries >= self.settings.max_attempt_retries {
                            break;
                        }
                        retries += 1;
                        warn!(%job_id, %account_id, slot = %key, retries, "booking failed, retrying: {e}");
                        if !sleep_or_cancel(&dispatch.cancel, self.settings.retry_backoff).await {
                            return SlotResult::Missed(start);
                        }
                    }
                }
            }
        }
        SlotResult::Missed(start)
    }
}

fn error_kind(e: &VendorError) -> ErrorKind {
    match e {
        VendorError::Transport(_) => ErrorKind::Transport,
        VendorError::Timeout => ErrorKind::Timeout,
        VendorError::Auth(_) => ErrorKind::Auth,
        VendorError::Validation(_) | VendorError::Conflict => ErrorKind::Validation,
        VendorError::NotFound => ErrorKind::NotFound,
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
