mod error;
pub mod executor;

pub use error::SnipeError;
pub use executor::{ExecutionReport, Executor, ExecutorSettings, outcome_state};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::clock::SharedClock;
use crate::config::Config;
use crate::limits::*;
use crate::model::*;
use crate::notify::{NotifyHub, SnipeEvent};
use crate::store::{JobStore, StoreError, retry_persist};

type DueEntry = (Ms, i32, JobId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub dispatch_tick: Duration,
    pub dispatch_horizon: Duration,
    pub dispatch_jitter: Duration,
    pub store_retry_backoff: Duration,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            dispatch_tick: config.dispatch_tick,
            dispatch_horizon: config.dispatch_horizon,
            dispatch_jitter: config.dispatch_jitter,
            store_retry_backoff: config.store_retry_backoff,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Sole owner of job state transitions.
///
/// Jobs are armed on `schedule`, pulled into a bounded due queue once they come
/// within the dispatch horizon, claimed with a compare-and-set in the store when
/// due, and handed to the executor. Only the process that wins the claim runs
/// the job.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    cache: Arc<AvailabilityCache>,
    executor: Arc<Executor>,
    hub: Arc<NotifyHub>,
    clock: SharedClock,
    settings: SchedulerSettings,
    due: Mutex<BTreeSet<DueEntry>>,
    running: DashMap<JobId, Running>,
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: Arc<AvailabilityCache>,
        executor: Arc<Executor>,
        hub: Arc<NotifyHub>,
        clock: SharedClock,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            cache,
            executor,
            hub,
            clock,
            settings,
            due: Mutex::new(BTreeSet::new()),
            running: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn jitter_ms(&self) -> Ms {
        self.settings.dispatch_jitter.as_millis() as Ms
    }

    fn horizon_ms(&self) -> Ms {
        self.settings.dispatch_horizon.as_millis() as Ms
    }

    fn publish(&self, id: JobId, from: JobState, to: JobState, at: Ms) {
        self.hub.send(SnipeEvent::JobTransitioned {
            job_id: id,
            from,
            to,
            at,
        });
    }

    async fn validate(&self, spec: &SnipeSpec, now: Ms) -> Result<(), SnipeError> {
        let invalid = |msg: &str| Err(SnipeError::Validation(msg.to_string()));
        for name in [&spec.location, &spec.sub_location] {
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return invalid("location and sub-location must be 1..=128 bytes");
            }
        }
        if spec.accounts.is_empty() {
            return invalid("at least one account is required");
        }
        if spec.accounts.len() > MAX_ACCOUNTS_PER_JOB {
            return invalid("too many accounts");
        }
        let mut seen = HashSet::new();
        if !spec.accounts.iter().all(|id| seen.insert(*id)) {
            return invalid("an account is listed twice");
        }
        if let SlotTarget::Window {
            start,
            end,
            consecutive_hours,
        } = spec.target
        {
            if start >= end {
                return invalid("time window must end after it starts");
            }
            if consecutive_hours == 0 || consecutive_hours > MAX_CONSECUTIVE_HOURS {
                return invalid("consecutive_hours must be 1..=12");
            }
            if end.signed_duration_since(start).num_minutes() < i64::from(consecutive_hours) * 60 {
                return invalid("time window is shorter than consecutive_hours");
            }
        }
        if spec.scheduled_execution + self.jitter_ms() < now {
            return invalid("scheduled_execution is in the past");
        }
        for id in &spec.accounts {
            match self.store.get_account(*id).await {
                Ok(account) if account.active => {}
                Ok(account) => {
                    return Err(SnipeError::Validation(format!(
                        "account {} is deactivated",
                        account.username
                    )));
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(SnipeError::Validation(format!("unknown account {id}")));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Validate, store and arm a new job.
    pub async fn schedule(&self, spec: SnipeSpec) -> Result<JobId, SnipeError> {
        let now = self.clock.now_ms();
        self.validate(&spec, now).await?;

        let id = Ulid::new();
        let job = SnipeJob::from_spec(id, spec, now);
        let day = job.day();
        let (scheduled, priority) = (job.scheduled_execution, job.priority);
        self.store.insert_job(job).await?;
        self.arm(id, day, scheduled, priority, now).await?;
        info!(job_id = %id, scheduled, "snipe armed");
        Ok(id)
    }

    // The job is already stored as pending; arming must land before `schedule` returns.
    async fn arm(&self, id: JobId, day: DayKey, scheduled: Ms, priority: i32, now: Ms) -> Result<(), SnipeError> {
        let armed = retry_persist("arm transition", self.settings.store_retry_backoff, || {
            self.store
                .transition_job(id, JobState::Pending, JobState::Armed, None, now)
        })
        .await?;
        if !armed {
            return Ok(());
        }
        self.publish(id, JobState::Pending, JobState::Armed, now);
        self.cache.watch(&day);
        if scheduled <= now + self.horizon_ms() {
            self.enqueue((scheduled, priority, id)).await;
        }
        Ok(())
    }

    async fn enqueue(&self, entry: DueEntry) {
        let mut due = self.due.lock().await;
        if due.len() >= MAX_DUE_QUEUE && !due.contains(&entry) {
            // Full: keep the earliest jobs; later ones come back on a reload.
            match due.last() {
                Some(last) if *last > entry => {
                    due.pop_last();
                }
                _ => return,
            }
        }
        due.insert(entry);
        metrics::gauge!(crate::observability::DUE_QUEUE_DEPTH).set(due.len() as f64);
    }

    async fn dequeue(&self, id: JobId) {
        let mut due = self.due.lock().await;
        due.retain(|(_, _, queued)| *queued != id);
        metrics::gauge!(crate::observability::DUE_QUEUE_DEPTH).set(due.len() as f64);
    }

    pub async fn queued(&self) -> usize {
        self.due.lock().await.len()
    }

    /// Cancel a job. Running jobs are aborted and joined before this returns.
    pub async fn cancel(&self, id: JobId) -> Result<JobState, SnipeError> {
        loop {
            let job = self.store.get_job(id).await?;
            match job.state {
                JobState::Pending | JobState::Armed => {
                    let now = self.clock.now_ms();
                    if self
                        .store
                        .transition_job(id, job.state, JobState::Cancelled, None, now)
                        .await?
                    {
                        self.dequeue(id).await;
                        if job.state == JobState::Armed {
                            self.cache.unwatch(&job.day());
                        }
                        self.publish(id, job.state, JobState::Cancelled, now);
                        info!(job_id = %id, "snipe cancelled before dispatch");
                        return Ok(JobState::Cancelled);
                    }
                    // Lost a race with dispatch; look again.
                }
                JobState::Executing => {
                    let Some(mut done) = self.running.get(&id).map(|r| {
                        r.cancel.cancel();
                        r.done.clone()
                    }) else {
                        // Either just finished, or claimed by another process.
                        return Ok(self.store.get_job(id).await?.state);
                    };
                    let _ = done.wait_for(|finished| *finished).await;
                    return Ok(self.store.get_job(id).await?.state);
                }
                state => return Ok(state),
            }
        }
    }

    /// One dispatch-loop iteration. Returns how many jobs this call dispatched.
    pub async fn tick(self: &Arc<Self>) -> usize {
        self.reap_finished().await;
        let now = self.clock.now_ms();
        match self.store.armed_jobs_due_before(now + self.horizon_ms()).await {
            Ok(jobs) => {
                for job in jobs {
                    self.enqueue((job.scheduled_execution, job.priority, job.id))
                        .await;
                }
            }
            Err(e) => warn!("due-job reload failed, keeping queue: {e}"),
        }

        let due: Vec<DueEntry> = {
            let mut queue = self.due.lock().await;
            let mut due = Vec::new();
            while let Some(first) = queue.first().copied()
                && first.0 <= now + self.jitter_ms()
            {
                queue.pop_first();
                due.push(first);
            }
            metrics::gauge!(crate::observability::DUE_QUEUE_DEPTH).set(queue.len() as f64);
            due
        };

        let mut dispatched = 0;
        for entry in due {
            if self.dispatch(entry, now).await {
                dispatched += 1;
            }
        }
        dispatched
    }

    async fn dispatch(self: &Arc<Self>, entry: DueEntry, now: Ms) -> bool {
        let (scheduled, _, id) = entry;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        // Registered before the claim so a concurrent cancel always finds it.
        match self.running.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(Running {
                    cancel: cancel.clone(),
                    done: done_rx,
                });
            }
        }

        match self
            .store
            .transition_job(id, JobState::Armed, JobState::Executing, None, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.running.remove(&id);
                debug!(job_id = %id, "claim lost; job already left armed");
                return false;
            }
            Err(e) => {
                self.running.remove(&id);
                if e.is_persistence() {
                    warn!(job_id = %id, "claim failed, retrying next tick: {e}");
                    self.enqueue(entry).await;
                } else {
                    warn!(job_id = %id, "claim failed: {e}");
                }
                return false;
            }
        }
        self.publish(id, JobState::Armed, JobState::Executing, now);
        metrics::counter!(crate::observability::JOBS_DISPATCHED_TOTAL).increment(1);
        metrics::histogram!(crate::observability::DISPATCH_LAG_SECONDS)
            .record((now - scheduled).max(0) as f64 / 1000.0);

        let job = match retry_persist("load claimed job", self.settings.store_retry_backoff, || {
            self.store.get_job(id)
        })
        .await
        {
            Ok(job) => job,
            Err(e) => {
                self.running.remove(&id);
                error!(job_id = %id, "claimed job vanished: {e}");
                return false;
            }
        };

        info!(job_id = %id, accounts = job.accounts.len(), "dispatching snipe");
        let this = self.clone();
        self.tasks.lock().await.spawn(async move {
            let report = this.executor.execute(job.clone(), cancel).await;
            this.finish(&job, report).await;
            this.running.remove(&job.id);
            let _ = done_tx.send(true);
        });
        true
    }

    /// Persist the terminal state. Retried until the store accepts it.
    async fn finish(&self, job: &SnipeJob, report: ExecutionReport) {
        let ExecutionReport { state, summary } = report;
        let at = self.clock.now_ms();
        let moved = retry_persist("terminal transition", self.settings.store_retry_backoff, || {
            self.store
                .transition_job(job.id, JobState::Executing, state, Some(summary.clone()), at)
        })
        .await;
        match moved {
            Ok(true) => {
                self.publish(job.id, JobState::Executing, state, at);
                metrics::counter!(crate::observability::JOBS_COMPLETED_TOTAL, "state" => state.label())
                    .increment(1);
                info!(
                    job_id = %job.id,
                    state = %state,
                    claimed = summary.claimed.len(),
                    missed = summary.missed.len(),
                    "snipe finished"
                );
            }
            Ok(false) => warn!(job_id = %job.id, "job left executing before its report landed"),
            Err(e) => error!(job_id = %job.id, "terminal transition failed: {e}"),
        }
        self.cache.unwatch(&job.day());
    }

    /// Drop dispatch tasks that have already finished.
    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!("dispatch task failed: {e}");
            }
        }
    }

    /// Wait for every dispatched job to finish.
    pub async fn join_running(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("dispatch task failed: {e}");
            }
        }
    }

    /// Abort every running job and wait for them.
    pub async fn cancel_running(&self) {
        for entry in self.running.iter() {
            entry.cancel.cancel();
        }
        self.join_running().await;
    }

    /// Startup pass over jobs a previous process left behind.
    ///
    /// Jobs found executing are closed from their logged attempts instead of being
    /// run again. Pending jobs are armed, and armed jobs get their day watched.
    pub async fn recover(&self) -> Result<usize, SnipeError> {
        let now = self.clock.now_ms();
        let mut recovered = 0;

        for job in self.store.list_jobs(Some(JobState::Executing)).await? {
            let attempts = self.store.attempts_for_job(job.id).await?;
            let mut claimed: BTreeMap<chrono::NaiveTime, ClaimedSlot> = BTreeMap::new();
            let mut tried = BTreeSet::new();
            for record in &attempts {
                tried.insert(record.slot.start);
                if let AttemptOutcome::Success { booking_ref } = &record.outcome {
                    claimed.entry(record.slot.start).or_insert(ClaimedSlot {
                        start: record.slot.start,
                        account_id: record.account_id,
                        booking_ref: booking_ref.clone(),
                    });
                }
            }
            let summary = JobSummary {
                missed: tried.into_iter().filter(|t| !claimed.contains_key(t)).collect(),
                claimed: claimed.into_values().collect(),
                note: Some("recovered after restart from the attempt log".into()),
            };
            let state = outcome_state(summary.claimed.len(), job.target.required_len());
            if self
                .store
                .transition_job(job.id, JobState::Executing, state, Some(summary), now)
                .await?
            {
                self.publish(job.id, JobState::Executing, state, now);
                warn!(job_id = %job.id, state = %state, "recovered interrupted dispatch");
                recovered += 1;
            }
        }

        for job in self.store.list_jobs(Some(JobState::Armed)).await? {
            self.cache.watch(&job.day());
        }
        for job in self.store.list_jobs(Some(JobState::Pending)).await? {
            self.arm(job.id, job.day(), job.scheduled_execution, job.priority, now)
                .await?;
        }
        Ok(recovered)
    }

    /// Dispatch loop. Returns once `shutdown` fires; running jobs are left to the caller.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.dispatch_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            self.tick().await;
        }
    }
}
