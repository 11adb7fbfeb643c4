use chrono::NaiveTime;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::model::{AccountId, AttemptOutcome, JobId, JobState, Ms};

const CHANNEL_CAPACITY: usize = 1024;

/// What subscribers are told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SnipeEvent {
    JobTransitioned {
        job_id: JobId,
        from: JobState,
        to: JobState,
        at: Ms,
    },
    AttemptCompleted {
        job_id: JobId,
        account_id: AccountId,
        slot: NaiveTime,
        outcome: AttemptOutcome,
        at: Ms,
    },
}

/// Flat callback payload: `{type, jobId, accountId?, outcome}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    pub outcome: String,
}

impl SnipeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SnipeEvent::JobTransitioned { .. } => "job_transitioned",
            SnipeEvent::AttemptCompleted { .. } => "attempt_completed",
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            SnipeEvent::JobTransitioned { job_id, .. } | SnipeEvent::AttemptCompleted { job_id, .. } => *job_id,
        }
    }

    pub fn payload(&self) -> CallbackPayload {
        match self {
            SnipeEvent::JobTransitioned { job_id, to, .. } => CallbackPayload {
                kind: self.kind(),
                job_id: *job_id,
                account_id: None,
                outcome: to.label().to_string(),
            },
            SnipeEvent::AttemptCompleted {
                job_id,
                account_id,
                outcome,
                ..
            } => CallbackPayload {
                kind: self.kind(),
                job_id: *job_id,
                account_id: Some(*account_id),
                outcome: outcome.label().to_string(),
            },
        }
    }
}

/// Broadcast hub: one firehose plus an optional channel per job.
pub struct NotifyHub {
    all: broadcast::Sender<SnipeEvent>,
    jobs: DashMap<JobId, broadcast::Sender<SnipeEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            jobs: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnipeEvent> {
        self.all.subscribe()
    }

    /// Subscribe to one job's events. Creates the channel if needed.
    pub fn subscribe_job(&self, job_id: JobId) -> broadcast::Receiver<SnipeEvent> {
        self.jobs
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish. No-op if nobody is listening.
    pub fn send(&self, event: SnipeEvent) {
        if let Some(sender) = self.jobs.get(&event.job_id()) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Drop a job's channel (e.g. once archived).
    pub fn remove(&self, job_id: &JobId) {
        self.jobs.remove(job_id);
    }

    /// Run `callback` for every future event on its own task.
    ///
    /// A callback that falls behind skips the missed events rather than blocking
    /// publishers.
    pub fn register_callback<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SnipeEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("event callback lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
