//! JSON seed file for the daemon: the simulated facility's listing, the accounts,
//! and the snipes to schedule on first start.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::info;

use crate::model::{AccountId, DayKey, JobId, Ms, SlotTarget, SnipeSpec};
use crate::monitor::SlotMonitor;
use crate::scheduler::SnipeError;
use crate::store::StoreError;
use crate::vendor::SimulatedVendor;

#[derive(Debug)]
pub enum PlanError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    UnknownAccount(String),
    Snipe(SnipeError),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::Io(e) => write!(f, "cannot read plan: {e}"),
            PlanError::Parse(e) => write!(f, "invalid plan: {e}"),
            PlanError::UnknownAccount(name) => write!(f, "plan names unknown account {name}"),
            PlanError::Snipe(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PlanError {}

impl From<SnipeError> for PlanError {
    fn from(e: SnipeError) -> Self {
        PlanError::Snipe(e)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub facility: Vec<PlanDay>,
    #[serde(default)]
    pub accounts: Vec<PlanAccount>,
    #[serde(default)]
    pub snipes: Vec<PlanSnipe>,
}

/// Hourly slots `[from_hour, to_hour)` listed by the simulated facility.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanDay {
    pub location: String,
    pub sub_location: String,
    pub date: NaiveDate,
    pub from_hour: u32,
    pub to_hour: u32,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Slots already full when the daemon starts.
    #[serde(default)]
    pub taken: Vec<NaiveTime>,
}

fn default_capacity() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanAccount {
    pub username: String,
    #[serde(default)]
    pub credentials_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanTarget {
    Single {
        time_slot: NaiveTime,
    },
    Window {
        start: NaiveTime,
        end: NaiveTime,
        consecutive_hours: u32,
    },
}

impl From<PlanTarget> for SlotTarget {
    fn from(target: PlanTarget) -> Self {
        match target {
            PlanTarget::Single { time_slot } => SlotTarget::Single { time_slot },
            PlanTarget::Window {
                start,
                end,
                consecutive_hours,
            } => SlotTarget::Window {
                start,
                end,
                consecutive_hours,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanSnipe {
    pub location: String,
    pub sub_location: String,
    pub date: NaiveDate,
    pub target: PlanTarget,
    /// Usernames, in attempt order.
    pub accounts: Vec<String>,
    /// Seconds after startup at which the snipe fires.
    pub fire_in_secs: u64,
    #[serde(default)]
    pub priority: i32,
}

impl Plan {
    pub fn parse(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json).map_err(PlanError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let json = std::fs::read_to_string(path).map_err(PlanError::Io)?;
        Self::parse(&json)
    }

    /// Populate the simulated facility's listing.
    pub fn stock(&self, sim: &SimulatedVendor) {
        for day in &self.facility {
            let key = DayKey::new(&day.location, &day.sub_location, day.date);
            sim.add_hourly(&key, day.from_hour, day.to_hour, day.capacity);
            for start in &day.taken {
                sim.take_externally(&key.slot(*start));
            }
        }
    }

    /// Add missing accounts and schedule the snipes. Snipes are only scheduled
    /// into an empty store; a restarted daemon resumes the jobs it already has.
    pub async fn seed(&self, monitor: &SlotMonitor, now: Ms) -> Result<Vec<JobId>, PlanError> {
        let mut ids: HashMap<String, AccountId> = monitor
            .accounts(false)
            .await?
            .into_iter()
            .map(|a| (a.username, a.id))
            .collect();
        for account in &self.accounts {
            if ids.contains_key(&account.username) {
                continue;
            }
            match monitor
                .add_account(&account.username, &account.credentials_ref)
                .await
            {
                Ok(added) => {
                    ids.insert(added.username, added.id);
                }
                Err(SnipeError::Store(StoreError::AlreadyExists(_))) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !monitor.jobs(None).await?.is_empty() {
            info!("store already holds jobs; plan snipes not rescheduled");
            return Ok(Vec::new());
        }

        let mut scheduled = Vec::with_capacity(self.snipes.len());
        for snipe in &self.snipes {
            let accounts = snipe
                .accounts
                .iter()
                .map(|name| {
                    ids.get(name)
                        .copied()
                        .ok_or_else(|| PlanError::UnknownAccount(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let spec = SnipeSpec {
                target_date: snipe.date,
                location: snipe.location.clone(),
                sub_location: snipe.sub_location.clone(),
                target: snipe.target.clone().into(),
                accounts,
                scheduled_execution: now + (snipe.fire_in_secs * 1000) as Ms,
                priority: snipe.priority,
            };
            scheduled.push(monitor.schedule_snipe(spec).await?);
        }
        info!(
            accounts = ids.len(),
            snipes = scheduled.len(),
            "plan seeded"
        );
        Ok(scheduled)
    }
}
