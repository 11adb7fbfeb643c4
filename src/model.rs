use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the crate uses this.
pub type Ms = i64;

pub type AccountId = Ulid;
pub type JobId = Ulid;

/// Opaque vendor identifier for a bookable slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef(pub String);

/// Opaque vendor identifier for a committed reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingRef(pub String);

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for BookingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One day of one sub-location: the unit the vendor is polled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub location: String,
    pub sub_location: String,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(location: impl Into<String>, sub_location: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            location: location.into(),
            sub_location: sub_location.into(),
            date,
        }
    }

    pub fn slot(&self, start: NaiveTime) -> SlotKey {
        SlotKey {
            location: self.location.clone(),
            sub_location: self.sub_location.clone(),
            date: self.date,
            start,
        }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.location, self.sub_location, self.date)
    }
}

/// Cache key of a single cell: (location, sub-location, date, time-of-day).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub location: String,
    pub sub_location: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
}

impl SlotKey {
    pub fn day(&self) -> DayKey {
        DayKey {
            location: self.location.clone(),
            sub_location: self.sub_location.clone(),
            date: self.date,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} {}",
            self.location,
            self.sub_location,
            self.date,
            self.start.format("%H:%M")
        )
    }
}

/// Last observed state of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAvailability {
    pub key: SlotKey,
    pub end: NaiveTime,
    pub slot_ref: SlotRef,
    pub is_available: bool,
    pub total_capacity: u32,
    pub remaining_capacity: u32,
    pub observed_at: Ms,
}

impl SlotAvailability {
    pub fn is_bookable(&self) -> bool {
        self.is_available && self.remaining_capacity > 0
    }

    /// True if `self` starts exactly where `prev` ends on the same day.
    pub fn follows(&self, prev: &SlotAvailability) -> bool {
        prev.end == self.key.start
            && prev.key.date == self.key.date
            && prev.key.location == self.key.location
            && prev.key.sub_location == self.key.sub_location
    }
}

/// A cache entry as handed to readers: staleness is always explicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSlot {
    pub slot: SlotAvailability,
    pub is_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    /// Handle understood by the vendor client; never interpreted here.
    pub credentials_ref: String,
    pub active: bool,
    pub created_at: Ms,
}

/// What a job wants to claim on its target date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotTarget {
    Single {
        time_slot: NaiveTime,
    },
    Window {
        start: NaiveTime,
        end: NaiveTime,
        consecutive_hours: u32,
    },
}

impl SlotTarget {
    /// Number of slots a fully successful dispatch claims.
    pub fn required_len(&self) -> usize {
        match self {
            SlotTarget::Single { .. } => 1,
            SlotTarget::Window {
                consecutive_hours, ..
            } => *consecutive_hours as usize,
        }
    }

    /// Whether a slot `[start, end)` lies inside the target.
    pub fn covers(&self, start: NaiveTime, end: NaiveTime) -> bool {
        match self {
            SlotTarget::Single { time_slot } => *time_slot == start,
            SlotTarget::Window {
                start: w_start,
                end: w_end,
                ..
            } => *w_start <= start && end <= *w_end,
        }
    }
}

/// Everything an operator supplies to schedule a snipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnipeSpec {
    pub target_date: NaiveDate,
    pub location: String,
    pub sub_location: String,
    pub target: SlotTarget,
    /// Attempt order.
    pub accounts: Vec<AccountId>,
    pub scheduled_execution: Ms,
    /// Lower value wins ties between jobs due at the same instant.
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Armed,
    Executing,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
    Archived,
}

impl JobState {
    /// Outcome states: the job has run (or been cancelled) and will not run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::PartiallySucceeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Pending, Armed) | (Pending, Cancelled) => true,
            (Armed, Executing) | (Armed, Cancelled) => true,
            (Executing, Succeeded)
            | (Executing, PartiallySucceeded)
            | (Executing, Failed)
            | (Executing, Cancelled) => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Armed => "armed",
            JobState::Executing => "executing",
            JobState::Succeeded => "succeeded",
            JobState::PartiallySucceeded => "partially_succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Archived => "archived",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedSlot {
    pub start: NaiveTime,
    pub account_id: AccountId,
    pub booking_ref: BookingRef,
}

/// Result summary stored on a job once it leaves `Executing`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub claimed: Vec<ClaimedSlot>,
    pub missed: Vec<NaiveTime>,
    pub note: Option<String>,
}

impl JobSummary {
    pub fn claimed_times(&self) -> Vec<NaiveTime> {
        self.claimed.iter().map(|c| c.start).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnipeJob {
    pub id: JobId,
    pub target_date: NaiveDate,
    pub location: String,
    pub sub_location: String,
    pub target: SlotTarget,
    pub accounts: Vec<AccountId>,
    pub scheduled_execution: Ms,
    pub priority: i32,
    pub state: JobState,
    pub summary: Option<JobSummary>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl SnipeJob {
    pub fn from_spec(id: JobId, spec: SnipeSpec, now: Ms) -> Self {
        Self {
            id,
            target_date: spec.target_date,
            location: spec.location,
            sub_location: spec.sub_location,
            target: spec.target,
            accounts: spec.accounts,
            scheduled_execution: spec.scheduled_execution,
            priority: spec.priority,
            state: JobState::Pending,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn day(&self) -> DayKey {
        DayKey {
            location: self.location.clone(),
            sub_location: self.sub_location.clone(),
            date: self.target_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Auth,
    Validation,
    NotFound,
    Cancelled,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success { booking_ref: BookingRef },
    Conflict,
    Error { kind: ErrorKind, message: String },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::Conflict => "conflict",
            AttemptOutcome::Error { .. } => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }
}

/// One immutable attempt-log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub job_id: JobId,
    pub account_id: AccountId,
    /// Per (job, account) sequence number, starting at 1.
    pub attempt_seq: u32,
    pub slot: SlotKey,
    pub slot_end: NaiveTime,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    pub at: Ms,
}

impl AttemptRecord {
    /// Idempotency key of the row.
    pub fn key(&self) -> (JobId, AccountId, u32) {
        (self.job_id, self.account_id, self.attempt_seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Failed,
}

impl BookingStatus {
    pub fn label(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Failed => "failed",
        }
    }

    /// Pending and confirmed bookings occupy the slot for their account.
    pub fn is_live(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub account_id: AccountId,
    pub job_id: Option<JobId>,
    pub slot: SlotKey,
    pub end: NaiveTime,
    pub status: BookingStatus,
    pub external_ref: Option<BookingRef>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountAdded {
        account: Account,
    },
    AccountStatusChanged {
        id: AccountId,
        active: bool,
    },
    JobCreated {
        job: SnipeJob,
    },
    JobTransitioned {
        id: JobId,
        from: JobState,
        to: JobState,
        summary: Option<JobSummary>,
        at: Ms,
    },
    AttemptLogged {
        record: AttemptRecord,
        booking: Option<Booking>,
    },
    BookingRestored {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
}
