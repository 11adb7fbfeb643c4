use serde::Serialize;

use crate::model::{Account, AccountId, AttemptOutcome, AttemptRecord, Booking, BookingStatus};

use super::{JobStore, StoreError};

/// Aggregate over a set of attempt-log rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptStats {
    pub total: usize,
    pub successes: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub mean_latency_ms: f64,
}

impl AttemptStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a AttemptRecord>) -> Self {
        let mut stats = AttemptStats::default();
        let mut latency_sum: u64 = 0;
        for record in records {
            stats.total += 1;
            latency_sum += record.latency_ms;
            match record.outcome {
                AttemptOutcome::Success { .. } => stats.successes += 1,
                AttemptOutcome::Conflict => stats.conflicts += 1,
                AttemptOutcome::Error { .. } => stats.errors += 1,
            }
        }
        if stats.total > 0 {
            stats.mean_latency_ms = latency_sum as f64 / stats.total as f64;
        }
        stats
    }

    /// Successful attempts as a percentage of all attempts.
    pub fn success_rate(&self) -> f64 {
        percent(self.successes, self.total)
    }
}

/// Per-account booking and attempt summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStats {
    pub account_id: AccountId,
    pub username: String,
    pub total_bookings: usize,
    pub pending_bookings: usize,
    pub confirmed_bookings: usize,
    pub cancelled_bookings: usize,
    pub failed_bookings: usize,
    /// Confirmed bookings as a percentage of all bookings, two decimals.
    pub success_rate: f64,
    pub attempts: AttemptStats,
}

impl AccountStats {
    pub fn compute(account: &Account, bookings: &[Booking], attempts: &[AttemptRecord]) -> Self {
        let count = |status: BookingStatus| bookings.iter().filter(|b| b.status == status).count();
        let confirmed = count(BookingStatus::Confirmed);
        Self {
            account_id: account.id,
            username: account.username.clone(),
            total_bookings: bookings.len(),
            pending_bookings: count(BookingStatus::Pending),
            confirmed_bookings: confirmed,
            cancelled_bookings: count(BookingStatus::Cancelled),
            failed_bookings: count(BookingStatus::Failed),
            success_rate: (percent(confirmed, bookings.len()) * 100.0).round() / 100.0,
            attempts: AttemptStats::from_records(attempts),
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

pub async fn account_statistics(store: &dyn JobStore, id: AccountId) -> Result<AccountStats, StoreError> {
    let account = store.get_account(id).await?;
    let bookings = store.bookings_for_account(id).await?;
    let attempts = store.attempts_for_account(id).await?;
    Ok(AccountStats::compute(&account, &bookings, &attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn slot(hour: u32) -> SlotKey {
        DayKey::new("X1", "A", NaiveDate::from_ymd_opt(2025, 11, 18).unwrap())
            .slot(NaiveTime::from_hms_opt(hour, 0, 0).unwrap())
    }

    fn attempt(outcome: AttemptOutcome, latency_ms: u64) -> AttemptRecord {
        AttemptRecord {
            job_id: Ulid::new(),
            account_id: Ulid::new(),
            attempt_seq: 1,
            slot: slot(13),
            slot_end: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            outcome,
            latency_ms,
            at: 0,
        }
    }

    fn booking(account_id: AccountId, hour: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            account_id,
            job_id: None,
            slot: slot(hour),
            end: NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
            status,
            external_ref: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn attempt_stats_count_outcomes() {
        let records = vec![
            attempt(
                AttemptOutcome::Success {
                    booking_ref: BookingRef("b1".into()),
                },
                100,
            ),
            attempt(AttemptOutcome::Conflict, 200),
            attempt(
                AttemptOutcome::Error {
                    kind: ErrorKind::Timeout,
                    message: "slow".into(),
                },
                600,
            ),
            attempt(AttemptOutcome::Conflict, 300),
        ];
        let stats = AttemptStats::from_records(&records);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.conflicts, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.mean_latency_ms, 300.0);
        assert_eq!(stats.success_rate(), 25.0);
    }

    #[test]
    fn empty_stats_have_zero_rate() {
        let stats = AttemptStats::from_records(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn account_stats_round_success_rate() {
        let account = Account {
            id: Ulid::new(),
            username: "alice".into(),
            credentials_ref: "vault:alice".into(),
            active: true,
            created_at: 0,
        };
        let bookings = vec![
            booking(account.id, 9, BookingStatus::Confirmed),
            booking(account.id, 10, BookingStatus::Cancelled),
            booking(account.id, 11, BookingStatus::Failed),
        ];
        let stats = AccountStats::compute(&account, &bookings, &[]);
        assert_eq!(stats.total_bookings, 3);
        assert_eq!(stats.confirmed_bookings, 1);
        assert_eq!(stats.cancelled_bookings, 1);
        assert_eq!(stats.failed_bookings, 1);
        assert_eq!(stats.success_rate, 33.33);
    }
}
