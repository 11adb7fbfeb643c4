use super::*;
use chrono::{NaiveDate, NaiveTime};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotsnipe_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn h(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, 0, 0).unwrap()
}

fn day() -> DayKey {
    DayKey::new("X3", "A", NaiveDate::from_ymd_opt(2025, 11, 22).unwrap())
}

fn account(name: &str) -> Account {
    Account {
        id: Ulid::new(),
        username: name.into(),
        credentials_ref: format!("vault:{name}"),
        active: true,
        created_at: 1_000,
    }
}

fn job(accounts: Vec<AccountId>, scheduled: Ms) -> SnipeJob {
    let spec = SnipeSpec {
        target_date: day().date,
        location: "X3".into(),
        sub_location: "A".into(),
        target: SlotTarget::Single { time_slot: h(13) },
        accounts,
        scheduled_execution: scheduled,
        priority: 0,
    };
    SnipeJob::from_spec(Ulid::new(), spec, 1_000)
}

fn success(job_id: JobId, account_id: AccountId, seq: u32, hour: u32) -> AttemptRecord {
    AttemptRecord {
        job_id,
        account_id,
        attempt_seq: seq,
        slot: day().slot(h(hour)),
        slot_end: h(hour + 1),
        outcome: AttemptOutcome::Success {
            booking_ref: BookingRef(format!("bk-{hour}")),
        },
        latency_ms: 40,
        at: 5_000,
    }
}

fn conflict(job_id: JobId, account_id: AccountId, seq: u32, hour: u32) -> AttemptRecord {
    AttemptRecord {
        outcome: AttemptOutcome::Conflict,
        ..success(job_id, account_id, seq, hour)
    }
}

async fn armed(store: &WalStore, job: &SnipeJob) {
    store.insert_job(job.clone()).await.unwrap();
    assert!(store
        .transition_job(job.id, JobState::Pending, JobState::Armed, None, 2_000)
        .await
        .unwrap());
}

// ── Accounts ─────────────────────────────────────────────

#[tokio::test]
async fn duplicate_username_rejected() {
    let store = WalStore::open(&test_wal_path("dup_username.wal")).unwrap();
    store.add_account(account("alice")).await.unwrap();
    let err = store.add_account(account("alice")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
    assert_eq!(store.list_accounts(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_username_rejected() {
    let store = WalStore::open(&test_wal_path("long_username.wal")).unwrap();
    let err = store
        .add_account(account(&"x".repeat(crate::limits::MAX_NAME_LEN + 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LimitExceeded(_)));
}

#[tokio::test]
async fn deactivated_accounts_filtered() {
    let store = WalStore::open(&test_wal_path("deactivate.wal")).unwrap();
    let alice = account("alice");
    let bob = account("bob");
    store.add_account(alice.clone()).await.unwrap();
    store.add_account(bob.clone()).await.unwrap();
    store.set_account_active(bob.id, false).await.unwrap();

    let active = store.list_accounts(true).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, alice.id);
    assert!(!store.get_account(bob.id).await.unwrap().active);
    assert!(!store.can_account_book(bob.id, &day().slot(h(9))).await.unwrap());
}

#[tokio::test]
async fn unknown_account_not_found() {
    let store = WalStore::open(&test_wal_path("unknown_account.wal")).unwrap();
    let id = Ulid::new();
    assert_eq!(store.get_account(id).await, Err(StoreError::NotFound(id)));
    assert_eq!(
        store.set_account_active(id, false).await,
        Err(StoreError::NotFound(id))
    );
}

// ── Job transitions ──────────────────────────────────────

#[tokio::test]
async fn transition_is_compare_and_set() {
    let store = WalStore::open(&test_wal_path("cas.wal")).unwrap();
    let j = job(vec![], 10_000);
    armed(&store, &j).await;

    assert!(store
        .transition_job(j.id, JobState::Armed, JobState::Executing, None, 3_000)
        .await
        .unwrap());
    assert!(!store
        .transition_job(j.id, JobState::Armed, JobState::Executing, None, 3_001)
        .await
        .unwrap());

    let stored = store.get_job(j.id).await.unwrap();
    assert_eq!(stored.state, JobState::Executing);
    assert_eq!(stored.updated_at, 3_000);
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let store = Arc::new(WalStore::open(&test_wal_path("cas_race.wal")).unwrap());
    let j = job(vec![], 10_000);
    armed(&store, &j).await;

    let id = j.id;
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .transition_job(id, JobState::Armed, JobState::Executing, None, 3_000 + i)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn illegal_transition_rejected() {
    let store = WalStore::open(&test_wal_path("illegal.wal")).unwrap();
    let j = job(vec![], 10_000);
    store.insert_job(j.clone()).await.unwrap();
    let err = store
        .transition_job(j.id, JobState::Pending, JobState::Succeeded, None, 1)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::InvalidTransition {
            from: JobState::Pending,
            to: JobState::Succeeded
        }
    );
}

#[tokio::test]
async fn archived_job_is_immutable() {
    let store = WalStore::open(&test_wal_path("archived.wal")).unwrap();
    let j = job(vec![], 10_000);
    armed(&store, &j).await;
    store
        .transition_job(j.id, JobState::Armed, JobState::Cancelled, None, 3_000)
        .await
        .unwrap();
    store
        .transition_job(j.id, JobState::Cancelled, JobState::Archived, None, 4_000)
        .await
        .unwrap();
    assert!(store
        .transition_job(j.id, JobState::Archived, JobState::Armed, None, 5_000)
        .await
        .is_err());
    assert_eq!(store.get_job(j.id).await.unwrap().state, JobState::Archived);
}

#[tokio::test]
async fn due_query_respects_deadline_and_state() {
    let store = WalStore::open(&test_wal_path("due.wal")).unwrap();
    let soon = job(vec![], 10_000);
    let later = job(vec![], 90_000);
    let pending = job(vec![], 5_000);
    armed(&store, &soon).await;
    armed(&store, &later).await;
    store.insert_job(pending.clone()).await.unwrap();

    let due = store.armed_jobs_due_before(20_000).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, soon.id);
}

#[tokio::test]
async fn due_query_follows_arming_and_claims_across_reopen() {
    let path = test_wal_path("due_index.wal");
    let claimed = job(vec![], 10_000);
    let cancelled = job(vec![], 11_000);
    let waiting = job(vec![], 12_000);
    {
        let store = WalStore::open(&path).unwrap();
        for j in [&claimed, &cancelled, &waiting] {
            armed(&store, j).await;
        }
        assert_eq!(store.armed_jobs_due_before(20_000).await.unwrap().len(), 3);

        store
            .transition_job(claimed.id, JobState::Armed, JobState::Executing, None, 3_000)
            .await
            .unwrap();
        store
            .transition_job(cancelled.id, JobState::Armed, JobState::Cancelled, None, 3_000)
            .await
            .unwrap();
        let due = store.armed_jobs_due_before(20_000).await.unwrap();
        assert_eq!(due.iter().map(|j| j.id).collect::<Vec<_>>(), vec![waiting.id]);
    }

    let store = WalStore::open(&path).unwrap();
    let due = store.armed_jobs_due_before(20_000).await.unwrap();
    assert_eq!(due.iter().map(|j| j.id).collect::<Vec<_>>(), vec![waiting.id]);
    assert!(store.armed_jobs_due_before(11_999).await.unwrap().is_empty());
    assert_eq!(store.list_jobs(Some(JobState::Executing)).await.unwrap().len(), 1);
    assert_eq!(store.list_jobs(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn duplicate_job_rejected() {
    let store = WalStore::open(&test_wal_path("dup_job.wal")).unwrap();
    let j = job(vec![], 10_000);
    store.insert_job(j.clone()).await.unwrap();
    assert!(matches!(
        store.insert_job(j).await,
        Err(StoreError::AlreadyExists(_))
    ));
}

// ── Attempts and bookings ────────────────────────────────

#[tokio::test]
async fn success_derives_one_booking() {
    let store = WalStore::open(&test_wal_path("derive.wal")).unwrap();
    let alice = account("alice");
    store.add_account(alice.clone()).await.unwrap();
    let j = job(vec![alice.id], 10_000);

    assert!(store.append_attempt(success(j.id, alice.id, 1, 13)).await.unwrap());
    let bookings = store.bookings_for_account(alice.id).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].status, BookingStatus::Confirmed);
    assert_eq!(bookings[0].job_id, Some(j.id));
    assert_eq!(bookings[0].external_ref, Some(BookingRef("bk-13".into())));
    assert!(!store.can_account_book(alice.id, &day().slot(h(13))).await.unwrap());
    assert!(store.can_account_book(alice.id, &day().slot(h(14))).await.unwrap());
}

#[tokio::test]
async fn attempt_append_is_idempotent() {
    let store = WalStore::open(&test_wal_path("idempotent.wal")).unwrap();
    let alice = account("alice");
    store.add_account(alice.clone()).await.unwrap();
    let j = job(vec![alice.id], 10_000);

    let record = success(j.id, alice.id, 1, 13);
    assert!(store.append_attempt(record.clone()).await.unwrap());
    assert!(!store.append_attempt(record).await.unwrap());

    assert_eq!(store.attempts_for_job(j.id).await.unwrap().len(), 1);
    assert_eq!(store.bookings_for_account(alice.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn second_success_on_held_slot_adds_no_booking() {
    let store = WalStore::open(&test_wal_path("held_slot.wal")).unwrap();
    let alice = account("alice");
    store.add_account(alice.clone()).await.unwrap();
    let first = job(vec![alice.id], 10_000);
    let second = job(vec![alice.id], 10_000);

    store.append_attempt(success(first.id, alice.id, 1, 13)).await.unwrap();
    assert!(store.append_attempt(success(second.id, alice.id, 1, 13)).await.unwrap());
    assert_eq!(store.bookings_for_account(alice.id).await.unwrap().len(), 1);
    assert_eq!(store.attempts_for_account(alice.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn conflict_derives_no_booking() {
    let store = WalStore::open(&test_wal_path("conflict.wal")).unwrap();
    let alice = account("alice");
    store.add_account(alice.clone()).await.unwrap();
    let j = job(vec![alice.id], 10_000);
    store.append_attempt(conflict(j.id, alice.id, 1, 13)).await.unwrap();
    assert!(store.bookings_for_account(alice.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_booking_frees_the_slot() {
    let store = WalStore::open(&test_wal_path("cancel_booking.wal")).unwrap();
    let alice = account("alice");
    store.add_account(alice.clone()).await.unwrap();
    let j = job(vec![alice.id], 10_000);
    store.append_attempt(success(j.id, alice.id, 1, 13)).await.unwrap();
    let booking = store.bookings_for_account(alice.id).await.unwrap().remove(0);

    let updated = store
        .set_booking_status(booking.id, BookingStatus::Cancelled, 9_000)
        .await
        .unwrap();
    assert_eq!(updated.status, BookingStatus::Cancelled);
    assert_eq!(updated.updated_at, 9_000);
    assert!(store.live_booking(alice.id, &booking.slot).await.unwrap().is_none());

    let err = store
        .set_booking_status(booking.id, BookingStatus::Confirmed, 9_500)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BookingClosed { .. }));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    let alice = account("alice");
    let j = job(vec![alice.id], 10_000);
    {
        let store = WalStore::open(&path).unwrap();
        store.add_account(alice.clone()).await.unwrap();
        armed(&store, &j).await;
        store
            .transition_job(j.id, JobState::Armed, JobState::Executing, None, 3_000)
            .await
            .unwrap();
        store.append_attempt(success(j.id, alice.id, 1, 13)).await.unwrap();
        let summary = JobSummary {
            claimed: vec![ClaimedSlot {
                start: h(13),
                account_id: alice.id,
                booking_ref: BookingRef("bk-13".into()),
            }],
            missed: vec![],
            note: None,
        };
        store
            .transition_job(j.id, JobState::Executing, JobState::Succeeded, Some(summary), 4_000)
            .await
            .unwrap();
    }

    let store = WalStore::open(&path).unwrap();
    let restored = store.get_job(j.id).await.unwrap();
    assert_eq!(restored.state, JobState::Succeeded);
    assert_eq!(restored.summary.unwrap().claimed_times(), vec![h(13)]);
    assert_eq!(store.attempts_for_job(j.id).await.unwrap().len(), 1);
    assert_eq!(store.bookings_for_account(alice.id).await.unwrap().len(), 1);
    assert!(matches!(
        store.add_account(account("alice")).await,
        Err(StoreError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn replayed_append_after_restart_is_noop() {
    let path = test_wal_path("replay_dedupe.wal");
    let alice = account("alice");
    let j = job(vec![alice.id], 10_000);
    let record = success(j.id, alice.id, 1, 13);
    {
        let store = WalStore::open(&path).unwrap();
        store.add_account(alice.clone()).await.unwrap();
        store.append_attempt(record.clone()).await.unwrap();
    }
    let store = WalStore::open(&path).unwrap();
    assert!(!store.append_attempt(record).await.unwrap());
    assert_eq!(store.bookings_for_account(alice.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn compact_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let alice = account("alice");
    let j = job(vec![alice.id], 10_000);
    let booking_id;
    {
        let store = WalStore::open(&path).unwrap();
        store.add_account(alice.clone()).await.unwrap();
        store.set_account_active(alice.id, false).await.unwrap();
        store.set_account_active(alice.id, true).await.unwrap();
        armed(&store, &j).await;
        store.append_attempt(conflict(j.id, alice.id, 1, 13)).await.unwrap();
        store.append_attempt(success(j.id, alice.id, 2, 14)).await.unwrap();
        booking_id = store.bookings_for_account(alice.id).await.unwrap()[0].id;
        store
            .set_booking_status(booking_id, BookingStatus::Cancelled, 7_000)
            .await
            .unwrap();

        assert!(store.appends_since_compact().await > 0);
        let size_before = std::fs::metadata(&path).unwrap().len();
        store.compact().await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
        let size_after = std::fs::metadata(&path).unwrap().len();
        assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than {size_before}");

        store.set_account_active(alice.id, false).await.unwrap();
    }

    let store = WalStore::open(&path).unwrap();
    assert!(!store.get_account(alice.id).await.unwrap().active);
    assert_eq!(store.get_job(j.id).await.unwrap().state, JobState::Armed);
    assert_eq!(store.attempts_for_job(j.id).await.unwrap().len(), 2);
    let booking = store.get_booking(booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert!(store.live_booking(alice.id, &booking.slot).await.unwrap().is_none());
}

// ── Retry helper ─────────────────────────────────────────

#[tokio::test]
async fn retry_persist_retries_only_wal_errors() {
    let calls = AtomicUsize::new(0);
    let result = retry_persist("flaky", Duration::from_millis(1), || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 3 {
                Err(StoreError::Wal("disk full".into()))
            } else {
                Ok(n)
            }
        }
    })
    .await;
    assert_eq!(result, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let calls = AtomicUsize::new(0);
    let id = Ulid::new();
    let result: Result<(), _> = retry_persist("missing", Duration::from_millis(1), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Err(StoreError::NotFound(id)) }
    })
    .await;
    assert_eq!(result, Err(StoreError::NotFound(id)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
