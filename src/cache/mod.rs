pub mod poller;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::limits::MAX_SLOTS_PER_DAY;
use crate::model::*;
use crate::vendor::{VendorClient, VendorError, VendorSlot, with_timeout};

pub use poller::run_poller;

type SharedDay = Arc<RwLock<BTreeMap<NaiveTime, SlotAvailability>>>;

/// An entry is stale once strictly more than `ttl` has passed since it was observed.
pub fn is_stale(now: Ms, observed_at: Ms, ttl: Ms) -> bool {
    now - observed_at > ttl
}

/// What one refresh did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub upserted: usize,
    /// Entries kept because the cache already held a newer observation.
    pub ignored_older: usize,
    /// Cached slots the vendor no longer lists; now marked unavailable.
    pub withdrawn: usize,
}

/// Freshness-bounded view of vendor availability, one sorted map per day.
pub struct AvailabilityCache {
    days: DashMap<DayKey, SharedDay>,
    /// Days the poller keeps warm, with a count of interested jobs.
    watched: DashMap<DayKey, usize>,
    vendor: Arc<dyn VendorClient>,
    clock: SharedClock,
    ttl_ms: Ms,
    vendor_timeout: Duration,
}

impl AvailabilityCache {
    pub fn new(vendor: Arc<dyn VendorClient>, clock: SharedClock, ttl: Duration, vendor_timeout: Duration) -> Self {
        Self {
            days: DashMap::new(),
            watched: DashMap::new(),
            vendor,
            clock,
            ttl_ms: ttl.as_millis() as Ms,
            vendor_timeout,
        }
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    fn day_state(&self, day: &DayKey) -> SharedDay {
        self.days.entry(day.clone()).or_default().value().clone()
    }

    /// Poll the vendor for `day` and merge the answer.
    ///
    /// On failure nothing is touched: readers keep the last-known-good entries,
    /// now aging towards stale.
    pub async fn refresh(&self, day: &DayKey) -> Result<RefreshReport, VendorError> {
        let observed_at = self.clock.now_ms();
        let fetch = self
            .vendor
            .fetch_slots(&day.location, &day.sub_location, day.date);
        match with_timeout(self.vendor_timeout, fetch).await {
            Ok(slots) => {
                metrics::counter!(crate::observability::CACHE_REFRESH_TOTAL, "status" => "ok").increment(1);
                Ok(self.merge(day, observed_at, slots).await)
            }
            Err(e) => {
                metrics::counter!(crate::observability::CACHE_REFRESH_TOTAL, "status" => "error").increment(1);
                Err(e)
            }
        }
    }

    /// Merge a vendor listing observed at `observed_at` into the cache.
    ///
    /// Last write wins per slot, judged by observation time: a listing older than
    /// what is cached for a slot leaves that slot alone.
    pub async fn merge(&self, day: &DayKey, observed_at: Ms, slots: Vec<VendorSlot>) -> RefreshReport {
        let state = self.day_state(day);
        let mut guard = state.write().await;
        let mut report = RefreshReport::default();

        // Slots past the cap were listed too; they are neither stored nor withdrawn.
        let listed: BTreeSet<NaiveTime> = slots.iter().map(|vs| vs.start).collect();
        if slots.len() > MAX_SLOTS_PER_DAY {
            warn!(
                day = %day,
                listed = slots.len(),
                kept = MAX_SLOTS_PER_DAY,
                "vendor listing truncated"
            );
        }
        for vs in slots.into_iter().take(MAX_SLOTS_PER_DAY) {
            if let Some(existing) = guard.get(&vs.start)
                && existing.observed_at > observed_at
            {
                report.ignored_older += 1;
                continue;
            }
            guard.insert(
                vs.start,
                SlotAvailability {
                    key: day.slot(vs.start),
                    end: vs.end,
                    slot_ref: vs.slot_ref,
                    is_available: vs.remaining_capacity > 0,
                    total_capacity: vs.total_capacity,
                    remaining_capacity: vs.remaining_capacity,
                    observed_at,
                },
            );
            report.upserted += 1;
        }

        for (start, entry) in guard.iter_mut() {
            if listed.contains(start) || entry.observed_at > observed_at {
                continue;
            }
            entry.is_available = false;
            entry.remaining_capacity = 0;
            entry.observed_at = observed_at;
            report.withdrawn += 1;
        }

        debug!(
            day = %day,
            upserted = report.upserted,
            ignored = report.ignored_older,
            withdrawn = report.withdrawn,
            "availability merged"
        );
        report
    }

    /// Every cached slot of `day`, in time order, tagged with staleness as of now.
    pub async fn read(&self, day: &DayKey) -> Vec<CachedSlot> {
        let Some(state) = self.days.get(day).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let now = self.clock.now_ms();
        let guard = state.read().await;
        guard
            .values()
            .map(|slot| CachedSlot {
                is_stale: is_stale(now, slot.observed_at, self.ttl_ms),
                slot: slot.clone(),
            })
            .collect()
    }

    /// Only the entries still inside their TTL.
    pub async fn read_fresh(&self, day: &DayKey) -> Vec<SlotAvailability> {
        self.read(day)
            .await
            .into_iter()
            .filter(|c| !c.is_stale)
            .map(|c| c.slot)
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.days
            .iter()
            .map(|e| e.value().try_read().map(|g| g.len()).unwrap_or(0))
            .sum()
    }

    // ── Watch list ───────────────────────────────────────────

    pub fn watch(&self, day: &DayKey) {
        *self.watched.entry(day.clone()).or_insert(0) += 1;
    }

    pub fn unwatch(&self, day: &DayKey) {
        self.watched.remove_if_mut(day, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn watched_days(&self) -> Vec<DayKey> {
        self.watched.iter().map(|e| e.key().clone()).collect()
    }
}
