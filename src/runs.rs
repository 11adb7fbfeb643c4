use std::cmp::Ordering;

use crate::model::SlotAvailability;

// ── Consecutive-run finder ────────────────────────────────────────
//
// Pure functions over a snapshot of cached slots. They only read their input,
// so any number of schedulers can call them on the same data.

/// Sorted copy of the input: by day key, then start time.
fn sorted(slots: &[SlotAvailability]) -> Vec<SlotAvailability> {
    let mut out = slots.to_vec();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Split a sorted list into maximal runs of back-to-back slots satisfying `keep`.
fn split_runs(
    slots: &[SlotAvailability],
    keep: impl Fn(&SlotAvailability) -> bool,
) -> Vec<Vec<SlotAvailability>> {
    let mut runs: Vec<Vec<SlotAvailability>> = Vec::new();
    let mut current: Vec<SlotAvailability> = Vec::new();
    for slot in slots {
        if !keep(slot) {
            if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(last) = current.last()
            && !slot.follows(last)
        {
            runs.push(std::mem::take(&mut current));
        }
        current.push(slot.clone());
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Total remaining capacity across a window.
pub fn window_capacity(window: &[SlotAvailability]) -> u64 {
    window.iter().map(|s| s.remaining_capacity as u64).sum()
}

/// Ranking: earliest start first, then the most remaining capacity.
pub fn compare_windows(a: &[SlotAvailability], b: &[SlotAvailability]) -> Ordering {
    let start = |w: &[SlotAvailability]| w.first().map(|s| (s.key.date, s.key.start));
    start(a)
        .cmp(&start(b))
        .then_with(|| window_capacity(b).cmp(&window_capacity(a)))
}

/// Every maximal run of bookable, back-to-back slots with at least `min_len` slots.
pub fn maximal_runs(slots: &[SlotAvailability], min_len: usize) -> Vec<Vec<SlotAvailability>> {
    if min_len == 0 {
        return Vec::new();
    }
    split_runs(&sorted(slots), SlotAvailability::is_bookable)
        .into_iter()
        .filter(|run| run.len() >= min_len)
        .collect()
}

/// Every `len`-slot window inside a bookable run, ranked best first.
///
/// A run of 5 slots with `len = 3` yields the three windows starting at its first,
/// second and third slot.
pub fn consecutive_windows(slots: &[SlotAvailability], len: usize) -> Vec<Vec<SlotAvailability>> {
    let mut windows: Vec<Vec<SlotAvailability>> = maximal_runs(slots, len)
        .iter()
        .flat_map(|run| run.windows(len).map(|w| w.to_vec()).collect::<Vec<_>>())
        .collect();
    windows.sort_by(|a, b| compare_windows(a, b));
    windows
}

/// Fallback when no fully bookable window exists: every `len`-slot back-to-back
/// window regardless of availability, ranked by how many of its slots are
/// bookable, then by the usual window ranking.
pub fn best_effort_windows(slots: &[SlotAvailability], len: usize) -> Vec<Vec<SlotAvailability>> {
    if len == 0 {
        return Vec::new();
    }
    let bookable = |w: &[SlotAvailability]| w.iter().filter(|s| s.is_bookable()).count();
    let mut windows: Vec<Vec<SlotAvailability>> = split_runs(&sorted(slots), |_| true)
        .iter()
        .filter(|run| run.len() >= len)
        .flat_map(|run| run.windows(len).map(|w| w.to_vec()).collect::<Vec<_>>())
        .collect();
    windows.sort_by(|a, b| bookable(b).cmp(&bookable(a)).then_with(|| compare_windows(a, b)));
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};

    fn h(hour: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap()
    }

    fn day() -> DayKey {
        DayKey::new("X3", "A", NaiveDate::from_ymd_opt(2025, 11, 22).unwrap())
    }

    fn slot(hour: u32, remaining: u32) -> SlotAvailability {
        SlotAvailability {
            key: day().slot(h(hour)),
            end: h(hour + 1),
            slot_ref: SlotRef(format!("r{hour}")),
            is_available: remaining > 0,
            total_capacity: 10,
            remaining_capacity: remaining,
            observed_at: 0,
        }
    }

    fn starts(windows: &[Vec<SlotAvailability>]) -> Vec<Vec<u32>> {
        use chrono::Timelike;
        windows
            .iter()
            .map(|w| w.iter().map(|s| s.key.start.hour()).collect())
            .collect()
    }

    #[test]
    fn gap_prevents_three_hour_run() {
        let slots = vec![slot(13, 5), slot(14, 5), slot(16, 5), slot(17, 5)];
        assert!(consecutive_windows(&slots, 3).is_empty());
        assert!(maximal_runs(&slots, 3).is_empty());
        assert_eq!(starts(&maximal_runs(&slots, 2)), vec![vec![13, 14], vec![16, 17]]);
    }

    #[test]
    fn full_afternoon_yields_every_sub_window() {
        let slots: Vec<_> = (13..18).map(|hr| slot(hr, 10)).collect();
        let windows = consecutive_windows(&slots, 3);
        assert_eq!(
            starts(&windows),
            vec![vec![13, 14, 15], vec![14, 15, 16], vec![15, 16, 17]]
        );
        assert_eq!(starts(&maximal_runs(&slots, 3)), vec![vec![13, 14, 15, 16, 17]]);
    }

    #[test]
    fn unavailable_slot_splits_runs() {
        let slots = vec![slot(9, 1), slot(10, 0), slot(11, 2), slot(12, 2)];
        assert_eq!(starts(&consecutive_windows(&slots, 2)), vec![vec![11, 12]]);
    }

    #[test]
    fn time_gap_between_half_hour_slots_splits_runs() {
        let mut a = slot(9, 3);
        a.end = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let b = slot(10, 3);
        assert!(consecutive_windows(&[a, b], 2).is_empty());
    }

    #[test]
    fn input_order_does_not_matter() {
        let slots = vec![slot(15, 1), slot(13, 1), slot(14, 1)];
        assert_eq!(starts(&consecutive_windows(&slots, 3)), vec![vec![13, 14, 15]]);
    }

    #[test]
    fn equal_start_ranks_by_capacity() {
        let other = DayKey::new("X3", "B", day().date);
        let mut b13 = slot(13, 9);
        b13.key = other.slot(h(13));
        let mut b14 = slot(14, 9);
        b14.key = other.slot(h(14));

        let slots = vec![slot(13, 1), slot(14, 1), b13, b14];
        let windows = consecutive_windows(&slots, 2);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0][0].key.sub_location, "B");
        assert_eq!(window_capacity(&windows[0]), 18);
    }

    #[test]
    fn zero_length_request_is_empty() {
        let slots = vec![slot(13, 1)];
        assert!(consecutive_windows(&slots, 0).is_empty());
        assert!(best_effort_windows(&slots, 0).is_empty());
    }

    #[test]
    fn best_effort_prefers_most_bookable() {
        let slots = vec![slot(12, 0), slot(13, 0), slot(14, 4), slot(15, 4)];
        let windows = best_effort_windows(&slots, 3);
        assert_eq!(starts(&windows), vec![vec![13, 14, 15], vec![12, 13, 14]]);
    }

    #[test]
    fn finder_does_not_mutate_input() {
        let slots = vec![slot(14, 2), slot(13, 2)];
        let before = slots.clone();
        let _ = consecutive_windows(&slots, 2);
        assert_eq!(slots, before);
    }
}
