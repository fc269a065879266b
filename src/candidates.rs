//! Candidate pair generation.
//!
//! Finds every pair of trips from different taxis whose time windows overlap,
//! using a sweep over start times instead of comparing all trips pairwise:
//!
//! 1. Sort windows by `(start, trip_id)`
//! 2. Keep an active set of earlier windows ordered by end time
//! 3. Before visiting a window, expire active windows that ended before it starts
//! 4. Every window still active overlaps the current one
//!
//! Cost is O(n log n + k) for n trips and k emitted pairs. The emission order
//! only depends on the input set, so repeated runs produce the same list
//! (chunk boundaries depend on it).

use std::collections::BTreeSet;

use crate::{CandidatePair, TripWindow};

/// Generate overlapping trip pairs, stopping after `limit` pairs if given.
///
/// Pairs are normalised so that `trip_a < trip_b`. Trips of the same taxi
/// never pair with each other. Empty input yields an empty list.
///
/// # Example
/// ```
/// use taxi_proximity::{generate_candidate_pairs, TripWindow};
///
/// let windows = vec![
///     TripWindow::new("t1", "taxi-1", 0, 600).unwrap(),
///     TripWindow::new("t2", "taxi-2", 300, 900).unwrap(),
///     TripWindow::new("t3", "taxi-3", 1000, 1200).unwrap(),
/// ];
/// let pairs = generate_candidate_pairs(&windows, None);
/// assert_eq!(pairs.len(), 1);
/// assert_eq!((pairs[0].trip_a.as_str(), pairs[0].trip_b.as_str()), ("t1", "t2"));
/// ```
pub fn generate_candidate_pairs(
    windows: &[TripWindow],
    limit: Option<usize>,
) -> Vec<CandidatePair> {
    if windows.len() < 2 || limit == Some(0) {
        return vec![];
    }

    let mut order: Vec<&TripWindow> = windows.iter().collect();
    order.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.trip_id.cmp(&b.trip_id))
    });

    // (end, index into `order`)
    let mut active: BTreeSet<(i64, usize)> = BTreeSet::new();
    let mut pairs = Vec::new();

    for (idx, current) in order.iter().enumerate() {
        while let Some(&(end, _)) = active.first() {
            if end < current.start {
                active.pop_first();
            } else {
                break;
            }
        }

        for &(_, other_idx) in &active {
            let other = order[other_idx];
            if other.taxi_id == current.taxi_id || other.trip_id == current.trip_id {
                continue;
            }
            pairs.push(make_pair(other, current));
            if limit.is_some_and(|l| pairs.len() >= l) {
                return pairs;
            }
        }

        active.insert((current.end, idx));
    }

    pairs
}

fn make_pair(x: &TripWindow, y: &TripWindow) -> CandidatePair {
    let (a, b) = if x.trip_id <= y.trip_id { (x, y) } else { (y, x) };
    CandidatePair {
        vehicle_a: a.taxi_id.clone(),
        vehicle_b: b.taxi_id.clone(),
        trip_a: a.trip_id.clone(),
        trip_b: b.trip_id.clone(),
    }
}

/// Every trip id referenced by the pairs, sorted and deduplicated.
pub fn involved_trip_ids(pairs: &[CandidatePair]) -> BTreeSet<String> {
    pairs
        .iter()
        .flat_map(|p| [p.trip_a.clone(), p.trip_b.clone()])
        .collect()
}
