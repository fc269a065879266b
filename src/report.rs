//! Aggregation of close encounters per taxi pair.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunks::write_csv_atomic;
use crate::{ProximityEvent, Result};

/// Number of trip pairs with a close encounter, per unordered taxi pair.
///
/// `vehicle_a <= vehicle_b` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxiPairSummary {
    pub vehicle_a: String,
    pub vehicle_b: String,
    pub close_events: u64,
}

/// Group events by unordered taxi pair and count them.
///
/// Sorted by `close_events` descending, ties by taxi ids ascending.
pub fn aggregate_by_taxi_pair(events: &[ProximityEvent]) -> Vec<TaxiPairSummary> {
    let mut counts: HashMap<(&str, &str), u64> = HashMap::new();
    for event in events {
        let key = if event.vehicle_a <= event.vehicle_b {
            (event.vehicle_a.as_str(), event.vehicle_b.as_str())
        } else {
            (event.vehicle_b.as_str(), event.vehicle_a.as_str())
        };
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut summary: Vec<TaxiPairSummary> = counts
        .into_iter()
        .map(|((a, b), close_events)| TaxiPairSummary {
            vehicle_a: a.to_string(),
            vehicle_b: b.to_string(),
            close_events,
        })
        .collect();

    summary.sort_by(|x, y| {
        y.close_events
            .cmp(&x.close_events)
            .then_with(|| x.vehicle_a.cmp(&y.vehicle_a))
            .then_with(|| x.vehicle_b.cmp(&y.vehicle_b))
    });
    summary
}

/// Persist the full summary table (`vehicle_a, vehicle_b, close_events`).
pub fn write_summary(path: &Path, summary: &[TaxiPairSummary]) -> Result<()> {
    write_csv_atomic(path, summary, &["vehicle_a", "vehicle_b", "close_events"])
}

/// Render the first `n` rows as an aligned text table.
pub fn format_top(summary: &[TaxiPairSummary], n: usize) -> String {
    let rows = &summary[..n.min(summary.len())];
    let width_a = rows
        .iter()
        .map(|r| r.vehicle_a.len())
        .chain(std::iter::once("vehicle_a".len()))
        .max()
        .unwrap_or(0);
    let width_b = rows
        .iter()
        .map(|r| r.vehicle_b.len())
        .chain(std::iter::once("vehicle_b".len()))
        .max()
        .unwrap_or(0);

    let mut out = format!(
        "{:<wa$}  {:<wb$}  close_events\n",
        "vehicle_a",
        "vehicle_b",
        wa = width_a,
        wb = width_b
    );
    for row in rows {
        out.push_str(&format!(
            "{:<wa$}  {:<wb$}  {:>12}\n",
            row.vehicle_a,
            row.vehicle_b,
            row.close_events,
            wa = width_a,
            wb = width_b
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn event(vehicle_a: &str, vehicle_b: &str, trip_a: &str) -> ProximityEvent {
        ProximityEvent {
            vehicle_a: vehicle_a.to_string(),
            vehicle_b: vehicle_b.to_string(),
            trip_a: trip_a.to_string(),
            trip_b: "t".to_string(),
            distance_m: 1.0,
            time_diff_s: 0,
        }
    }

    #[test]
    fn test_groups_unordered_pairs() {
        let events = vec![event("X", "Y", "1"), event("Y", "X", "2"), event("X", "Z", "3")];
        let summary = aggregate_by_taxi_pair(&events);
        assert_eq!(summary.len(), 2);
        assert_eq!(
            summary[0],
            TaxiPairSummary {
                vehicle_a: "X".to_string(),
                vehicle_b: "Y".to_string(),
                close_events: 2
            }
        );
        assert_eq!(summary[1].close_events, 1);
    }

    #[test]
    fn test_invariant_under_event_order() {
        let mut events = vec![
            event("A", "B", "1"),
            event("C", "B", "2"),
            event("B", "A", "3"),
            event("B", "C", "4"),
            event("D", "A", "5"),
        ];
        let forward = aggregate_by_taxi_pair(&events);
        events.reverse();
        assert_eq!(aggregate_by_taxi_pair(&events), forward);
    }

    #[test]
    fn test_ties_sorted_by_ids() {
        let summary = aggregate_by_taxi_pair(&[event("M", "N", "1"), event("B", "A", "2")]);
        assert_eq!(summary[0].vehicle_a, "A");
        assert_eq!(summary[1].vehicle_a, "M");
    }

    #[test]
    fn test_empty_events() {
        assert!(aggregate_by_taxi_pair(&[]).is_empty());
        assert_eq!(format_top(&[], 20).lines().count(), 1);
    }

    #[test]
    fn test_write_summary() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("summary.csv");
        let summary = aggregate_by_taxi_pair(&[event("X", "Y", "1")]);
        write_summary(&path, &summary).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "vehicle_a,vehicle_b,close_events\nX,Y,1\n");
    }

    #[test]
    fn test_format_top_limits_rows() {
        let events: Vec<ProximityEvent> = (0..5)
            .map(|i| event(&format!("taxi-{}", i), "other", "t"))
            .collect();
        let table = format_top(&aggregate_by_taxi_pair(&events), 3);
        assert_eq!(table.lines().count(), 4);
    }
}
