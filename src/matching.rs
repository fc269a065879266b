//! Pairwise proximity matching.
//!
//! Two trips "came close" when some point of trip A and some point of trip B
//! are within both the distance and the time threshold. Points are sampled on
//! a fixed interval, so `seq` doubles as a clock: only partners close enough
//! in `seq` to pass the time threshold are considered at all (see
//! [`ProximityConfig::seq_window`]).
//!
//! The scan stops at the first qualifying point pair (A in `seq` order, then
//! B in `seq` order inside the window). The result answers "did these trips
//! ever come close?", not "how often?".

use log::debug;

use crate::geo_utils::haversine_distance;
use crate::{CandidatePair, PointTable, ProximityConfig, ProximityEvent, TripTrack};

/// Find the first close encounter between two trips, if any.
///
/// Returns `None` when either track is empty.
///
/// # Example
/// ```
/// use taxi_proximity::{find_first_encounter, ProximityConfig, TripPoint, TripTrack};
///
/// let a = TripTrack::from_points("a", vec![TripPoint::new("a", 0, 41.1579, -8.6291)]);
/// let b = TripTrack::from_points("b", vec![TripPoint::new("b", 2, 41.1579, -8.6291)]);
///
/// // Same place, but 30 seconds apart
/// assert!(find_first_encounter("x", &a, "y", &b, &ProximityConfig::default()).is_none());
/// ```
pub fn find_first_encounter(
    vehicle_a: &str,
    track_a: &TripTrack,
    vehicle_b: &str,
    track_b: &TripTrack,
    config: &ProximityConfig,
) -> Option<ProximityEvent> {
    if track_a.is_empty() || track_b.is_empty() {
        return None;
    }

    let window = config.seq_window();
    for pa in track_a.points() {
        let lo = pa.seq.saturating_sub(window);
        let hi = pa.seq.saturating_add(window);

        for pb in track_b.seq_range(lo, hi) {
            let time_diff_s = pa.seq.abs_diff(pb.seq).saturating_mul(config.sample_interval_s);
            if time_diff_s > config.time_threshold_s {
                continue;
            }

            let distance_m = haversine_distance(&pa.point, &pb.point);
            if distance_m <= config.distance_threshold_m {
                return Some(ProximityEvent {
                    vehicle_a: vehicle_a.to_string(),
                    vehicle_b: vehicle_b.to_string(),
                    trip_a: track_a.trip_id.clone(),
                    trip_b: track_b.trip_id.clone(),
                    distance_m: (distance_m * 100.0).round() / 100.0,
                    time_diff_s,
                });
            }
        }
    }

    None
}

/// Run the matcher over a slice of candidate pairs.
///
/// Pairs whose trips have no usable points are skipped. Events come back in
/// pair order.
pub fn match_pairs(
    pairs: &[CandidatePair],
    points: &PointTable,
    config: &ProximityConfig,
) -> Vec<ProximityEvent> {
    let mut skipped = 0usize;

    let events: Vec<ProximityEvent> = pairs
        .iter()
        .filter_map(|pair| {
            let (Some(a), Some(b)) = (points.get(&pair.trip_a), points.get(&pair.trip_b)) else {
                skipped += 1;
                return None;
            };
            find_first_encounter(&pair.vehicle_a, a, &pair.vehicle_b, b, config)
        })
        .collect();

    if skipped > 0 {
        debug!("[Matcher] Skipped {} pairs with a trip that has no points", skipped);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::EARTH_RADIUS_KM;
    use crate::TripPoint;

    const LAT: f64 = 41.1579;
    const LON: f64 = -8.6291;

    /// Latitude `meters` north of LAT along a meridian.
    fn north_of(meters: f64) -> f64 {
        LAT + (meters / (EARTH_RADIUS_KM * 1000.0)).to_degrees()
    }

    fn track(id: &str, points: &[(u32, f64, f64)]) -> TripTrack {
        TripTrack::from_points(
            id,
            points
                .iter()
                .map(|&(seq, lat, lon)| TripPoint::new(id, seq, lat, lon))
                .collect(),
        )
    }

    #[test]
    fn test_identical_point_matches() {
        let a = track("A", &[(0, LAT, LON)]);
        let b = track("B", &[(0, LAT, LON)]);
        let event = find_first_encounter("X", &a, "Y", &b, &ProximityConfig::default()).unwrap();
        assert_eq!(event.distance_m, 0.0);
        assert_eq!(event.time_diff_s, 0);
        assert_eq!(event.vehicle_a, "X");
        assert_eq!(event.trip_b, "B");
    }

    #[test]
    fn test_two_steps_apart_is_pruned() {
        let a = track("A", &[(0, LAT, LON)]);
        let b = track("B", &[(2, LAT, LON)]);
        assert!(find_first_encounter("X", &a, "Y", &b, &ProximityConfig::default()).is_none());
    }

    #[test]
    fn test_loose_time_threshold_widens_window() {
        let config = ProximityConfig {
            time_threshold_s: 30,
            ..ProximityConfig::default()
        };
        let a = track("A", &[(0, LAT, LON)]);
        let b = track("B", &[(2, LAT, LON)]);
        let event = find_first_encounter("X", &a, "Y", &b, &config).unwrap();
        assert_eq!(event.time_diff_s, 30);

        // Three steps is 45 s, still too far apart
        let c = track("C", &[(3, LAT, LON)]);
        assert!(find_first_encounter("X", &a, "Z", &c, &config).is_none());
    }

    #[test]
    fn test_one_step_apart_fails_default_time_threshold() {
        let a = track("A", &[(5, LAT, LON)]);
        let b = track("B", &[(4, LAT, LON), (6, LAT, LON)]);
        assert!(find_first_encounter("X", &a, "Y", &b, &ProximityConfig::default()).is_none());
    }

    #[test]
    fn test_four_meters_matches() {
        let a = track("A", &[(3, LAT, LON)]);
        let b = track("B", &[(3, north_of(4.0), LON)]);
        let event = find_first_encounter("X", &a, "Y", &b, &ProximityConfig::default()).unwrap();
        assert!(event.distance_m <= 5.0);
        assert!((event.distance_m - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_six_meters_does_not_match() {
        let a = track("A", &[(3, LAT, LON)]);
        let b = track("B", &[(3, north_of(6.0), LON)]);
        assert!(find_first_encounter("X", &a, "Y", &b, &ProximityConfig::default()).is_none());
    }

    #[test]
    fn test_empty_track_skipped() {
        let a = track("A", &[]);
        let b = track("B", &[(0, LAT, LON)]);
        let config = ProximityConfig::default();
        assert!(find_first_encounter("X", &a, "Y", &b, &config).is_none());
        assert!(find_first_encounter("Y", &b, "X", &a, &config).is_none());
    }

    #[test]
    fn test_first_match_in_scan_order() {
        // Both seq 2 and seq 7 are close; seq 2 comes first in A's order
        let a = track("A", &[(7, LAT, LON), (2, north_of(3.0), LON)]);
        let b = track("B", &[(2, LAT, LON), (7, LAT, LON)]);
        let event = find_first_encounter("X", &a, "Y", &b, &ProximityConfig::default()).unwrap();
        assert!((event.distance_m - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_match_pairs_skips_missing_trips() {
        let points = PointTable::from_rows(vec![
            TripPoint::new("A", 0, LAT, LON),
            TripPoint::new("B", 0, LAT, LON),
        ]);
        let pairs = vec![
            CandidatePair {
                vehicle_a: "X".into(),
                vehicle_b: "Y".into(),
                trip_a: "A".into(),
                trip_b: "B".into(),
            },
            CandidatePair {
                vehicle_a: "X".into(),
                vehicle_b: "Z".into(),
                trip_a: "A".into(),
                trip_b: "missing".into(),
            },
        ];
        let events = match_pairs(&pairs, &points, &ProximityConfig::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trip_b, "B");
    }
}
