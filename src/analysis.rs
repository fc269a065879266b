//! Per-taxi activity and landmark queries over the trip store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::chunks::write_csv_atomic;
use crate::geo_utils::{haversine_distance, segment_length_km};
use crate::store::SqliteStore;
use crate::{Bounds, GpsPoint, Result};

/// Porto City Hall.
pub const CITY_HALL: GpsPoint = GpsPoint {
    latitude: 41.15794,
    longitude: -8.62911,
};

/// Default search radius around a landmark, in meters.
pub const DEFAULT_NEAR_RADIUS_M: f64 = 100.0;

/// Driving totals of one taxi.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxiActivity {
    pub taxi_id: String,
    pub trips: usize,
    /// Sum of trip durations
    pub hours: f64,
    /// Sum of straight-line start-to-end distances
    pub distance_km: f64,
}

/// Totals per taxi, sorted by hours descending (ties by taxi id).
pub fn taxi_activity(store: &SqliteStore, sample_interval_s: u32) -> Result<Vec<TaxiActivity>> {
    let extents = store.trip_extents(sample_interval_s)?;

    let mut by_taxi: BTreeMap<&str, TaxiActivity> = BTreeMap::new();
    for extent in &extents {
        let entry = by_taxi
            .entry(extent.taxi_id.as_str())
            .or_insert_with(|| TaxiActivity {
                taxi_id: extent.taxi_id.clone(),
                trips: 0,
                hours: 0.0,
                distance_km: 0.0,
            });
        entry.trips += 1;
        entry.hours += (extent.end - extent.start) as f64 / 3600.0;
        entry.distance_km += segment_length_km(&[extent.first, extent.last]);
    }

    let mut activity: Vec<TaxiActivity> = by_taxi.into_values().collect();
    activity.sort_by(|a, b| {
        b.hours
            .total_cmp(&a.hours)
            .then_with(|| a.taxi_id.cmp(&b.taxi_id))
    });

    info!(
        "[Analysis] Activity for {} taxis over {} trips",
        activity.len(),
        extents.len()
    );
    Ok(activity)
}

pub fn write_activity(path: &Path, activity: &[TaxiActivity]) -> Result<()> {
    write_csv_atomic(path, activity, &["taxi_id", "trips", "hours", "distance_km"])
}

/// Ids of trips with at least one point within `radius_m` of `center`, sorted.
pub fn trips_near(store: &SqliteStore, center: GpsPoint, radius_m: f64) -> Result<Vec<String>> {
    let mut candidates = Vec::new();
    for bounds in Bounds::around(center, radius_m).split_at_antimeridian() {
        candidates.extend(store.points_in_bounds(&bounds)?);
    }

    let trips: BTreeSet<String> = candidates
        .into_iter()
        .filter(|p| haversine_distance(&center, &p.gps()) <= radius_m)
        .map(|p| p.trip_id)
        .collect();

    info!(
        "[Analysis] {} trips pass within {:.0} m of ({}, {})",
        trips.len(),
        radius_m,
        center.latitude,
        center.longitude
    );
    Ok(trips.into_iter().collect())
}

#[derive(Serialize)]
struct TripIdRow<'a> {
    trip_id: &'a str,
}

pub fn write_trip_ids(path: &Path, trip_ids: &[String]) -> Result<()> {
    let rows: Vec<TripIdRow> = trip_ids
        .iter()
        .map(|id| TripIdRow { trip_id: id })
        .collect();
    write_csv_atomic(path, &rows, &["trip_id"])
}
