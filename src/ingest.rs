//! # Porto CSV Ingestion
//!
//! Cleans the raw Porto taxi export and loads it into a [`SqliteStore`].
//!
//! Rows are dropped, in this order, when they:
//! 1. are flagged `MISSING_DATA`
//! 2. repeat an earlier row exactly (the first copy is kept)
//! 3. break the call-type rules (A needs `ORIGIN_CALL`, B needs `ORIGIN_STAND`,
//!    C needs neither; any other type is dropped)
//! 4. have fewer than 3 points once `POLYLINE` is parsed
//!    (an unparseable polyline counts as empty)
//! 5. share their `TRIP_ID` with another surviving row (all copies go)
//!
//! Rule 5 needs to know every surviving id before anything is written, so the
//! file is read twice: the first pass counts ids, the second inserts.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ProximityError;
use crate::store::{SqliteStore, TripRecord};
use crate::{GpsPoint, OptionExt, Result};

/// Trips per insert transaction.
const INSERT_BATCH: usize = 5000;

/// Fewest points a trip needs to be kept.
const MIN_POINTS: usize = 3;

/// Row counts per cleaning rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningStats {
    pub rows_read: usize,
    /// Rows that could not be parsed at all (bad timestamp, wrong field count)
    pub malformed: usize,
    pub missing_data: usize,
    pub duplicate_rows: usize,
    pub invalid_call_type: usize,
    pub too_few_points: usize,
    /// Rows removed because their trip id occurs more than once
    pub duplicate_trip_rows: usize,
    /// Distinct trip ids removed for occurring more than once
    pub duplicate_trip_ids: usize,
    pub trips_inserted: usize,
    pub points_inserted: usize,
}

/// Raw row, addressed by header name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RawTrip {
    trip_id: String,
    call_type: String,
    origin_call: String,
    origin_stand: String,
    taxi_id: String,
    timestamp: String,
    day_type: String,
    missing_data: String,
    polyline: String,
}

/// Why a row did not survive cleaning.
enum Rejection {
    Malformed,
    MissingData,
    DuplicateRow,
    CallType,
    TooFewPoints,
}

/// Clean the Porto CSV at `path` and insert the surviving trips into `store`.
///
/// Trip ids already present in the store are left untouched.
pub fn ingest_porto_csv(path: &Path, store: &mut SqliteStore) -> Result<CleaningStats> {
    let mut stats = CleaningStats::default();

    // Pass 1: count surviving trip ids
    let mut id_counts: HashMap<String, u32> = HashMap::new();
    for_each_clean_trip(path, &mut stats, |trip, _| {
        *id_counts.entry(trip.trip_id).or_insert(0) += 1;
        Ok(())
    })?;

    let duplicated: HashSet<String> = id_counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, n)| {
            stats.duplicate_trip_rows += n as usize;
            id
        })
        .collect();
    stats.duplicate_trip_ids = duplicated.len();

    info!(
        "[Ingest] {} rows read: {} missing data, {} duplicate rows, {} bad call type, \
         {} too short, {} malformed, {} rows with duplicate trip ids",
        stats.rows_read,
        stats.missing_data,
        stats.duplicate_rows,
        stats.invalid_call_type,
        stats.too_few_points,
        stats.malformed,
        stats.duplicate_trip_rows
    );

    // Pass 2: insert
    let points_before = store.point_count()?;
    let mut batch: Vec<(TripRecord, Vec<GpsPoint>)> = Vec::with_capacity(INSERT_BATCH);
    let mut trips_inserted = 0usize;
    let mut scratch = CleaningStats::default();

    for_each_clean_trip(path, &mut scratch, |trip, track| {
        if duplicated.contains(&trip.trip_id) {
            return Ok(());
        }
        batch.push((trip, track));
        if batch.len() >= INSERT_BATCH {
            trips_inserted += store.insert_trips(&batch)?;
            batch.clear();
            debug!("[Ingest] {} trips inserted so far", trips_inserted);
        }
        Ok(())
    })?;
    if !batch.is_empty() {
        trips_inserted += store.insert_trips(&batch)?;
    }

    stats.trips_inserted = trips_inserted;
    stats.points_inserted = store.point_count()?.saturating_sub(points_before);
    info!(
        "[Ingest] Inserted {} trips with {} points",
        stats.trips_inserted, stats.points_inserted
    );
    Ok(stats)
}

/// Stream the file and hand every row that passes rules 1-4 to `on_trip`.
fn for_each_clean_trip<F>(path: &Path, stats: &mut CleaningStats, mut on_trip: F) -> Result<()>
where
    F: FnMut(TripRecord, Vec<GpsPoint>) -> Result<()>,
{
    let mut reader = csv::Reader::from_path(path).map_err(|e| ProximityError::artifact(path, e))?;
    let headers = reader
        .headers()
        .map_err(|e| ProximityError::artifact(path, e))?
        .clone();
    let mut seen_rows: HashSet<u64> = HashSet::new();

    for result in reader.records() {
        stats.rows_read += 1;
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(ProximityError::artifact(path, e)),
            Err(e) => {
                warn!("[Ingest] Skipping unreadable row {}: {}", stats.rows_read, e);
                stats.malformed += 1;
                continue;
            }
        };

        let raw: RawTrip = match record.deserialize(Some(&headers)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("[Ingest] Skipping row {}: {}", stats.rows_read, e);
                stats.malformed += 1;
                continue;
            }
        };

        let mut hasher = DefaultHasher::new();
        record.iter().for_each(|field| field.hash(&mut hasher));
        let row_hash = hasher.finish();

        match clean_row(raw, row_hash, &mut seen_rows) {
            Ok((trip, track)) => on_trip(trip, track)?,
            Err(Rejection::Malformed) => stats.malformed += 1,
            Err(Rejection::MissingData) => stats.missing_data += 1,
            Err(Rejection::DuplicateRow) => stats.duplicate_rows += 1,
            Err(Rejection::CallType) => stats.invalid_call_type += 1,
            Err(Rejection::TooFewPoints) => stats.too_few_points += 1,
        }
    }
    Ok(())
}

fn clean_row(
    raw: RawTrip,
    row_hash: u64,
    seen_rows: &mut HashSet<u64>,
) -> std::result::Result<(TripRecord, Vec<GpsPoint>), Rejection> {
    if raw.missing_data.trim().eq_ignore_ascii_case("true") {
        return Err(Rejection::MissingData);
    }
    if !seen_rows.insert(row_hash) {
        return Err(Rejection::DuplicateRow);
    }

    let trip = match parse_record(&raw) {
        Ok(trip) => trip,
        Err(e) => {
            warn!("[Ingest] {}", e);
            return Err(Rejection::Malformed);
        }
    };

    let call_type_ok = match trip.call_type.as_str() {
        "A" => trip.origin_call.is_some(),
        "B" => trip.origin_stand.is_some(),
        "C" => trip.origin_call.is_none() && trip.origin_stand.is_none(),
        _ => false,
    };
    if !call_type_ok {
        return Err(Rejection::CallType);
    }

    let track = parse_polyline(&raw.polyline);
    if track.len() < MIN_POINTS {
        return Err(Rejection::TooFewPoints);
    }
    Ok((trip, track))
}

fn parse_record(raw: &RawTrip) -> Result<TripRecord> {
    let trip_id = raw.trip_id.trim();
    let timestamp = raw
        .timestamp
        .trim()
        .parse::<i64>()
        .ok()
        .ok_or_invalid_input(trip_id, "TIMESTAMP is not an integer")?;

    let origin_stand = match non_empty(&raw.origin_stand) {
        None => None,
        Some(s) => Some(
            parse_integer(s).ok_or_invalid_input(trip_id, "ORIGIN_STAND is not a number")?,
        ),
    };

    Ok(TripRecord {
        trip_id: trip_id.to_string(),
        taxi_id: raw.taxi_id.trim().to_string(),
        call_type: raw.call_type.trim().to_string(),
        origin_call: non_empty(&raw.origin_call).map(str::to_string),
        origin_stand,
        timestamp,
        day_type: raw.day_type.trim().to_string(),
    })
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty() && !s.eq_ignore_ascii_case("nan")).then_some(s)
}

/// Integers may come through as `15` or `15.0`.
fn parse_integer(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

/// Parse a JSON list of `[lon, lat]` pairs; anything else yields no points.
fn parse_polyline(polyline: &str) -> Vec<GpsPoint> {
    serde_json::from_str::<Vec<[f64; 2]>>(polyline)
        .map(|pairs| {
            pairs
                .into_iter()
                .map(|[lon, lat]| GpsPoint::new(lat, lon))
                .collect()
        })
        .unwrap_or_default()
}
