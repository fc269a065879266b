//! # Trip/Point Store
//!
//! Providers for the two inputs of a detection run:
//!
//! - [`TripWindowSource`]: the time window of every trip
//! - [`PointSource`]: GPS rows for a given set of trip ids
//!
//! [`SqliteStore`] keeps the cleaned dataset in two tables mirroring the
//! relational layout the data was originally loaded into:
//!
//! ```text
//! trips  (trip_id PK, taxi_id, call_type, origin_call, origin_stand, timestamp, day_type)
//! points (trip_id FK, seq, latitude, longitude)   -- indexed on (trip_id, seq)
//! ```
//!
//! [`MemoryStore`] implements the same traits over plain vectors.
//!
//! [`fetch_points_batched`] splits a large id set into requests no bigger than
//! the configured batch size (or the store's own cap, whichever is smaller)
//! and merges the rows into a [`PointTable`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

use crate::{Bounds, GpsPoint, PointTable, Result, TripPoint, TripWindow};

/// Bound-parameter cap used for `IN (...)` lists; the historical SQLite default.
const SQLITE_MAX_IDS: usize = 999;

// ============================================================================
// Provider Traits
// ============================================================================

/// Supplies the wall-clock window of every trip.
pub trait TripWindowSource {
    /// All trip windows. `sample_interval_s` converts the last `seq` of a trip
    /// into its end time.
    fn trip_windows(&self, sample_interval_s: u32) -> Result<Vec<TripWindow>>;
}

/// Supplies GPS rows for trips.
pub trait PointSource {
    /// Rows for exactly the given trips, in any order.
    fn points_for_trips(&self, trip_ids: &[String]) -> Result<Vec<TripPoint>>;

    /// Largest number of ids one request may carry, if the source has a limit.
    fn max_ids_per_request(&self) -> Option<usize> {
        None
    }
}

/// Fetch points for `trip_ids` in bounded batches and build the point table.
///
/// The result holds exactly the rows of the requested trips. Any storage error
/// aborts the whole fetch.
pub fn fetch_points_batched<S: PointSource + ?Sized>(
    source: &S,
    trip_ids: &[String],
    batch_size: usize,
) -> Result<PointTable> {
    let cap = source
        .max_ids_per_request()
        .map_or(batch_size, |max| max.min(batch_size))
        .max(1);

    let requested: HashSet<&str> = trip_ids.iter().map(|s| s.as_str()).collect();
    let mut rows: Vec<TripPoint> = Vec::new();
    let batch_count = trip_ids.len().div_ceil(cap);

    for (i, batch) in trip_ids.chunks(cap).enumerate() {
        let mut batch_rows = source.points_for_trips(batch)?;
        debug!(
            "[PointRetrieval] Batch {}/{}: {} trips -> {} rows",
            i + 1,
            batch_count,
            batch.len(),
            batch_rows.len()
        );
        rows.append(&mut batch_rows);
    }

    let before = rows.len();
    rows.retain(|r| requested.contains(r.trip_id.as_str()));
    if rows.len() != before {
        warn!(
            "[PointRetrieval] Dropped {} rows for trips that were not requested",
            before - rows.len()
        );
    }

    info!(
        "[PointRetrieval] Loaded {} rows for {} trips in {} requests",
        rows.len(),
        trip_ids.len(),
        batch_count
    );

    Ok(PointTable::from_rows(rows))
}

// ============================================================================
// Records
// ============================================================================

/// Trip metadata as stored in the `trips` table.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub trip_id: String,
    pub taxi_id: String,
    pub call_type: String,
    pub origin_call: Option<String>,
    pub origin_stand: Option<i64>,
    /// Unix timestamp of the first point, in seconds
    pub timestamp: i64,
    pub day_type: String,
}

/// Start/end time and first/last position of one trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TripExtent {
    pub trip_id: String,
    pub taxi_id: String,
    pub start: i64,
    pub end: i64,
    pub first: GpsPoint,
    pub last: GpsPoint,
}

// ============================================================================
// SQLite Store
// ============================================================================

/// Trip/point store backed by a SQLite database.
pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trips (
                trip_id TEXT PRIMARY KEY,
                taxi_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                origin_call TEXT,
                origin_stand INTEGER,
                timestamp INTEGER NOT NULL,
                day_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS points (
                trip_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                FOREIGN KEY (trip_id) REFERENCES trips(trip_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_points_trip_seq ON points(trip_id, seq);
            CREATE INDEX IF NOT EXISTS idx_points_lat_lon ON points(latitude, longitude);
            CREATE INDEX IF NOT EXISTS idx_trips_taxi ON trips(taxi_id);

            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    /// Insert trips with their tracks in one transaction.
    ///
    /// Point `seq` is the index in the track. Existing trip ids are ignored,
    /// together with their points.
    pub fn insert_trips(&mut self, batch: &[(TripRecord, Vec<GpsPoint>)]) -> Result<usize> {
        let tx = self.db.transaction()?;
        let mut inserted = 0usize;
        {
            let mut trip_stmt = tx.prepare(
                "INSERT OR IGNORE INTO trips
                 (trip_id, taxi_id, call_type, origin_call, origin_stand, timestamp, day_type)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut point_stmt = tx.prepare(
                "INSERT INTO points (trip_id, seq, latitude, longitude) VALUES (?, ?, ?, ?)",
            )?;

            for (trip, track) in batch {
                let changed = trip_stmt.execute(params![
                    trip.trip_id,
                    trip.taxi_id,
                    trip.call_type,
                    trip.origin_call,
                    trip.origin_stand,
                    trip.timestamp,
                    trip.day_type
                ])?;
                if changed == 0 {
                    continue;
                }
                for (seq, p) in track.iter().enumerate() {
                    point_stmt.execute(params![trip.trip_id, seq as i64, p.latitude, p.longitude])?;
                }
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Delete all trips and points.
    pub fn clear(&mut self) -> Result<()> {
        self.db.execute_batch(
            "DELETE FROM points;
             DELETE FROM trips;",
        )?;
        Ok(())
    }

    pub fn trip_count(&self) -> Result<usize> {
        let n: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM trips", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn point_count(&self) -> Result<usize> {
        let n: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM points", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Start/end time and first/last position of every trip that has points.
    pub fn trip_extents(&self, sample_interval_s: u32) -> Result<Vec<TripExtent>> {
        let mut stmt = self.db.prepare(
            "SELECT t.trip_id, t.taxi_id, t.timestamp, MAX(p.seq),
                    (SELECT latitude FROM points f WHERE f.trip_id = t.trip_id ORDER BY f.seq ASC LIMIT 1),
                    (SELECT longitude FROM points f WHERE f.trip_id = t.trip_id ORDER BY f.seq ASC LIMIT 1),
                    (SELECT latitude FROM points l WHERE l.trip_id = t.trip_id ORDER BY l.seq DESC LIMIT 1),
                    (SELECT longitude FROM points l WHERE l.trip_id = t.trip_id ORDER BY l.seq DESC LIMIT 1)
             FROM trips t JOIN points p ON p.trip_id = t.trip_id
             GROUP BY t.trip_id
             ORDER BY t.trip_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let start = integer(row.get(2)?);
                let max_seq = integer(row.get(3)?);
                let first = coordinates(row.get(4)?, row.get(5)?);
                let last = coordinates(row.get(6)?, row.get(7)?);
                Ok(match (text(row.get(0)?), text(row.get(1)?), start, max_seq, first, last) {
                    (Some(trip_id), Some(taxi_id), Some(start), Some(max_seq), Some(first), Some(last))
                        if max_seq >= 0 =>
                    {
                        Some(TripExtent {
                            trip_id,
                            taxi_id,
                            start,
                            end: start + max_seq * sample_interval_s as i64,
                            first,
                            last,
                        })
                    }
                    _ => None,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let extents = keep_decoded(rows, "trips with unreadable extents");
        Ok(extents)
    }

    /// Point rows inside a bounding box (coarse prefilter for radius queries).
    pub fn points_in_bounds(&self, bounds: &Bounds) -> Result<Vec<TripPoint>> {
        let mut stmt = self.db.prepare(
            "SELECT trip_id, seq, latitude, longitude FROM points
             WHERE latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?",
        )?;
        let rows = stmt
            .query_map(
                params![bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng],
                decode_point,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let rows = keep_decoded(rows, "unreadable point rows");
        Ok(rows)
    }
}

impl TripWindowSource for SqliteStore {
    fn trip_windows(&self, sample_interval_s: u32) -> Result<Vec<TripWindow>> {
        let mut stmt = self.db.prepare(
            "SELECT t.trip_id, t.taxi_id, t.timestamp, MAX(p.seq)
             FROM trips t JOIN points p ON p.trip_id = t.trip_id
             GROUP BY t.trip_id
             ORDER BY t.trip_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    text(row.get(0)?),
                    text(row.get(1)?),
                    integer(row.get(2)?),
                    integer(row.get(3)?),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut skipped = 0usize;
        let windows: Vec<TripWindow> = rows
            .into_iter()
            .filter_map(|(trip_id, taxi_id, start, max_seq)| {
                let window = match (trip_id, taxi_id, start, max_seq) {
                    (Some(trip_id), Some(taxi_id), Some(start), Some(max_seq)) if max_seq >= 0 => {
                        let end = start + max_seq * sample_interval_s as i64;
                        TripWindow::new(&trip_id, &taxi_id, start, end)
                    }
                    _ => None,
                };
                if window.is_none() {
                    skipped += 1;
                }
                window
            })
            .collect();

        if skipped > 0 {
            warn!("[SqliteStore] Skipped {} trips with incomplete or unreadable metadata", skipped);
        }
        Ok(windows)
    }
}

impl PointSource for SqliteStore {
    fn points_for_trips(&self, trip_ids: &[String]) -> Result<Vec<TripPoint>> {
        if trip_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; trip_ids.len()].join(",");
        let sql = format!(
            "SELECT trip_id, seq, latitude, longitude FROM points WHERE trip_id IN ({})",
            placeholders
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(trip_ids.iter()), decode_point)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keep_decoded(rows, "unreadable point rows"))
    }

    fn max_ids_per_request(&self) -> Option<usize> {
        Some(SQLITE_MAX_IDS)
    }
}

// ============================================================================
// Row Decoding
// ============================================================================
//
// Values are read as raw SQLite values and converted by hand. A row whose
// values do not convert (text in a numeric column, negative seq, NULL) is
// bad input and is dropped; only query failures surface as errors.

fn text(value: Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn integer(value: Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(i),
        _ => None,
    }
}

fn real(value: Value) -> Option<f64> {
    match value {
        Value::Real(f) => Some(f),
        Value::Integer(i) => Some(i as f64),
        _ => None,
    }
}

fn coordinates(latitude: Value, longitude: Value) -> Option<GpsPoint> {
    Some(GpsPoint::new(real(latitude)?, real(longitude)?))
}

/// Decode a `trip_id, seq, latitude, longitude` row.
fn decode_point(row: &Row<'_>) -> rusqlite::Result<Option<TripPoint>> {
    let trip_id = text(row.get(0)?);
    let seq = integer(row.get(1)?).and_then(|s| u32::try_from(s).ok());
    let point = coordinates(row.get(2)?, row.get(3)?);
    Ok(match (trip_id, seq, point) {
        (Some(trip_id), Some(seq), Some(p)) => Some(TripPoint {
            trip_id,
            seq,
            latitude: p.latitude,
            longitude: p.longitude,
        }),
        _ => None,
    })
}

fn keep_decoded<T>(rows: Vec<Option<T>>, what: &str) -> Vec<T> {
    let total = rows.len();
    let kept: Vec<T> = rows.into_iter().flatten().collect();
    if kept.len() < total {
        warn!("[SqliteStore] Skipped {} {}", total - kept.len(), what);
    }
    kept
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Trip/point store over plain vectors.
///
/// Trip windows are derived the same way as in [`SqliteStore`]: start time
/// plus the last `seq` times the sampling interval. Trips without points have
/// no window.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trips: BTreeMap<String, (String, i64)>,
    points: Vec<TripPoint>,
    max_ids: Option<usize>,
    requests: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of ids per point request.
    pub fn with_max_ids(mut self, max_ids: usize) -> Self {
        self.max_ids = Some(max_ids);
        self
    }

    /// Add a trip; point `seq` is the index in `coords`.
    pub fn add_trip(&mut self, trip_id: &str, taxi_id: &str, start: i64, coords: &[GpsPoint]) {
        self.trips
            .insert(trip_id.to_string(), (taxi_id.to_string(), start));
        self.points.extend(
            coords
                .iter()
                .enumerate()
                .map(|(seq, p)| TripPoint::new(trip_id, seq as u32, p.latitude, p.longitude)),
        );
    }

    /// Add a raw point row without touching trip metadata.
    pub fn push_point(&mut self, point: TripPoint) {
        self.points.push(point);
    }

    /// Number of `points_for_trips` calls served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

impl TripWindowSource for MemoryStore {
    fn trip_windows(&self, sample_interval_s: u32) -> Result<Vec<TripWindow>> {
        let mut max_seq: BTreeMap<&str, u32> = BTreeMap::new();
        for p in &self.points {
            let entry = max_seq.entry(p.trip_id.as_str()).or_insert(p.seq);
            *entry = (*entry).max(p.seq);
        }

        Ok(self
            .trips
            .iter()
            .filter_map(|(trip_id, (taxi_id, start))| {
                let last = *max_seq.get(trip_id.as_str())?;
                let end = start + last as i64 * sample_interval_s as i64;
                TripWindow::new(trip_id, taxi_id, *start, end)
            })
            .collect())
    }
}

impl PointSource for MemoryStore {
    fn points_for_trips(&self, trip_ids: &[String]) -> Result<Vec<TripPoint>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let wanted: HashSet<&str> = trip_ids.iter().map(|s| s.as_str()).collect();
        Ok(self
            .points
            .iter()
            .filter(|p| wanted.contains(p.trip_id.as_str()))
            .cloned()
            .collect())
    }

    fn max_ids_per_request(&self) -> Option<usize> {
        self.max_ids
    }
}

// ============================================================================
// Tests
// ============================================================================
