//! Point sequences per trip.
//!
//! Point rows arrive from the store in no particular order. [`TripTrack`]
//! establishes the `seq` ordering the matcher relies on and drops rows that
//! cannot take part in a comparison (bad coordinates, repeated `seq`).
//! [`PointTable`] keeps every track of a run in memory, keyed by trip id.

use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::GpsPoint;

/// A point row as returned by a point provider: `(trip_id, seq, lat, lon)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripPoint {
    pub trip_id: String,
    pub seq: u32,
    pub latitude: f64,
    pub longitude: f64,
}

impl TripPoint {
    pub fn new(trip_id: &str, seq: u32, latitude: f64, longitude: f64) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            seq,
            latitude,
            longitude,
        }
    }

    pub fn gps(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// A point inside a track; the trip id lives on the track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub seq: u32,
    pub point: GpsPoint,
}

/// All usable points of one trip, sorted by strictly increasing `seq`.
#[derive(Debug, Clone, Default)]
pub struct TripTrack {
    pub trip_id: String,
    points: Vec<TrackPoint>,
    skipped: usize,
}

impl TripTrack {
    /// Build a track from unordered rows.
    ///
    /// Rows with invalid coordinates are dropped; for a repeated `seq` the
    /// first row seen wins.
    pub fn from_points(trip_id: &str, rows: Vec<TripPoint>) -> Self {
        let total = rows.len();
        let mut points: Vec<TrackPoint> = rows
            .into_iter()
            .map(|r| TrackPoint {
                seq: r.seq,
                point: r.gps(),
            })
            .filter(|p| p.point.is_valid())
            .collect();

        // Stable sort keeps arrival order among equal seqs for dedup
        points.sort_by_key(|p| p.seq);
        points.dedup_by_key(|p| p.seq);

        Self {
            trip_id: trip_id.to_string(),
            skipped: total - points.len(),
            points,
        }
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Rows dropped while building the track.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Points with `lo <= seq <= hi`, found by binary search.
    pub fn seq_range(&self, lo: u32, hi: u32) -> &[TrackPoint] {
        let start = self.points.partition_point(|p| p.seq < lo);
        let end = self.points.partition_point(|p| p.seq <= hi);
        if start >= end {
            return &[];
        }
        &self.points[start..end]
    }
}

/// Tracks for every trip involved in a run.
#[derive(Debug, Clone, Default)]
pub struct PointTable {
    tracks: HashMap<String, TripTrack>,
}

impl PointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group rows by trip and build one track per trip.
    pub fn from_rows(rows: Vec<TripPoint>) -> Self {
        let mut by_trip: HashMap<String, Vec<TripPoint>> = HashMap::new();
        for row in rows {
            by_trip.entry(row.trip_id.clone()).or_default().push(row);
        }

        let mut skipped = 0usize;
        let tracks: HashMap<String, TripTrack> = by_trip
            .into_iter()
            .map(|(trip_id, rows)| {
                let track = TripTrack::from_points(&trip_id, rows);
                skipped += track.skipped();
                (trip_id, track)
            })
            .collect();

        if skipped > 0 {
            warn!(
                "[PointTable] Skipped {} point rows (invalid coordinates or repeated seq)",
                skipped
            );
        }

        Self { tracks }
    }

    /// Merge more rows in; rows for a trip already present are combined with it.
    pub fn extend(&mut self, rows: Vec<TripPoint>) {
        let incoming = PointTable::from_rows(rows);
        for (trip_id, track) in incoming.tracks {
            match self.tracks.remove(&trip_id) {
                Some(existing) => {
                    let merged: Vec<TripPoint> = existing
                        .points
                        .iter()
                        .chain(track.points.iter())
                        .map(|p| TripPoint::new(&trip_id, p.seq, p.point.latitude, p.point.longitude))
                        .collect();
                    let mut rebuilt = TripTrack::from_points(&trip_id, merged);
                    rebuilt.skipped += existing.skipped + track.skipped;
                    self.tracks.insert(trip_id, rebuilt);
                }
                None => {
                    self.tracks.insert(trip_id, track);
                }
            }
        }
    }

    pub fn get(&self, trip_id: &str) -> Option<&TripTrack> {
        self.tracks.get(trip_id)
    }

    /// Number of trips with at least one row.
    pub fn trip_count(&self) -> usize {
        self.tracks.len()
    }

    /// Number of usable points across all trips.
    pub fn point_count(&self) -> usize {
        self.tracks.values().map(|t| t.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_sorted_by_seq() {
        let track = TripTrack::from_points(
            "T1",
            vec![
                TripPoint::new("T1", 2, 41.0, -8.0),
                TripPoint::new("T1", 0, 41.1, -8.1),
                TripPoint::new("T1", 1, 41.2, -8.2),
            ],
        );
        let seqs: Vec<u32> = track.points().iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_track_drops_invalid_and_duplicate_seq() {
        let track = TripTrack::from_points(
            "T1",
            vec![
                TripPoint::new("T1", 0, 41.0, -8.0),
                TripPoint::new("T1", 0, 42.0, -9.0),
                TripPoint::new("T1", 1, f64::NAN, -8.0),
                TripPoint::new("T1", 2, 95.0, -8.0),
                TripPoint::new("T1", 3, 41.0, -8.0),
            ],
        );
        assert_eq!(track.len(), 2);
        assert_eq!(track.skipped(), 3);
        // First row for seq 0 is kept
        assert_eq!(track.points()[0].point.latitude, 41.0);
    }

    #[test]
    fn test_seq_range() {
        let rows = (0..10)
            .filter(|i| i % 2 == 0)
            .map(|i| TripPoint::new("T1", i, 41.0, -8.0))
            .collect();
        let track = TripTrack::from_points("T1", rows);

        let seqs: Vec<u32> = track.seq_range(3, 6).iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![4, 6]);
        assert!(track.seq_range(9, 20).is_empty());
        assert_eq!(track.seq_range(0, 0).len(), 1);
    }

    #[test]
    fn test_point_table_groups_by_trip() {
        let table = PointTable::from_rows(vec![
            TripPoint::new("A", 1, 41.0, -8.0),
            TripPoint::new("B", 0, 41.0, -8.0),
            TripPoint::new("A", 0, 41.0, -8.0),
        ]);
        assert_eq!(table.trip_count(), 2);
        assert_eq!(table.point_count(), 3);
        assert_eq!(table.get("A").unwrap().len(), 2);
        assert!(table.get("C").is_none());
    }

    #[test]
    fn test_point_table_extend_merges_tracks() {
        let mut table = PointTable::from_rows(vec![TripPoint::new("A", 1, 41.0, -8.0)]);
        table.extend(vec![
            TripPoint::new("A", 0, 41.0, -8.0),
            TripPoint::new("B", 0, 41.0, -8.0),
        ]);
        let seqs: Vec<u32> = table.get("A").unwrap().points().iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(table.trip_count(), 2);
    }
}
