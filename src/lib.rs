//! # Taxi Proximity
//!
//! Spatio-temporal proximity detection over taxi GPS trajectories.
//!
//! This library provides:
//! - Interval-overlap candidate generation over trip time windows
//! - Batched point retrieval from a trip/point store
//! - A first-match proximity matcher (distance + time thresholds)
//! - A chunked, resumable batch driver with on-disk chunk artifacts
//! - Aggregation of close encounters per taxi pair
//!
//! ## Features
//!
//! - **`parallel`** - Process independent chunks in parallel with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use taxi_proximity::{find_first_encounter, ProximityConfig, TripTrack, TripPoint};
//!
//! let a = TripTrack::from_points("trip-a", vec![TripPoint::new("trip-a", 0, 41.1579, -8.6291)]);
//! let b = TripTrack::from_points("trip-b", vec![TripPoint::new("trip-b", 0, 41.1579, -8.6291)]);
//!
//! let event = find_first_encounter("taxi-1", &a, "taxi-2", &b, &ProximityConfig::default());
//! assert!(event.is_some());
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, ProximityError, Result};

// Great-circle distance
pub mod geo_utils;

// Seq-ordered point sequences per trip
pub mod points;
pub use points::{PointTable, TripPoint, TripTrack};

// Interval-overlap candidate pair generation
pub mod candidates;
pub use candidates::generate_candidate_pairs;

// Pairwise first-match proximity detection
pub mod matching;
pub use matching::{find_first_encounter, match_pairs};

// Trip/point providers (SQLite and in-memory)
pub mod store;
pub use store::{fetch_points_batched, MemoryStore, PointSource, SqliteStore, TripWindowSource};

// On-disk chunk artifacts
pub mod chunks;
pub use chunks::{ChunkIndex, ChunkRange};

// Chunked, resumable batch driver
pub mod driver;
pub use driver::{BatchDriver, BatchReport, ChunkProgress, ProgressCallback, RunStatus};

// Aggregation per taxi pair
pub mod report;
pub use report::{aggregate_by_taxi_pair, TaxiPairSummary};

// End-to-end detection run
pub mod pipeline;
pub use pipeline::{run_detection, DetectionOutcome, RunManifest};

// Porto CSV cleaning and loading
pub mod ingest;
pub use ingest::{ingest_porto_csv, CleaningStats};

// Per-taxi activity and landmark queries
pub mod analysis;
pub use analysis::{taxi_activity, trips_near, TaxiActivity};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Box enclosing every point within `radius_m` of `center`.
    ///
    /// The longitude span is padded by 10%: near the edge of the circle the
    /// great-circle distance grows slower than the distance along the parallel.
    /// Near the antimeridian `min_lng`/`max_lng` run past ±180; see
    /// [`Bounds::split_at_antimeridian`].
    pub fn around(center: GpsPoint, radius_m: f64) -> Self {
        let dlat = (radius_m / (geo_utils::EARTH_RADIUS_KM * 1000.0)).to_degrees();
        let cos_lat = center.latitude.to_radians().cos().abs().max(1e-6);
        let dlng = (dlat / cos_lat * 1.1).min(180.0);
        Self {
            min_lat: (center.latitude - dlat).max(-90.0),
            max_lat: (center.latitude + dlat).min(90.0),
            min_lng: center.longitude - dlng,
            max_lng: center.longitude + dlng,
        }
    }

    /// The same area as one or two boxes with longitudes inside [-180, 180].
    pub fn split_at_antimeridian(&self) -> Vec<Bounds> {
        let with_lng = |min_lng: f64, max_lng: f64| Bounds {
            min_lng,
            max_lng,
            ..*self
        };
        if self.max_lng - self.min_lng >= 360.0 {
            vec![with_lng(-180.0, 180.0)]
        } else if self.min_lng < -180.0 {
            vec![with_lng(self.min_lng + 360.0, 180.0), with_lng(-180.0, self.max_lng)]
        } else if self.max_lng > 180.0 {
            vec![with_lng(self.min_lng, 180.0), with_lng(-180.0, self.max_lng - 360.0)]
        } else {
            vec![*self]
        }
    }

    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && [point.longitude, point.longitude - 360.0, point.longitude + 360.0]
                .iter()
                .any(|lng| *lng >= self.min_lng && *lng <= self.max_lng)
    }
}

/// Wall-clock window of a single trip.
///
/// Times are Unix timestamps in seconds. `start <= end` always holds for
/// windows built through [`TripWindow::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripWindow {
    pub trip_id: String,
    pub taxi_id: String,
    pub start: i64,
    pub end: i64,
}

impl TripWindow {
    /// Create a window, returning `None` if `start > end`.
    pub fn new(trip_id: &str, taxi_id: &str, start: i64, end: i64) -> Option<Self> {
        if start > end {
            return None;
        }
        Some(Self {
            trip_id: trip_id.to_string(),
            taxi_id: taxi_id.to_string(),
            start,
            end,
        })
    }

    /// Closed-interval overlap: `[a.start, a.end] ∩ [b.start, b.end] ≠ ∅`.
    pub fn overlaps(&self, other: &TripWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Two trips from different taxis whose time windows overlap.
///
/// `trip_a < trip_b` for pairs produced by the candidate generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidatePair {
    pub vehicle_a: String,
    pub vehicle_b: String,
    pub trip_a: String,
    pub trip_b: String,
}

/// First qualifying close encounter between the points of two trips.
///
/// Field order matches the artifact columns:
/// `vehicle_a, vehicle_b, trip_a, trip_b, distance_m, time_diff_s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub vehicle_a: String,
    pub vehicle_b: String,
    pub trip_a: String,
    pub trip_b: String,
    /// Distance in meters, rounded to centimeters
    pub distance_m: f64,
    /// Time offset in seconds between the two points
    pub time_diff_s: u32,
}

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for the pairwise proximity matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Maximum great-circle distance between two points.
    /// Default: 5.0 meters
    pub distance_threshold_m: f64,

    /// Maximum time offset between two points.
    /// Default: 5 seconds
    pub time_threshold_s: u32,

    /// Fixed GPS sampling interval; `seq * sample_interval_s` is elapsed trip time.
    /// Default: 15 seconds
    pub sample_interval_s: u32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            distance_threshold_m: 5.0,
            time_threshold_s: 5,
            sample_interval_s: 15,
        }
    }
}

impl ProximityConfig {
    /// Widest `|pa.seq - pb.seq|` that can still pass the time threshold.
    ///
    /// Never below 1: neighbouring samples are always looked at, the time
    /// check then decides.
    pub fn seq_window(&self) -> u32 {
        (self.time_threshold_s / self.sample_interval_s.max(1)).max(1)
    }

    /// Reject configurations the matcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.distance_threshold_m.is_finite() || self.distance_threshold_m < 0.0 {
            return Err(ProximityError::Config {
                message: format!(
                    "distance_threshold_m must be a non-negative number, got {}",
                    self.distance_threshold_m
                ),
            });
        }
        if self.sample_interval_s == 0 {
            return Err(ProximityError::Config {
                message: "sample_interval_s must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for candidate generation, point retrieval and chunked processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Number of candidate pairs per chunk artifact.
    /// Default: 2000
    pub chunk_size: usize,

    /// Maximum number of candidate pairs considered in one run (None = all).
    /// Default: Some(5000)
    pub pair_limit: Option<usize>,

    /// Maximum trip ids per point request.
    /// Default: 500 (SQLite caps bound parameters per statement)
    pub point_batch_size: usize,

    /// Number of taxi pairs shown in the log summary.
    /// Default: 20
    pub top_n: usize,

    /// Process chunks on the rayon pool (requires the `parallel` feature).
    /// Default: false
    pub parallel: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            pair_limit: Some(5000),
            point_batch_size: 500,
            top_n: 20,
            parallel: false,
        }
    }
}

impl BatchConfig {
    /// Reject configurations the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ProximityError::Config {
                message: "chunk_size must be > 0".to_string(),
            });
        }
        if self.point_batch_size == 0 {
            return Err(ProximityError::Config {
                message: "point_batch_size must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Both configuration sections, as read from a JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub proximity: ProximityConfig,
    pub batch: BatchConfig,
}

impl DetectionConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ProximityError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config: DetectionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.proximity.validate()?;
        self.batch.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================
