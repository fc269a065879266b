//! # Chunk Artifacts
//!
//! A chunk is a half-open slice `[start, end)` of the candidate pair list that
//! is processed and persisted as one unit. Its events are written to
//! `chunk_<start>_<end>.csv` inside the run's output directory.
//!
//! [`ChunkIndex`] is the table of completed work: it is built once per run by
//! scanning the output directory and is consulted before each chunk runs.
//! Artifacts are written to a `.tmp` sibling and renamed into place, so a
//! file under its final name is always complete. Leftover `.tmp` files from an
//! interrupted run are removed during the scan.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::error::ProximityError;
use crate::{ProximityEvent, Result};

/// Column order of chunk and combined artifacts.
pub const EVENT_COLUMNS: [&str; 6] = [
    "vehicle_a",
    "vehicle_b",
    "trip_a",
    "trip_b",
    "distance_m",
    "time_diff_s",
];

const CHUNK_PREFIX: &str = "chunk_";
const CHUNK_SUFFIX: &str = ".csv";
const TMP_SUFFIX: &str = ".tmp";

/// Half-open index range `[start, end)` into the candidate pair list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRange {
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Artifact file name for this range.
    pub fn file_name(&self) -> String {
        format!("{}{:07}_{:07}{}", CHUNK_PREFIX, self.start, self.end, CHUNK_SUFFIX)
    }

    /// Parse an artifact file name back into its range.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let body = name.strip_prefix(CHUNK_PREFIX)?.strip_suffix(CHUNK_SUFFIX)?;
        let (start, end) = body.split_once('_')?;
        let start: usize = start.parse().ok()?;
        let end: usize = end.parse().ok()?;
        (start < end).then_some(Self { start, end })
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Split `total` pairs into consecutive ranges of at most `chunk_size`.
pub fn plan_chunks(total: usize, chunk_size: usize) -> Vec<ChunkRange> {
    let size = chunk_size.max(1);
    (0..total)
        .step_by(size)
        .map(|start| ChunkRange::new(start, (start + size).min(total)))
        .collect()
}

/// Completed chunk artifacts of one output directory.
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    dir: PathBuf,
    entries: BTreeMap<ChunkRange, PathBuf>,
}

impl ChunkIndex {
    /// Scan `dir` (created if missing) for completed artifacts.
    pub fn scan(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ProximityError::artifact(dir, e))?;

        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(dir).map_err(|e| ProximityError::artifact(dir, e))? {
            let entry = entry.map_err(|e| ProximityError::artifact(dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with(CHUNK_PREFIX) && name.ends_with(TMP_SUFFIX) {
                debug!("[ChunkIndex] Removing partial artifact {}", name);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("[ChunkIndex] Could not remove {}: {}", name, e);
                }
                continue;
            }

            if let Some(range) = ChunkRange::from_file_name(name) {
                entries.insert(range, path);
            }
        }

        debug!(
            "[ChunkIndex] {} completed chunks in {}",
            entries.len(),
            dir.display()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, range: &ChunkRange) -> bool {
        self.entries.contains_key(range)
    }

    pub fn get(&self, range: &ChunkRange) -> Option<&Path> {
        self.entries.get(range).map(|p| p.as_path())
    }

    /// Where the artifact for `range` lives (whether or not it exists yet).
    pub fn path_for(&self, range: &ChunkRange) -> PathBuf {
        self.dir.join(range.file_name())
    }

    pub fn record(&mut self, range: ChunkRange, path: PathBuf) {
        self.entries.insert(range, path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

}

/// Write events as CSV to `path` via a temporary file and rename.
///
/// The header row is always written, so an artifact with no events is still
/// a well-formed table.
pub fn write_events_atomic(path: &Path, events: &[ProximityEvent]) -> Result<()> {
    write_csv_atomic(path, events, &EVENT_COLUMNS)
}

/// Write serializable rows under an explicit header, atomically.
///
/// Rows go to a `.tmp` sibling which is synced and renamed over `path`; on
/// failure the temporary file is removed and `path` is left untouched.
pub fn write_csv_atomic<T: Serialize>(path: &Path, rows: &[T], header: &[&str]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);

    let result = write_csv(&tmp_path, rows, header)
        .and_then(|_| fs::rename(&tmp_path, path).map_err(|e| ProximityError::artifact(path, e)));

    if result.is_err() {
        fs::remove_file(&tmp_path).ok();
    }
    result
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T], header: &[&str]) -> Result<()> {
    let file = File::create(path).map_err(|e| ProximityError::artifact(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    writer
        .write_record(header)
        .map_err(|e| ProximityError::artifact(path, e))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| ProximityError::artifact(path, e))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| ProximityError::artifact(path, e.error()))?;
    file.sync_all().map_err(|e| ProximityError::artifact(path, e))?;
    Ok(())
}

/// Read the events of one artifact.
pub fn read_events(path: &Path) -> Result<Vec<ProximityEvent>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| ProximityError::artifact(path, e))?;
    reader
        .deserialize::<ProximityEvent>()
        .map(|row| row.map_err(|e| ProximityError::artifact(path, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(trip_a: &str, distance_m: f64) -> ProximityEvent {
        ProximityEvent {
            vehicle_a: "X".to_string(),
            vehicle_b: "Y".to_string(),
            trip_a: trip_a.to_string(),
            trip_b: "B".to_string(),
            distance_m,
            time_diff_s: 0,
        }
    }

    #[test]
    fn test_file_name_round_trip() {
        let range = ChunkRange::new(2000, 4000);
        assert_eq!(range.file_name(), "chunk_0002000_0004000.csv");
        assert_eq!(ChunkRange::from_file_name(&range.file_name()), Some(range));
    }

    #[test]
    fn test_rejects_foreign_file_names() {
        assert_eq!(ChunkRange::from_file_name("combined.csv"), None);
        assert_eq!(ChunkRange::from_file_name("chunk_0000010_0000005.csv"), None);
        assert_eq!(ChunkRange::from_file_name("chunk_0000000_0002000.csv.tmp"), None);
        assert_eq!(ChunkRange::from_file_name("chunk_a_b.csv"), None);
    }

    #[test]
    fn test_plan_chunks() {
        let plan = plan_chunks(4500, 2000);
        assert_eq!(
            plan,
            vec![
                ChunkRange::new(0, 2000),
                ChunkRange::new(2000, 4000),
                ChunkRange::new(4000, 4500),
            ]
        );
        assert!(plan_chunks(0, 2000).is_empty());
    }

    #[test]
    fn test_write_record_and_rescan() {
        let tmp = TempDir::new().unwrap();
        let mut index = ChunkIndex::scan(tmp.path()).unwrap();
        assert!(index.is_empty());

        let range = ChunkRange::new(0, 2);
        let path = index.path_for(&range);
        write_events_atomic(&path, &[event("A", 1.25)]).unwrap();
        index.record(range, path);
        assert!(index.contains(&range));

        let rescanned = ChunkIndex::scan(tmp.path()).unwrap();
        assert!(rescanned.contains(&range));
        let events = read_events(rescanned.get(&range).unwrap()).unwrap();
        assert_eq!(events, vec![event("A", 1.25)]);
    }

    #[test]
    fn test_empty_artifact_has_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(ChunkRange::new(0, 5).file_name());
        write_events_atomic(&path, &[]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), EVENT_COLUMNS.join(","));
        assert!(read_events(&path).unwrap().is_empty());
    }

    #[test]
    fn test_scan_ignores_and_removes_partial_files() {
        let tmp = TempDir::new().unwrap();
        let partial = tmp.path().join("chunk_0000000_0002000.csv.tmp");
        fs::write(&partial, "vehicle_a,vehicle_b\nX,").unwrap();
        fs::write(tmp.path().join("notes.txt"), "hello").unwrap();

        let index = ChunkIndex::scan(tmp.path()).unwrap();
        assert!(index.is_empty());
        assert!(!partial.exists());
    }
}
