//! End-to-end detection run: windows, candidate pairs, points, chunks, summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;
use serde::{Deserialize, Serialize};

use crate::candidates::{generate_candidate_pairs, involved_trip_ids};
use crate::driver::{BatchDriver, BatchReport, ProgressCallback, RunStatus};
use crate::error::ProximityError;
use crate::report::{aggregate_by_taxi_pair, format_top, write_summary, TaxiPairSummary};
use crate::store::{fetch_points_batched, PointSource, TripWindowSource};
use crate::{DetectionConfig, Result};

pub const SUMMARY_FILE: &str = "summary.csv";
pub const MANIFEST_FILE: &str = "run_manifest.json";

/// Counts and status of one run, persisted as `run_manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub status: RunStatus,
    pub trip_windows: usize,
    pub candidate_pairs: usize,
    pub involved_trips: usize,
    pub points_loaded: usize,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub chunks_reused: usize,
    /// Only known once every chunk is done
    pub close_events: Option<usize>,
    pub taxi_pairs: Option<usize>,
    pub elapsed_s: f64,
    pub config: DetectionConfig,
}

#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub report: BatchReport,
    /// Empty unless the run completed
    pub summary: Vec<TaxiPairSummary>,
    pub summary_path: Option<PathBuf>,
    pub manifest: RunManifest,
}

impl DetectionOutcome {
    pub fn is_complete(&self) -> bool {
        self.report.status.is_complete()
    }
}

/// Run proximity detection against `store`, writing artifacts to `output_dir`.
///
/// Storage errors abort the run. Chunks already present in `output_dir` are
/// reused; chunks that fail are left for the next invocation.
pub fn run_detection<S>(
    store: &S,
    config: &DetectionConfig,
    output_dir: &Path,
    progress: Option<ProgressCallback>,
) -> Result<DetectionOutcome>
where
    S: TripWindowSource + PointSource + ?Sized,
{
    config.validate()?;
    let started = Instant::now();

    let windows = store.trip_windows(config.proximity.sample_interval_s)?;
    info!("[Pipeline] {} trip windows", windows.len());

    let pairs = generate_candidate_pairs(&windows, config.batch.pair_limit);
    let trip_ids: Vec<String> = involved_trip_ids(&pairs).into_iter().collect();
    info!(
        "[Pipeline] {} candidate pairs over {} trips",
        pairs.len(),
        trip_ids.len()
    );

    let points = fetch_points_batched(store, &trip_ids, config.batch.point_batch_size)?;

    let mut driver = BatchDriver::new(output_dir, config.proximity.clone(), config.batch.clone());
    if let Some(callback) = progress {
        driver = driver.with_progress(callback);
    }
    let report = driver.run(&pairs, &points)?;

    let (summary, summary_path) = if report.status.is_complete() {
        let summary = aggregate_by_taxi_pair(&report.events);
        let path = output_dir.join(SUMMARY_FILE);
        write_summary(&path, &summary)?;
        info!(
            "[Pipeline] Top {} taxi pairs by close events:\n{}",
            config.batch.top_n,
            format_top(&summary, config.batch.top_n)
        );
        (summary, Some(path))
    } else {
        (Vec::new(), None)
    };

    let complete = report.status.is_complete();
    let manifest = RunManifest {
        status: report.status.clone(),
        trip_windows: windows.len(),
        candidate_pairs: pairs.len(),
        involved_trips: trip_ids.len(),
        points_loaded: points.point_count(),
        chunks_total: report.chunks_total,
        chunks_processed: report.chunks_processed,
        chunks_reused: report.chunks_reused,
        close_events: complete.then_some(report.events.len()),
        taxi_pairs: complete.then_some(summary.len()),
        elapsed_s: started.elapsed().as_secs_f64(),
        config: config.clone(),
    };
    write_manifest(&output_dir.join(MANIFEST_FILE), &manifest)?;

    Ok(DetectionOutcome {
        report,
        summary,
        summary_path,
        manifest,
    })
}

fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, json).map_err(|e| ProximityError::artifact(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| ProximityError::artifact(path, e))
}

/// Load the manifest of a previous run, if any.
pub fn read_manifest(output_dir: &Path) -> Result<Option<RunManifest>> {
    let path = output_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).map_err(|e| ProximityError::artifact(&path, e))?;
    Ok(Some(serde_json::from_str(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::GpsPoint;
    use tempfile::TempDir;

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        let here = GpsPoint::new(41.1579, -8.6291);
        let far = GpsPoint::new(41.2579, -8.6291);
        store.add_trip("T1", "X", 1000, &[here, here, here]);
        store.add_trip("T2", "Y", 1000, &[here, far, far]);
        store.add_trip("T3", "Z", 1000, &[far, far, far]);
        store.add_trip("T4", "X", 5000, &[here, here]);
        store
    }

    #[test]
    fn test_run_detection_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let outcome = run_detection(&store(), &DetectionConfig::default(), tmp.path(), None).unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.manifest.trip_windows, 4);
        // T1-T2, T1-T3, T2-T3 overlap; T4 is alone
        assert_eq!(outcome.manifest.candidate_pairs, 3);
        // T1-T2 meet at seq 0, T2-T3 at seq 1
        assert_eq!(outcome.report.events.len(), 2);
        assert_eq!(outcome.summary.len(), 2);
        assert!(tmp.path().join(SUMMARY_FILE).exists());
        assert!(tmp.path().join(crate::driver::COMBINED_FILE).exists());
    }

    #[test]
    fn test_manifest_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let outcome = run_detection(&store(), &DetectionConfig::default(), tmp.path(), None).unwrap();

        let loaded = read_manifest(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.close_events, Some(2));
        assert_eq!(loaded.candidate_pairs, outcome.manifest.candidate_pairs);
    }

    #[test]
    fn test_no_manifest_before_first_run() {
        let tmp = TempDir::new().unwrap();
        assert!(read_manifest(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn test_pair_limit_caps_work() {
        let tmp = TempDir::new().unwrap();
        let mut config = DetectionConfig::default();
        config.batch.pair_limit = Some(1);
        let outcome = run_detection(&store(), &config, tmp.path(), None).unwrap();
        assert_eq!(outcome.manifest.candidate_pairs, 1);
        assert_eq!(outcome.manifest.involved_trips, 2);
    }

    #[test]
    fn test_invalid_config_rejected_before_any_io() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let mut config = DetectionConfig::default();
        config.proximity.sample_interval_s = 0;
        let err = run_detection(&store(), &config, &out, None).unwrap_err();
        assert!(matches!(err, ProximityError::Config { .. }));
        assert!(!out.exists());
    }
}
