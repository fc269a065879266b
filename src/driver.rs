//! # Batch Driver
//!
//! Runs the matcher over the candidate pair list chunk by chunk.
//!
//! ## Resumability
//!
//! Every chunk `[start, end)` is persisted as its own artifact. Before a chunk
//! runs the driver consults the [`ChunkIndex`]; chunks that already have an
//! artifact are skipped and their content is reused as-is. A chunk whose
//! artifact could not be written is reported as failed and simply has no
//! artifact, so the next invocation picks it up again.
//!
//! The combined result is always assembled by reading the chunk artifacts back
//! in range order. A resumed run and an uninterrupted run therefore produce the
//! same combined file.
//!
//! ## Memory
//!
//! The [`PointTable`] for every involved trip is built once and shared by all
//! chunks: one trip usually appears in many pairs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::chunks::{plan_chunks, read_events, write_events_atomic, ChunkIndex, ChunkRange};
use crate::matching::match_pairs;
use crate::{
    BatchConfig, CandidatePair, OptionExt, PointTable, ProximityConfig, ProximityEvent, Result,
};

/// Sub-directory of the output directory holding chunk artifacts.
pub const CHUNK_DIR: &str = "chunks";

/// File name of the combined artifact.
pub const COMBINED_FILE: &str = "combined.csv";

/// Progress after one chunk finished (or was reused).
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub range: ChunkRange,
    /// Pairs covered by finished chunks so far, reused chunks included
    pub pairs_done: usize,
    pub total_pairs: usize,
    /// Close events found so far, reused chunks included
    pub events_found: usize,
    pub elapsed: Duration,
    /// The chunk already had an artifact and was not recomputed
    pub reused: bool,
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(&ChunkProgress) + Send + Sync>;

/// How far a run got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every chunk has an artifact; combined output was written
    Completed,
    /// Some chunks failed; re-running retries exactly those
    Partial { failed: Vec<(usize, usize)> },
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Outcome of one driver run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub status: RunStatus,
    pub total_pairs: usize,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub chunks_reused: usize,
    /// Combined events in range order (empty unless the run completed)
    pub events: Vec<ProximityEvent>,
    pub combined_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Chunked, resumable proximity matching over a candidate pair list.
pub struct BatchDriver {
    output_dir: PathBuf,
    proximity: ProximityConfig,
    batch: BatchConfig,
    progress: Option<ProgressCallback>,
}

impl BatchDriver {
    pub fn new(output_dir: &Path, proximity: ProximityConfig, batch: BatchConfig) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            proximity,
            batch,
            progress: None,
        }
    }

    /// Attach a callback invoked after every chunk.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Whether pending chunks run on the rayon pool.
    pub fn parallel_enabled(&self) -> bool {
        cfg!(feature = "parallel") && self.batch.parallel
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.output_dir.join(CHUNK_DIR)
    }

    /// Process every chunk of `pairs` that has no artifact yet, then combine.
    ///
    /// Errors from scanning the artifact directory or reading back reused
    /// artifacts abort the run; a failed chunk write does not.
    pub fn run(&self, pairs: &[CandidatePair], points: &PointTable) -> Result<BatchReport> {
        self.proximity.validate()?;
        self.batch.validate()?;

        let started = Instant::now();
        let mut index = ChunkIndex::scan(&self.chunk_dir())?;
        let plan = plan_chunks(pairs.len(), self.batch.chunk_size);

        let (reused, pending): (Vec<ChunkRange>, Vec<ChunkRange>) =
            plan.iter().partition(|range| index.contains(range));

        info!(
            "[BatchDriver] {} pairs in {} chunks ({} already done)",
            pairs.len(),
            plan.len(),
            reused.len()
        );
        if self.batch.parallel && !self.parallel_enabled() {
            warn!("[BatchDriver] parallel requested but feature disabled; processing chunks sequentially");
        }

        let mut pairs_done = 0usize;
        let mut events_found = 0usize;
        for range in &reused {
            let path = index
                .get(range)
                .ok_or_internal("reused chunk missing from index")?;
            pairs_done += range.len();
            events_found += read_events(path)?.len();
            self.report(&ChunkProgress {
                range: *range,
                pairs_done,
                total_pairs: pairs.len(),
                events_found,
                elapsed: started.elapsed(),
                reused: true,
            });
        }

        let outcomes = self.process_pending(
            &pending,
            pairs,
            points,
            &index,
            started,
            pairs_done,
            events_found,
        );

        let mut failed = Vec::new();
        let mut processed = 0usize;
        for (range, outcome) in outcomes {
            match outcome {
                Ok(path) => {
                    index.record(range, path);
                    processed += 1;
                }
                Err(e) => {
                    error!("[BatchDriver] Chunk {} failed: {}", range, e);
                    failed.push(range);
                }
            }
        }

        if !failed.is_empty() {
            info!(
                "[BatchDriver] Run incomplete: {} of {} chunks failed and will be retried",
                failed.len(),
                plan.len()
            );
            return Ok(BatchReport {
                status: RunStatus::Partial {
                    failed: failed.iter().map(|r| (r.start, r.end)).collect(),
                },
                total_pairs: pairs.len(),
                chunks_total: plan.len(),
                chunks_processed: processed,
                chunks_reused: reused.len(),
                events: vec![],
                combined_path: None,
                elapsed: started.elapsed(),
            });
        }

        let events = combine(&index, &plan)?;
        let combined_path = self.output_dir.join(COMBINED_FILE);
        write_events_atomic(&combined_path, &events)?;

        info!(
            "[BatchDriver] Completed: {} close events from {} pairs in {:.1}s",
            events.len(),
            pairs.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(BatchReport {
            status: RunStatus::Completed,
            total_pairs: pairs.len(),
            chunks_total: plan.len(),
            chunks_processed: processed,
            chunks_reused: reused.len(),
            events,
            combined_path: Some(combined_path),
            elapsed: started.elapsed(),
        })
    }

    /// Match and persist the pending chunks; one outcome per chunk, in plan order.
    #[allow(clippy::too_many_arguments)]
    fn process_pending(
        &self,
        pending: &[ChunkRange],
        pairs: &[CandidatePair],
        points: &PointTable,
        index: &ChunkIndex,
        started: Instant,
        pairs_done: usize,
        events_found: usize,
    ) -> Vec<(ChunkRange, Result<PathBuf>)> {
        #[cfg(feature = "parallel")]
        {
            if self.parallel_enabled() {
                return self.process_parallel(
                    pending,
                    pairs,
                    points,
                    index,
                    started,
                    pairs_done,
                    events_found,
                );
            }
        }

        let mut pairs_done = pairs_done;
        let mut events_found = events_found;
        pending
            .iter()
            .map(|range| {
                let outcome = self.process_chunk(range, pairs, points, index);
                pairs_done += range.len();
                if let Ok((_, n)) = &outcome {
                    events_found += n;
                }
                self.report(&ChunkProgress {
                    range: *range,
                    pairs_done,
                    total_pairs: pairs.len(),
                    events_found,
                    elapsed: started.elapsed(),
                    reused: false,
                });
                (*range, outcome.map(|(path, _)| path))
            })
            .collect()
    }

    #[cfg(feature = "parallel")]
    #[allow(clippy::too_many_arguments)]
    fn process_parallel(
        &self,
        pending: &[ChunkRange],
        pairs: &[CandidatePair],
        points: &PointTable,
        index: &ChunkIndex,
        started: Instant,
        pairs_done: usize,
        events_found: usize,
    ) -> Vec<(ChunkRange, Result<PathBuf>)> {
        use rayon::prelude::*;
        use std::sync::atomic::{AtomicUsize, Ordering};

        info!("[BatchDriver] Using PARALLEL chunk processing (rayon)");
        let pairs_done = AtomicUsize::new(pairs_done);
        let events_found = AtomicUsize::new(events_found);

        pending
            .par_iter()
            .map(|range| {
                let outcome = self.process_chunk(range, pairs, points, index);
                let done = pairs_done.fetch_add(range.len(), Ordering::SeqCst) + range.len();
                let found = match &outcome {
                    Ok((_, n)) => events_found.fetch_add(*n, Ordering::SeqCst) + n,
                    Err(_) => events_found.load(Ordering::SeqCst),
                };
                self.report(&ChunkProgress {
                    range: *range,
                    pairs_done: done,
                    total_pairs: pairs.len(),
                    events_found: found,
                    elapsed: started.elapsed(),
                    reused: false,
                });
                (*range, outcome.map(|(path, _)| path))
            })
            .collect()
    }

    /// Match one chunk and write its artifact. Returns the path and event count.
    fn process_chunk(
        &self,
        range: &ChunkRange,
        pairs: &[CandidatePair],
        points: &PointTable,
        index: &ChunkIndex,
    ) -> Result<(PathBuf, usize)> {
        let events = match_pairs(&pairs[range.start..range.end], points, &self.proximity);
        let path = index.path_for(range);
        write_events_atomic(&path, &events)?;
        Ok((path, events.len()))
    }

    fn report(&self, progress: &ChunkProgress) {
        let percent = if progress.total_pairs == 0 {
            100.0
        } else {
            progress.pairs_done as f64 / progress.total_pairs as f64 * 100.0
        };
        info!(
            "[BatchDriver] Chunk {}{}: {}/{} pairs ({:.1}%) | {} close events | {:.1}s elapsed",
            progress.range,
            if progress.reused { " reused" } else { "" },
            progress.pairs_done,
            progress.total_pairs,
            percent,
            progress.events_found,
            progress.elapsed.as_secs_f64()
        );
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

/// Concatenate chunk artifacts in plan order.
fn combine(index: &ChunkIndex, plan: &[ChunkRange]) -> Result<Vec<ProximityEvent>> {
    let mut events = Vec::new();
    for range in plan {
        let path = index
            .get(range)
            .ok_or_internal("completed chunk missing from index")?;
        events.extend(read_events(path)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TripPoint;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn fixture() -> (Vec<CandidatePair>, PointTable) {
        // Trips 0..6; even trips sit at the same spot at seq 0
        let rows: Vec<TripPoint> = (0..6)
            .map(|i| {
                let lat = if i % 2 == 0 { 41.1579 } else { 41.2 + i as f64 * 0.01 };
                TripPoint::new(&format!("t{}", i), 0, lat, -8.6291)
            })
            .collect();
        let mut pairs = Vec::new();
        for i in 0..6 {
            for j in (i + 1)..6 {
                pairs.push(CandidatePair {
                    vehicle_a: format!("x{}", i),
                    vehicle_b: format!("x{}", j),
                    trip_a: format!("t{}", i),
                    trip_b: format!("t{}", j),
                });
            }
        }
        (pairs, PointTable::from_rows(rows))
    }

    fn driver(dir: &Path, chunk_size: usize) -> BatchDriver {
        BatchDriver::new(
            dir,
            ProximityConfig::default(),
            BatchConfig {
                chunk_size,
                ..BatchConfig::default()
            },
        )
    }

    #[test]
    fn test_run_writes_chunks_and_combined() {
        let tmp = TempDir::new().unwrap();
        let (pairs, points) = fixture();
        let report = driver(tmp.path(), 4).run(&pairs, &points).unwrap();

        assert!(report.status.is_complete());
        assert_eq!(report.total_pairs, 15);
        assert_eq!(report.chunks_total, 4);
        assert_eq!(report.chunks_processed, 4);
        // (t0,t2), (t0,t4), (t2,t4)
        assert_eq!(report.events.len(), 3);
        assert!(report.combined_path.unwrap().exists());
        assert_eq!(ChunkIndex::scan(&tmp.path().join(CHUNK_DIR)).unwrap().len(), 4);
    }

    #[test]
    fn test_second_run_reuses_everything() {
        let tmp = TempDir::new().unwrap();
        let (pairs, points) = fixture();
        let first = driver(tmp.path(), 4).run(&pairs, &points).unwrap();
        let combined_first = fs::read(tmp.path().join(COMBINED_FILE)).unwrap();

        let second = driver(tmp.path(), 4).run(&pairs, &points).unwrap();
        assert_eq!(second.chunks_reused, 4);
        assert_eq!(second.chunks_processed, 0);
        assert_eq!(second.events, first.events);
        assert_eq!(fs::read(tmp.path().join(COMBINED_FILE)).unwrap(), combined_first);
    }

    #[test]
    fn test_existing_artifact_content_is_reused_verbatim() {
        let tmp = TempDir::new().unwrap();
        let (pairs, points) = fixture();
        let chunk_dir = tmp.path().join(CHUNK_DIR);
        fs::create_dir_all(&chunk_dir).unwrap();

        // Pretend an earlier run found one (made-up) event in [0, 4)
        let planted = ProximityEvent {
            vehicle_a: "ghost-a".into(),
            vehicle_b: "ghost-b".into(),
            trip_a: "g1".into(),
            trip_b: "g2".into(),
            distance_m: 4.2,
            time_diff_s: 0,
        };
        write_events_atomic(
            &chunk_dir.join(ChunkRange::new(0, 4).file_name()),
            &[planted.clone()],
        )
        .unwrap();

        let report = driver(tmp.path(), 4).run(&pairs, &points).unwrap();
        assert_eq!(report.chunks_reused, 1);
        assert_eq!(report.events[0], planted);
    }

    #[test]
    fn test_progress_callback_sees_every_chunk() {
        let tmp = TempDir::new().unwrap();
        let (pairs, points) = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        driver(tmp.path(), 5)
            .with_progress(Arc::new(move |p: &ChunkProgress| {
                sink.lock().unwrap().push((p.range, p.pairs_done));
            }))
            .run(&pairs, &points)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().1, 15);
    }

    #[test]
    fn test_empty_pair_list_completes() {
        let tmp = TempDir::new().unwrap();
        let report = driver(tmp.path(), 10).run(&[], &PointTable::new()).unwrap();
        assert!(report.status.is_complete());
        assert_eq!(report.chunks_total, 0);
        assert!(report.events.is_empty());
    }

    #[test]
    fn test_failed_chunk_yields_partial_then_retries() {
        let tmp = TempDir::new().unwrap();
        let (pairs, points) = fixture();
        let chunk_dir = tmp.path().join(CHUNK_DIR);
        fs::create_dir_all(&chunk_dir).unwrap();

        // A directory squatting on the temporary name makes the write fail
        let blocked = ChunkRange::new(4, 8);
        let squatter = chunk_dir.join(format!("{}.tmp", blocked.file_name()));
        fs::create_dir(&squatter).unwrap();

        let report = driver(tmp.path(), 4).run(&pairs, &points).unwrap();
        assert_eq!(
            report.status,
            RunStatus::Partial {
                failed: vec![(4, 8)]
            }
        );
        assert_eq!(report.chunks_processed, 3);
        assert!(report.combined_path.is_none());
        assert!(report.events.is_empty());
        assert!(!tmp.path().join(COMBINED_FILE).exists());

        let index = ChunkIndex::scan(&chunk_dir).unwrap();
        assert_eq!(index.len(), 3);
        assert!(!index.contains(&blocked));

        fs::remove_dir(&squatter).unwrap();
        let retry = driver(tmp.path(), 4).run(&pairs, &points).unwrap();
        assert!(retry.status.is_complete());
        assert_eq!(retry.chunks_reused, 3);
        assert_eq!(retry.chunks_processed, 1);
        assert_eq!(retry.events.len(), 3);
        assert!(tmp.path().join(COMBINED_FILE).exists());
    }

    #[test]
    fn test_parallel_flag_matches_sequential_result() {
        let sequential_dir = TempDir::new().unwrap();
        let parallel_dir = TempDir::new().unwrap();
        let (pairs, points) = fixture();

        let sequential = driver(sequential_dir.path(), 2).run(&pairs, &points).unwrap();
        let parallel = BatchDriver::new(
            parallel_dir.path(),
            ProximityConfig::default(),
            BatchConfig {
                chunk_size: 2,
                parallel: true,
                ..BatchConfig::default()
            },
        );
        assert_eq!(parallel.parallel_enabled(), cfg!(feature = "parallel"));

        let report = parallel.run(&pairs, &points).unwrap();
        assert!(report.status.is_complete());
        assert_eq!(report.events, sequential.events);
        assert_eq!(
            fs::read(parallel_dir.path().join(COMBINED_FILE)).unwrap(),
            fs::read(sequential_dir.path().join(COMBINED_FILE)).unwrap()
        );
    }
}
