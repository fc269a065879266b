//! Command-line entry point: load the Porto dataset, detect close encounters
//! between taxis, and run the auxiliary trip queries.
//!
//! ## Usage
//!
//! ```sh
//! taxi-proximity ingest --csv porto.csv --db porto.sqlite
//! taxi-proximity detect --db porto.sqlite --output runs/first
//! taxi-proximity detect --db porto.sqlite --output runs/first --config detect.json --parallel
//! taxi-proximity taxi-hours --db porto.sqlite --output taxi_hours.csv
//! taxi-proximity near --db porto.sqlite --output near_city_hall.csv --radius-m 100
//! ```
//!
//! `detect` exits with 0 when every chunk finished, 2 when some chunks failed
//! and the run should be repeated, and 1 on any other error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};

use taxi_proximity::analysis::{
    taxi_activity, trips_near, write_activity, write_trip_ids, CITY_HALL, DEFAULT_NEAR_RADIUS_M,
};
use taxi_proximity::{
    ingest_porto_csv, run_detection, DetectionConfig, GpsPoint, Result, RunStatus, SqliteStore,
};

const EXIT_PARTIAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(about = "Spatio-temporal proximity detection over taxi trajectories")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clean the raw Porto CSV and load it into the SQLite store.
    Ingest {
        /// Raw Porto taxi CSV.
        #[arg(long)]
        csv: PathBuf,

        /// SQLite database (created if missing).
        #[arg(long)]
        db: PathBuf,

        /// Delete existing trips and points first.
        #[arg(long)]
        replace: bool,
    },

    /// Find taxi pairs whose trips came close in space and time.
    Detect {
        #[arg(long)]
        db: PathBuf,

        /// Directory for chunk artifacts, combined result, summary and manifest.
        #[arg(long, default_value = "proximity_output")]
        output: PathBuf,

        /// JSON file with `proximity` and/or `batch` sections.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Distance threshold in meters.
        #[arg(long)]
        distance_m: Option<f64>,

        /// Time threshold in seconds.
        #[arg(long)]
        time_s: Option<u32>,

        /// Candidate pairs per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Maximum candidate pairs to consider.
        #[arg(long, conflicts_with = "all_pairs")]
        pair_limit: Option<usize>,

        /// Consider every candidate pair.
        #[arg(long)]
        all_pairs: bool,

        /// Taxi pairs shown in the log summary.
        #[arg(long)]
        top_n: Option<usize>,

        /// Process chunks in parallel (needs the `parallel` feature).
        #[arg(long)]
        parallel: bool,
    },

    /// Hours driven and start-to-end distance per taxi.
    TaxiHours {
        #[arg(long)]
        db: PathBuf,

        #[arg(long, default_value = "taxi_hours.csv")]
        output: PathBuf,

        #[arg(long, default_value_t = 15)]
        sample_interval_s: u32,

        /// Taxis shown in the log.
        #[arg(long, default_value_t = 20)]
        top_n: usize,
    },

    /// Trips passing within a radius of a coordinate (default: Porto City Hall).
    Near {
        #[arg(long)]
        db: PathBuf,

        #[arg(long, default_value = "near.csv")]
        output: PathBuf,

        #[arg(long, default_value_t = CITY_HALL.latitude)]
        lat: f64,

        #[arg(long, default_value_t = CITY_HALL.longitude)]
        lon: f64,

        #[arg(long, default_value_t = DEFAULT_NEAR_RADIUS_M)]
        radius_m: f64,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Ingest { csv, db, replace } => {
            let mut store = open_store(&db)?;
            if replace {
                store.clear()?;
            }
            let stats = ingest_porto_csv(&csv, &mut store)?;
            info!(
                "Store now holds {} trips and {} points ({} trips added)",
                store.trip_count()?,
                store.point_count()?,
                stats.trips_inserted
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Detect {
            db,
            output,
            config,
            distance_m,
            time_s,
            chunk_size,
            pair_limit,
            all_pairs,
            top_n,
            parallel,
        } => {
            let mut detection = match &config {
                Some(path) => DetectionConfig::from_json_file(path)?,
                None => DetectionConfig::default(),
            };
            if let Some(v) = distance_m {
                detection.proximity.distance_threshold_m = v;
            }
            if let Some(v) = time_s {
                detection.proximity.time_threshold_s = v;
            }
            if let Some(v) = chunk_size {
                detection.batch.chunk_size = v;
            }
            if pair_limit.is_some() {
                detection.batch.pair_limit = pair_limit;
            }
            if all_pairs {
                detection.batch.pair_limit = None;
            }
            if let Some(v) = top_n {
                detection.batch.top_n = v;
            }
            if parallel {
                detection.batch.parallel = true;
            }
            detection.validate()?;

            let store = open_store(&db)?;
            let outcome = run_detection(&store, &detection, &output, None)?;

            match &outcome.report.status {
                RunStatus::Completed => {
                    info!(
                        "Done: {} close events between {} taxi pairs, results in {}",
                        outcome.report.events.len(),
                        outcome.summary.len(),
                        output.display()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                RunStatus::Partial { failed } => {
                    error!(
                        "{} chunks failed; run the same command again to retry them",
                        failed.len()
                    );
                    Ok(ExitCode::from(EXIT_PARTIAL))
                }
            }
        }

        Command::TaxiHours {
            db,
            output,
            sample_interval_s,
            top_n,
        } => {
            let store = open_store(&db)?;
            let activity = taxi_activity(&store, sample_interval_s)?;
            write_activity(&output, &activity)?;
            for row in activity.iter().take(top_n) {
                info!(
                    "{:>12}  {:>5} trips  {:>9.2} h  {:>10.2} km",
                    row.taxi_id, row.trips, row.hours, row.distance_km
                );
            }
            info!("Wrote {} taxis to {}", activity.len(), output.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Near {
            db,
            output,
            lat,
            lon,
            radius_m,
        } => {
            let store = open_store(&db)?;
            let trips = trips_near(&store, GpsPoint::new(lat, lon), radius_m)?;
            write_trip_ids(&output, &trips)?;
            info!("Wrote {} trip ids to {}", trips.len(), output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    SqliteStore::new(&path.to_string_lossy())
}
