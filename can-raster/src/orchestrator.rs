//! Work planning and execution
//!
//! A run pairs every discovered database with every discovered log file.
//! Each pair is a `WorkUnit`; a unit decodes its log, resamples the series
//! and writes the raster table. Units never fail the run: errors and panics
//! inside a unit become a failed `FileOutcome`.
//!
//! In parallel mode at most `effective_workers` units are in flight. A new
//! unit is dispatched each time one completes, unless the cancel flag is set.

use crate::accumulator::SeriesAccumulator;
use crate::config::{ExecutionMode, PipelineConfig, SaveFormat, SizeTier};
use crate::formats::open_log;
use crate::frame_decoder::FrameDecoder;
use crate::outcome::{percentage, DecodeStats, FileOutcome, RunSummary};
use crate::raster::{self, RasterTable};
use crate::signals::SignalDatabase;
use crate::types::{FileKind, PipelineError, Result};
use crate::writer::write_table;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Frames between progress lines for very large files
const PROGRESS_INTERVAL: u64 = 50_000;

/// Accumulated memory above which very large files get a warning
const MEMORY_WARNING_MB: f64 = 2000.0;

/// Steps below this get a warning for very large files
const SMALL_STEP_WARNING: f64 = 0.01;

/// Shared cooperative cancellation flag
///
/// Checked by the dispatcher before each new unit and by running units at
/// every accumulator flush.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; running units stop at their next flush
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl From<Arc<AtomicBool>> for CancelFlag {
    fn from(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }
}

/// One (database, log file) pair with everything needed to process it
///
/// Units are self-contained: a worker needs nothing else to run one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub database_path: PathBuf,
    pub log_path: PathBuf,
    pub file_kind: FileKind,
    pub signal_filter: Option<BTreeSet<String>>,
    pub name_remap: Option<BTreeMap<String, String>>,
    pub step: f64,
    pub time_from_zero: bool,
    pub output_dir: PathBuf,
    pub formats: Vec<SaveFormat>,
    /// Configured flush interval, before size-tier scaling
    pub batch_size: usize,
    /// Output file name without extension
    pub output_base_name: String,
}

impl WorkUnit {
    /// Log file name without its directory
    pub fn file_name(&self) -> String {
        file_name_of(&self.log_path)
    }

    /// Database file name without its directory
    pub fn database_name(&self) -> String {
        file_name_of(&self.database_path)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn file_stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name_of(path))
}

fn sorted_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Expand database paths into DBC files
///
/// A directory contributes its `*.dbc` files (not recursive); a file is
/// taken as is. A path that does not exist is a configuration error.
pub fn discover_databases(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut databases = Vec::new();

    for path in paths {
        if path.is_dir() {
            let found: Vec<PathBuf> = sorted_dir_entries(path)?
                .into_iter()
                .filter(|p| p.is_file())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("dbc"))
                })
                .collect();
            log::debug!("Found {} DBC files in {:?}", found.len(), path);
            databases.extend(found);
        } else if path.is_file() {
            databases.push(path.clone());
        } else {
            return Err(PipelineError::Config(format!(
                "invalid database path: {}",
                path.display()
            )));
        }
    }

    Ok(databases)
}

/// Expand log sources into `.blf` / `.asc` files
///
/// A directory contributes the supported files directly inside it. A file
/// with another extension is skipped with a warning. A path that does not
/// exist is a configuration error.
pub fn discover_logs(paths: &[PathBuf]) -> Result<Vec<(PathBuf, FileKind)>> {
    let mut logs = Vec::new();

    for path in paths {
        if path.is_dir() {
            let found: Vec<(PathBuf, FileKind)> = sorted_dir_entries(path)?
                .into_iter()
                .filter(|p| p.is_file())
                .filter_map(|p| FileKind::from_path(&p).map(|kind| (p, kind)))
                .collect();
            log::debug!("Found {} log files in {:?}", found.len(), path);
            logs.extend(found);
        } else if path.is_file() {
            match FileKind::from_path(path) {
                Some(kind) => logs.push((path.clone(), kind)),
                None => log::warn!("Skipping {:?}: not a .blf or .asc file", path),
            }
        } else {
            return Err(PipelineError::Config(format!(
                "invalid log path: {}",
                path.display()
            )));
        }
    }

    Ok(logs)
}

/// Pair every database with every log file
///
/// With one database the output is named after the log; with several it is
/// `<log stem>_<database stem>` so the tables do not overwrite each other.
///
/// # Errors
/// * `PipelineError::Config` - a configured path does not exist
/// * `PipelineError::NoWorkUnits` - no database or no log file was found
pub fn plan_work_units(config: &PipelineConfig) -> Result<Vec<WorkUnit>> {
    let databases = discover_databases(&config.database_paths)?;
    let logs = discover_logs(&config.log_sources)?;
    let multi_database = databases.len() > 1;

    let units: Vec<WorkUnit> = databases
        .iter()
        .flat_map(|database| {
            logs.iter().map(move |(log_path, kind)| {
                let output_base_name = if multi_database {
                    format!("{}_{}", file_stem_of(log_path), file_stem_of(database))
                } else {
                    file_stem_of(log_path)
                };

                WorkUnit {
                    database_path: database.clone(),
                    log_path: log_path.clone(),
                    file_kind: *kind,
                    signal_filter: config.signal_names.clone(),
                    name_remap: config.signal_mapping.clone(),
                    step: config.step,
                    time_from_zero: config.time_from_zero,
                    output_dir: config.output_dir.clone(),
                    formats: config.save_formats.clone(),
                    batch_size: config.batch_size,
                    output_base_name,
                }
            })
        })
        .collect();

    if units.is_empty() {
        return Err(PipelineError::NoWorkUnits);
    }

    log::info!(
        "Planned {} work units ({} databases x {} log files)",
        units.len(),
        databases.len(),
        logs.len()
    );
    Ok(units)
}

/// Resampled table of one unit with its decode counters
#[derive(Debug, Clone)]
pub struct DecodedFile {
    pub table: RasterTable,
    pub stats: DecodeStats,
    pub size_tier: SizeTier,
}

fn size_tier_of(path: &Path) -> SizeTier {
    std::fs::metadata(path)
        .map(|m| SizeTier::from_size(m.len()))
        .unwrap_or_default()
}

/// Decode and resample one unit without writing anything
///
/// # Arguments
/// * `unit` - The work unit to decode
/// * `cancel` - Checked at every accumulator flush
///
/// # Example
/// ```no_run
/// use can_raster::{plan_work_units, decode_unit, CancelFlag, PipelineConfig};
///
/// let config = PipelineConfig::new()
///     .add_database("powertrain.dbc")
///     .add_log_source("drive.asc");
/// let units = plan_work_units(&config).unwrap();
/// let decoded = decode_unit(&units[0], &CancelFlag::new()).unwrap();
/// println!("{} rows", decoded.table.row_count());
/// ```
pub fn decode_unit(unit: &WorkUnit, cancel: &CancelFlag) -> Result<DecodedFile> {
    let mut stats = DecodeStats::default();
    let size_tier = size_tier_of(&unit.log_path);
    let table = decode_into(unit, cancel, size_tier, &mut stats)?;
    Ok(DecodedFile {
        table,
        stats,
        size_tier,
    })
}

/// Decode and resample, filling `stats` as frames are consumed
///
/// Counters stay meaningful when this returns an error part-way.
fn decode_into(
    unit: &WorkUnit,
    cancel: &CancelFlag,
    size_tier: SizeTier,
    stats: &mut DecodeStats,
) -> Result<RasterTable> {
    let file_name = unit.file_name();
    let very_large = size_tier == SizeTier::VeryLarge;
    if very_large {
        let size_mb = std::fs::metadata(&unit.log_path)
            .map(|m| m.len() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0);
        log::warn!(
            "Very large file: {} ({:.0} MB), processing in reduced-batch mode",
            file_name,
            size_mb
        );
    }

    let database = SignalDatabase::load(&unit.database_path)?;
    let decoder = FrameDecoder::new(&database);
    let frames = open_log(&unit.log_path, unit.file_kind)?;

    let mut accumulator = SeriesAccumulator::new(size_tier.batch_size(unit.batch_size))
        .with_filter(unit.signal_filter.clone())
        .with_remap(unit.name_remap.clone())
        .with_step(unit.step);

    for frame in frames {
        let frame = frame?;
        stats.total_frames += 1;

        let timestamp = frame.timestamp;
        match decoder.decode_with(frame.can_id, &frame.data, |name, value| {
            accumulator.push(name, timestamp, value)
        }) {
            Ok(0) => stats.error_count += 1,
            Ok(_) => stats.decoded_frames += 1,
            Err(kind) => {
                log::trace!("Frame 0x{:X} at {}: {}", frame.can_id, timestamp, kind);
                stats.record_error(kind);
            }
        }

        if accumulator.end_frame() && cancel.is_cancelled() {
            log::info!("{}: cancelled after {} frames", file_name, stats.total_frames);
            return Err(PipelineError::Interrupted);
        }

        if very_large && stats.total_frames % PROGRESS_INTERVAL == 0 {
            log::info!(
                "{}: {} frames processed (decode rate {:.1}%)",
                file_name,
                stats.total_frames,
                percentage(stats.decoded_frames, stats.total_frames)
            );
        }
    }

    stats.signal_count = accumulator.signal_count();
    stats.data_points = accumulator.data_points() as u64;
    let series = accumulator.finish()?;

    if very_large && stats.signal_count > 0 {
        let memory_mb = stats.estimated_memory_mb();
        log::info!(
            "{}: {} signals, {} data points, ~{:.1} MB accumulated",
            file_name,
            stats.signal_count,
            stats.data_points,
            memory_mb
        );
        if memory_mb > MEMORY_WARNING_MB {
            log::warn!(
                "{}: accumulated data exceeds {:.0} MB, consider a larger step",
                file_name,
                MEMORY_WARNING_MB
            );
        }
        if let Some(estimate) = raster::estimate(&series, unit.step) {
            log::info!(
                "{}: time span {:.1} s, ~{} rows, ~{:.0} MB expected",
                file_name,
                estimate.time_span,
                estimate.rows,
                estimate.memory_mb
            );
        }
        if unit.step < SMALL_STEP_WARNING {
            log::warn!(
                "{}: step {} is very small for a file this size, consider 0.05 or more",
                file_name,
                unit.step
            );
        }
    }

    let table = raster::resample(&series, unit.step, unit.time_from_zero)?;

    if very_large {
        log::info!(
            "{}: raster table {} rows x {} columns",
            file_name,
            table.row_count(),
            table.columns().len()
        );
    }

    Ok(table)
}

/// Run one unit end to end and report its outcome
///
/// Never returns an error and never unwinds: decode errors, save failures
/// and panics all become a failed outcome.
pub fn process_unit(unit: &WorkUnit, cancel: &CancelFlag) -> FileOutcome {
    let started = Instant::now();
    let mut outcome = FileOutcome::new(unit.file_name(), unit.database_name());
    outcome.size_tier = size_tier_of(&unit.log_path);

    log::info!("Processing {} with {}", outcome.file_name, outcome.database);

    let result = panic::catch_unwind(AssertUnwindSafe(|| run_unit(unit, cancel, &mut outcome)));

    match result {
        Ok(Ok(())) => {
            outcome.success = true;
            log::info!(
                "Finished {}: {}/{} frames decoded, {} signals",
                outcome.file_name,
                outcome.decoded_frames,
                outcome.total_frames,
                outcome.signal_count
            );
        }
        Ok(Err(e)) => {
            log::error!("Failed {}: {}", outcome.file_name, e);
            outcome.fail_with_diagnostic(&e, &format!("{:?}", e));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Worker panicked on {}: {}", outcome.file_name, message);
            outcome.fail_with_diagnostic("worker panicked", &message);
        }
    }

    outcome.elapsed_secs = started.elapsed().as_secs_f64();
    outcome
}

fn run_unit(unit: &WorkUnit, cancel: &CancelFlag, outcome: &mut FileOutcome) -> Result<()> {
    let mut stats = DecodeStats::default();
    let decoded = decode_into(unit, cancel, outcome.size_tier, &mut stats);
    outcome.apply_stats(&stats);
    let table = decoded?;

    let report = write_table(&table, &unit.output_base_name, &unit.output_dir, &unit.formats);
    let failed = report.all_failed();
    outcome.save_warnings = report.warnings;
    outcome.outputs = report.written;

    if failed {
        return Err(PipelineError::AllSavesFailed);
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Batch decoder: plans the units of a configuration and runs them
///
/// # Example
/// ```no_run
/// use can_raster::{Pipeline, PipelineConfig};
///
/// let config = PipelineConfig::new()
///     .add_database("powertrain.dbc")
///     .add_log_source("logs/")
///     .with_output_dir("decoded")
///     .with_step(0.05);
///
/// let summary = Pipeline::new(config).run().unwrap();
/// println!("{}/{} files decoded", summary.success_count, summary.file_count());
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
        }
    }

    /// Use an externally owned cancel flag (e.g. set from a signal handler)
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the configuration and list the units a run would process
    pub fn plan(&self) -> Result<Vec<WorkUnit>> {
        self.config.validate()?;
        plan_work_units(&self.config)
    }

    /// Process every unit and summarize
    ///
    /// # Errors
    /// Only configuration problems fail the run: invalid settings, missing
    /// paths, no work units, or an output directory that cannot be created.
    pub fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let units = self.plan()?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let outcomes = match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(units),
            ExecutionMode::Parallel => self.run_parallel(units)?,
        };

        let summary = RunSummary::from_outcomes(outcomes, started_at, self.cancel.is_cancelled());
        log::info!(
            "Run finished: {}/{} files succeeded{}",
            summary.success_count,
            summary.file_count(),
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        Ok(summary)
    }

    fn run_sequential(&self, units: Vec<WorkUnit>) -> Vec<FileOutcome> {
        let total = units.len();
        let mut outcomes = Vec::with_capacity(total);

        for unit in units {
            if self.cancel.is_cancelled() {
                log::warn!("Cancelled, {} units not started", total - outcomes.len());
                break;
            }
            outcomes.push(process_unit(&unit, &self.cancel));
            log::info!("Progress: {}/{}", outcomes.len(), total);
        }

        outcomes
    }

    fn run_parallel(&self, units: Vec<WorkUnit>) -> Result<Vec<FileOutcome>> {
        let total = units.len();
        let workers = self.config.effective_workers().min(total).max(1);
        log::info!("Processing {} units with {} workers", total, workers);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("can-raster-worker-{}", i))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to start worker pool: {}", e)))?;

        let (tx, rx) = crossbeam_channel::unbounded::<FileOutcome>();
        let dispatch = |unit: WorkUnit| {
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            pool.spawn(move || {
                let outcome = process_unit(&unit, &cancel);
                // The receiver outlives every worker
                let _ = tx.send(outcome);
            });
        };

        let mut pending = units.into_iter();
        let mut in_flight = 0usize;
        for unit in pending.by_ref().take(workers) {
            dispatch(unit);
            in_flight += 1;
        }

        let mut outcomes = Vec::with_capacity(total);
        while in_flight > 0 {
            let Ok(outcome) = rx.recv() else {
                break;
            };
            in_flight -= 1;
            outcomes.push(outcome);
            log::info!("Progress: {}/{}", outcomes.len(), total);

            if self.cancel.is_cancelled() {
                continue;
            }
            if let Some(unit) = pending.next() {
                dispatch(unit);
                in_flight += 1;
            }
        }

        let not_started = pending.len();
        if not_started > 0 {
            log::warn!("Cancelled, {} units not started", not_started);
        }

        Ok(outcomes)
    }
}
