//! CAN Raster Library
//!
//! Batch decoding of CAN logs (BLF, ASC) into uniformly sampled tables, plus
//! stage detection and metric extraction over those tables.
//!
//! # Architecture
//!
//! - `signals` loads DBC files into a `SignalDatabase`
//! - `formats` streams raw frames out of log containers
//! - `frame_decoder` turns a frame into named physical values
//! - `accumulator` collects per-signal series for one file
//! - `raster` resamples the series onto a fixed step (zero-order hold)
//! - `writer` saves tables as CSV, Parquet and MAT-files (`mat`)
//! - `orchestrator` plans (database, log) work units and runs them
//! - `stages` and `metrics` analyse saved tables
//!
//! Per-frame decode failures never abort a file; they are counted in the
//! file's `FileOutcome`. A failing file never aborts the run.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_raster::{ExecutionMode, Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::new()
//!     .add_database("powertrain.dbc")
//!     .add_log_source("logs/")
//!     .with_output_dir("decoded")
//!     .with_step(0.02)
//!     .with_mode(ExecutionMode::Parallel);
//!
//! let summary = Pipeline::new(config).run().unwrap();
//! for outcome in &summary.outcomes {
//!     if !outcome.success {
//!         eprintln!("{}: {}", outcome.file_name, outcome.error.as_deref().unwrap_or("?"));
//!     }
//! }
//! ```

// Public modules
pub mod accumulator;
pub mod config;
pub mod formats;
pub mod frame_decoder;
pub mod mat;
pub mod metrics;
pub mod orchestrator;
pub mod outcome;
pub mod raster;
pub mod signals;
pub mod stages;
pub mod types;
pub mod writer;

// Re-export main types for convenience
pub use accumulator::{SeriesAccumulator, SignalSeries};
pub use config::{ExecutionMode, PipelineConfig, SaveFormat, SizeTier};
pub use frame_decoder::FrameDecoder;
pub use metrics::{
    compute_file_metrics, compute_grouped_metrics, GroupedMetrics, MetricsConfig, SkippedFile,
    SlipMetrics, StageMetrics,
};
pub use orchestrator::{
    decode_unit, plan_work_units, process_unit, CancelFlag, DecodedFile, Pipeline, WorkUnit,
};
pub use outcome::{DecodeErrorKind, DecodeStats, ErrorTaxonomy, FileOutcome, RunSummary};
pub use raster::{resample, Column, RasterTable};
pub use signals::{DatabaseStats, SignalDatabase};
pub use stages::{find_stages, Band, Stage, StageDetector};
pub use types::{FileKind, Frame, PipelineError, Result};
pub use writer::{read_csv_table, write_table, WriteReport, TIME_COLUMN};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
