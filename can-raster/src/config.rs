//! Pipeline configuration types
//!
//! This module defines everything a decode run needs: where the databases and
//! logs live, how to resample, and which formats to write. Values are passed
//! explicitly into each component; nothing here is global.

use crate::types::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Files above this size are treated as large (500 MiB)
pub const LARGE_FILE_THRESHOLD: u64 = 500 * 1024 * 1024;

/// Files above this size are treated as very large (1 GiB)
pub const VERY_LARGE_FILE_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Configuration for one decode run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// DBC files, or directories containing `*.dbc` files
    #[serde(default)]
    pub database_paths: Vec<PathBuf>,

    /// Log files (.blf/.asc) or directories containing them
    #[serde(default)]
    pub log_sources: Vec<PathBuf>,

    /// Directory the raster tables are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Raster step in seconds
    #[serde(default = "default_step")]
    pub step: f64,

    /// Output formats, each written with its own fallback
    #[serde(default = "default_save_formats")]
    pub save_formats: Vec<SaveFormat>,

    /// Worker count for parallel mode (default: available parallelism - 1, at least 1)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Frames between accumulator flushes for normal-sized files
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Optional allow-list of decoded signal names
    #[serde(default)]
    pub signal_names: Option<BTreeSet<String>>,

    /// Optional decoded-name -> output-name rename table
    #[serde(default)]
    pub signal_mapping: Option<BTreeMap<String, String>>,

    /// Label raster rows from zero instead of the first timestamp
    #[serde(default)]
    pub time_from_zero: bool,

    /// Sequential or parallel execution
    #[serde(default)]
    pub mode: ExecutionMode,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./decoded")
}

pub(crate) fn default_step() -> f64 {
    0.02
}

fn default_save_formats() -> Vec<SaveFormat> {
    vec![SaveFormat::Parquet, SaveFormat::Csv]
}

fn default_batch_size() -> usize {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_paths: Vec::new(),
            log_sources: Vec::new(),
            output_dir: default_output_dir(),
            step: default_step(),
            save_formats: default_save_formats(),
            workers: None,
            batch_size: default_batch_size(),
            signal_names: None,
            signal_mapping: None,
            time_from_zero: false,
            mode: ExecutionMode::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: add a database file or directory
    pub fn add_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_paths.push(path.into());
        self
    }

    /// Builder method: add a log file or directory
    pub fn add_log_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_sources.push(path.into());
        self
    }

    /// Builder method: set the output directory
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Builder method: set the raster step
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    /// Builder method: set the output formats
    pub fn with_save_formats(mut self, formats: Vec<SaveFormat>) -> Self {
        self.save_formats = formats;
        self
    }

    /// Builder method: set the output formats from names such as ".csv" or "parquet"
    pub fn with_save_format_names<S: AsRef<str>>(mut self, names: &[S]) -> Result<Self> {
        self.save_formats = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    /// Builder method: set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Builder method: set the flush batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method: restrict decoding to these signal names
    ///
    /// An empty list means "decode everything".
    pub fn with_signal_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        self.signal_names = if names.is_empty() { None } else { Some(names) };
        self
    }

    /// Builder method: rename decoded signals before storage
    pub fn with_signal_mapping(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.signal_mapping = if mapping.is_empty() { None } else { Some(mapping) };
        self
    }

    /// Builder method: label raster rows from zero
    pub fn with_time_from_zero(mut self, enabled: bool) -> Self {
        self.time_from_zero = enabled;
        self
    }

    /// Builder method: choose sequential or parallel execution
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Worker count actually used in parallel mode
    pub fn effective_workers(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1),
        }
    }

    /// Check the configuration before any work is planned
    pub fn validate(&self) -> Result<()> {
        if self.database_paths.is_empty() {
            return Err(PipelineError::Config(
                "missing required field: database_paths".to_string(),
            ));
        }
        if self.log_sources.is_empty() {
            return Err(PipelineError::Config(
                "missing required field: log_sources".to_string(),
            ));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(PipelineError::Config(format!(
                "step must be a positive number, got {}",
                self.step
            )));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".to_string()));
        }
        if self.save_formats.is_empty() {
            return Err(PipelineError::Config(
                "save_formats must name at least one format".to_string(),
            ));
        }
        let unique: BTreeSet<SaveFormat> = self.save_formats.iter().copied().collect();
        if unique.len() != self.save_formats.len() {
            return Err(PipelineError::Config(
                "save_formats contains duplicates".to_string(),
            ));
        }
        Ok(())
    }
}

/// How work units are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One unit at a time on the calling thread
    Sequential,
    /// Units spread across a fixed-size worker pool
    #[default]
    Parallel,
}

/// Supported table output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SaveFormat {
    /// Comma separated values
    Csv,
    /// Apache Parquet
    Parquet,
    /// MATLAB level 5 MAT-file
    Mat,
}

impl SaveFormat {
    /// File extension including the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            SaveFormat::Csv => ".csv",
            SaveFormat::Parquet => ".parquet",
            SaveFormat::Mat => ".mat",
        }
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SaveFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.').to_lowercase().as_str() {
            "csv" => Ok(SaveFormat::Csv),
            "parquet" => Ok(SaveFormat::Parquet),
            "mat" => Ok(SaveFormat::Mat),
            other => Err(PipelineError::Config(format!(
                "Unsupported save format: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for SaveFormat {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SaveFormat> for String {
    fn from(format: SaveFormat) -> Self {
        format.extension().to_string()
    }
}

/// Advisory file-size classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    #[default]
    Normal,
    Large,
    VeryLarge,
}

impl SizeTier {
    /// Classify a file by its size in bytes
    pub fn from_size(bytes: u64) -> Self {
        if bytes > VERY_LARGE_FILE_THRESHOLD {
            SizeTier::VeryLarge
        } else if bytes > LARGE_FILE_THRESHOLD {
            SizeTier::Large
        } else {
            SizeTier::Normal
        }
    }

    /// Flush interval for this tier, scaled from the configured batch size
    ///
    /// With the default of 1000 this gives 1000 / 800 / 500.
    pub fn batch_size(self, configured: usize) -> usize {
        let scaled = match self {
            SizeTier::Normal => configured,
            SizeTier::Large => configured * 4 / 5,
            SizeTier::VeryLarge => configured / 2,
        };
        scaled.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> PipelineConfig {
        PipelineConfig::new()
            .add_database("powertrain.dbc")
            .add_log_source("logs/")
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new();
        assert_eq!(config.step, 0.02);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.save_formats, vec![SaveFormat::Parquet, SaveFormat::Csv]);
        assert_eq!(config.mode, ExecutionMode::Parallel);
        assert!(!config.time_from_zero);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_missing_required_fields() {
        let err = PipelineConfig::new().add_log_source("a.asc").validate().unwrap_err();
        assert!(err.to_string().contains("database_paths"));

        let err = PipelineConfig::new().add_database("a.dbc").validate().unwrap_err();
        assert!(err.to_string().contains("log_sources"));

        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(minimal().with_step(0.0).validate().is_err());
        assert!(minimal().with_step(f64::NAN).validate().is_err());
        assert!(minimal().with_batch_size(0).validate().is_err());
        assert!(minimal().with_save_formats(vec![]).validate().is_err());
        assert!(minimal()
            .with_save_formats(vec![SaveFormat::Csv, SaveFormat::Csv])
            .validate()
            .is_err());
    }

    #[test]
    fn test_save_format_names() {
        let config = minimal()
            .with_save_format_names(&[".csv", "Parquet", "mat"])
            .unwrap();
        assert_eq!(
            config.save_formats,
            vec![SaveFormat::Csv, SaveFormat::Parquet, SaveFormat::Mat]
        );

        let err = minimal().with_save_format_names(&[".xlsx"]).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_empty_signal_list_means_all() {
        let config = minimal().with_signal_names(Vec::<String>::new());
        assert!(config.signal_names.is_none());
    }

    #[test]
    fn test_size_tiers() {
        assert_eq!(SizeTier::from_size(10), SizeTier::Normal);
        assert_eq!(SizeTier::from_size(LARGE_FILE_THRESHOLD + 1), SizeTier::Large);
        assert_eq!(SizeTier::from_size(VERY_LARGE_FILE_THRESHOLD + 1), SizeTier::VeryLarge);

        assert_eq!(SizeTier::Normal.batch_size(1000), 1000);
        assert_eq!(SizeTier::Large.batch_size(1000), 800);
        assert_eq!(SizeTier::VeryLarge.batch_size(1000), 500);
        assert_eq!(SizeTier::VeryLarge.batch_size(1), 1);
    }

    #[test]
    fn test_config_deserialization() {
        let json = r#"{
            "database_paths": ["a.dbc"],
            "log_sources": ["logs"],
            "save_formats": [".csv"],
            "mode": "sequential"
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.save_formats, vec![SaveFormat::Csv]);
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.step, 0.02);

        let bad = r#"{ "save_formats": [".xlsx"] }"#;
        assert!(serde_json::from_str::<PipelineConfig>(bad).is_err());
    }
}
