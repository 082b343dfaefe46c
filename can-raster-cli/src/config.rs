//! Configuration file loading
//!
//! A TOML file with `[input]`, `[output]`, `[decode]` and `[metrics]`
//! sections. Every section is optional; command-line flags are laid over the
//! file afterwards.

use anyhow::{Context, Result};
use can_raster::{ExecutionMode, MetricsConfig, PipelineConfig, SaveFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    /// DBC files or directories
    #[serde(default)]
    pub databases: Vec<PathBuf>,
    /// Log files or directories
    #[serde(default)]
    pub logs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub formats: Vec<SaveFormat>,
    /// Where to write the run summary as JSON
    pub summary_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecodeConfig {
    pub step: Option<f64>,
    #[serde(default)]
    pub time_from_zero: bool,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub signal_names: Vec<String>,
    #[serde(default)]
    pub signal_mapping: BTreeMap<String, String>,
}

impl AppConfig {
    /// Build the library configuration; unset values keep library defaults
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new();
        config.database_paths = self.input.databases.clone();
        config.log_sources = self.input.logs.clone();

        if let Some(dir) = &self.output.dir {
            config.output_dir = dir.clone();
        }
        if !self.output.formats.is_empty() {
            config.save_formats = self.output.formats.clone();
        }

        let decode = &self.decode;
        if let Some(step) = decode.step {
            config.step = step;
        }
        if let Some(batch_size) = decode.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(mode) = decode.mode {
            config.mode = mode;
        }
        config.workers = decode.workers;
        config.time_from_zero = decode.time_from_zero;
        if !decode.signal_names.is_empty() {
            config.signal_names = Some(decode.signal_names.iter().cloned().collect::<BTreeSet<_>>());
        }
        if !decode.signal_mapping.is_empty() {
            config.signal_mapping = Some(decode.signal_mapping.clone());
        }

        config
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}
