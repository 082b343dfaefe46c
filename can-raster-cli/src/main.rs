//! CAN Raster CLI Application
//!
//! Command-line front end for the can-raster library:
//! - `decode` turns CAN logs into fixed-step CSV/Parquet tables
//! - `metrics` detects stages in decoded CSV tables and reports per-group metrics

use anyhow::{bail, Context, Result};
use can_raster::{CancelFlag, ExecutionMode, Pipeline, RunSummary, SaveFormat};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod config;
mod report;

use config::AppConfig;

/// CAN Raster - Decode CAN logs into time-aligned tables
#[derive(Parser, Debug)]
#[command(name = "can-raster")]
#[command(about = "Decode CAN logs (BLF, ASC) into fixed-step tables", long_about = None)]
#[command(version)]
struct Args {
    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode log files into raster tables
    Decode(DecodeArgs),
    /// Compute stage metrics over decoded CSV tables
    Metrics(MetricsArgs),
}

#[derive(clap::Args, Debug)]
struct DecodeArgs {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// DBC file or directory (can be repeated)
    #[arg(long, value_name = "PATH")]
    dbc: Vec<PathBuf>,

    /// Log file or directory (can be repeated)
    #[arg(short, long, value_name = "PATH")]
    log: Vec<PathBuf>,

    /// Output directory for the tables
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Raster step in seconds
    #[arg(long)]
    step: Option<f64>,

    /// Output format: csv or parquet (can be repeated)
    #[arg(short, long, value_name = "FORMAT")]
    format: Vec<SaveFormat>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Process files one at a time on the main thread
    #[arg(long)]
    sequential: bool,

    /// Label rows from zero instead of the first timestamp
    #[arg(long)]
    time_from_zero: bool,

    /// Only keep these signals (can be repeated)
    #[arg(long, value_name = "NAME")]
    signal: Vec<String>,

    /// Write the run summary as JSON
    #[arg(long, value_name = "FILE")]
    summary_json: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct MetricsArgs {
    /// Decoded CSV table or directory of tables
    source: PathBuf,

    /// Path to configuration file with a [metrics] section
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the grouped metrics as JSON
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Raster CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using can-raster library v{}", can_raster::VERSION);

    match &args.command {
        Command::Decode(decode) => decode_mode(decode, args.quiet),
        Command::Metrics(metrics) => metrics_mode(metrics, args.quiet),
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)
        }
        None => Ok(AppConfig::default()),
    }
}

/// Decode mode - plan units, run them, print the summary
fn decode_mode(args: &DecodeArgs, quiet: bool) -> Result<()> {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, finishing running files...");
        handler_flag.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    let summary = run_decode(args, quiet, cancel)?;

    // Failed files are reported in the summary
    if summary.interrupted {
        bail!("Run interrupted");
    }
    Ok(())
}

fn run_decode(args: &DecodeArgs, quiet: bool, cancel: CancelFlag) -> Result<RunSummary> {
    let app = load_app_config(args.config.as_deref())?;
    let mut config = app.to_pipeline_config();

    if !args.dbc.is_empty() {
        config.database_paths = args.dbc.clone();
    }
    if !args.log.is_empty() {
        config.log_sources = args.log.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(step) = args.step {
        config.step = step;
    }
    if !args.format.is_empty() {
        config.save_formats = args.format.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    if args.sequential {
        config.mode = ExecutionMode::Sequential;
    }
    if args.time_from_zero {
        config.time_from_zero = true;
    }
    if !args.signal.is_empty() {
        config = config.with_signal_names(args.signal.iter().cloned());
    }

    log::info!("Databases: {:?}", config.database_paths);
    log::info!("Logs: {:?}", config.log_sources);
    log::info!("Output: {:?} (step {})", config.output_dir, config.step);
    match &config.signal_names {
        Some(names) => log::info!("Signal filter: {} signals", names.len()),
        None => log::info!("Signal filter: disabled (all signals)"),
    }

    let summary = Pipeline::new(config)
        .with_cancel_flag(cancel)
        .run()
        .context("Decode run failed")?;

    if !quiet {
        print!("{}", report::render_summary(&summary));
    }

    let summary_path = args
        .summary_json
        .as_ref()
        .or(app.output.summary_json.as_ref());
    if let Some(path) = summary_path {
        write_json(path, &summary)?;
        log::info!("Summary written to {:?}", path);
    }

    Ok(summary)
}

/// Metrics mode - group decoded tables and report stage metrics
fn metrics_mode(args: &MetricsArgs, quiet: bool) -> Result<()> {
    let app = load_app_config(args.config.as_deref())?;

    let metrics = can_raster::compute_grouped_metrics(&args.source, &app.metrics)
        .with_context(|| format!("Failed to compute metrics for {:?}", args.source))?;

    if !quiet {
        print!("{}", report::render_metrics(&metrics));
    }

    if let Some(path) = &args.output {
        write_json(path, &metrics)?;
        log::info!("Metrics written to {:?}", path);
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
