//! Raster resampling
//!
//! Turns the irregular per-signal series of one log file into a single table
//! with a uniform time step. Each cell holds the most recent sample at or
//! before its instant (zero-order hold); cells before a signal's first sample
//! are NaN.

use crate::accumulator::SignalSeries;
use crate::types::{PipelineError, Result};

/// One named column of a raster table
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<f64>,
}

/// Time-indexed table with one column per signal
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTable {
    time: Vec<f64>,
    columns: Vec<Column>,
}

impl RasterTable {
    /// Build a table, checking every column matches the time index
    pub fn new(time: Vec<f64>, columns: Vec<Column>) -> Result<Self> {
        if let Some(bad) = columns.iter().find(|c| c.values.len() != time.len()) {
            return Err(PipelineError::Table(format!(
                "column '{}' has {} rows, time index has {}",
                bad.name,
                bad.values.len(),
                time.len()
            )));
        }
        Ok(Self { time, columns })
    }

    /// Row labels in seconds
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Values of a named column
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn row_count(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Size of the table `resample` would build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterEstimate {
    pub rows: usize,
    pub columns: usize,
    pub time_span: f64,
    pub memory_mb: f64,
}

/// Predict the raster dimensions without allocating
pub fn estimate(series: &[SignalSeries], step: f64) -> Option<RasterEstimate> {
    let (tmin, tmax) = time_bounds(series)?;
    let columns = series.iter().filter(|s| !s.is_empty()).count();
    let rows = row_count(tmin, tmax, step);
    Some(RasterEstimate {
        rows,
        columns,
        time_span: tmax - tmin,
        memory_mb: table_bytes(rows, columns) / 1024.0 / 1024.0,
    })
}

/// Resample series onto a uniform grid from the first to the last timestamp
///
/// Instants are `tmin + k * step` up to and including `tmax` (with a small
/// float tolerance). With `time_from_zero` the row labels start at zero; the
/// sampling instants are unchanged.
pub fn resample(series: &[SignalSeries], step: f64, time_from_zero: bool) -> Result<RasterTable> {
    let series: Vec<&SignalSeries> = series.iter().filter(|s| !s.is_empty()).collect();
    let (tmin, tmax) = time_bounds(series.iter().copied()).ok_or(PipelineError::NoSignals)?;

    let span = (tmax - tmin) / step;
    if !span.is_finite() || span >= usize::MAX as f64 / 2.0 {
        return Err(resource_error(f64::INFINITY, step));
    }
    let rows = row_count(tmin, tmax, step);
    let estimated_mb = table_bytes(rows, series.len()) / 1024.0 / 1024.0;

    log::debug!(
        "Resampling {} signals onto {} rows (step {}, ~{:.1} MB)",
        series.len(),
        rows,
        step,
        estimated_mb
    );

    let mut time = Vec::new();
    time.try_reserve_exact(rows)
        .map_err(|_| resource_error(estimated_mb, step))?;
    let origin = if time_from_zero { 0.0 } else { tmin };
    time.extend((0..rows).map(|k| origin + k as f64 * step));

    let tolerance = step * 1e-9;
    let mut columns = Vec::new();
    columns
        .try_reserve_exact(series.len())
        .map_err(|_| resource_error(estimated_mb, step))?;

    for signal in series {
        let mut values = Vec::new();
        values
            .try_reserve_exact(rows)
            .map_err(|_| resource_error(estimated_mb, step))?;
        hold_last_value(signal, tmin, step, rows, tolerance, &mut values);
        columns.push(Column {
            name: signal.name.clone(),
            values,
        });
    }

    RasterTable::new(time, columns)
}

/// Fill `out` with the zero-order hold of `signal` at `tmin + k * step`
fn hold_last_value(
    signal: &SignalSeries,
    tmin: f64,
    step: f64,
    rows: usize,
    tolerance: f64,
    out: &mut Vec<f64>,
) {
    let sorted = signal.timestamps.windows(2).all(|w| w[0] <= w[1]);
    let order: Vec<usize> = if sorted {
        Vec::new()
    } else {
        let mut order: Vec<usize> = (0..signal.len()).collect();
        order.sort_by(|&a, &b| signal.timestamps[a].total_cmp(&signal.timestamps[b]));
        order
    };
    let at = |i: usize| if sorted { i } else { order[i] };

    let mut next = 0;
    let mut current = f64::NAN;
    for k in 0..rows {
        let instant = tmin + k as f64 * step + tolerance;
        while next < signal.len() && signal.timestamps[at(next)] <= instant {
            current = signal.values[at(next)];
            next += 1;
        }
        out.push(current);
    }
}

fn time_bounds<'a>(series: impl IntoIterator<Item = &'a SignalSeries>) -> Option<(f64, f64)> {
    series
        .into_iter()
        .flat_map(|s| s.timestamps.iter().copied())
        .fold(None, |bounds, t| match bounds {
            None => Some((t, t)),
            Some((lo, hi)) => Some((f64::min(lo, t), f64::max(hi, t))),
        })
}

fn row_count(tmin: f64, tmax: f64, step: f64) -> usize {
    ((tmax - tmin) / step + 1e-9).floor() as usize + 1
}

fn table_bytes(rows: usize, columns: usize) -> f64 {
    rows as f64 * (columns as f64 + 1.0) * std::mem::size_of::<f64>() as f64
}

pub(crate) fn resource_error(estimated_mb: f64, step: f64) -> PipelineError {
    PipelineError::ResourceExhausted {
        estimated_mb,
        suggested_step: step * 5.0,
    }
}
