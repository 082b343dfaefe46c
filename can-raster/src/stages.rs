//! Stage detection
//!
//! A stage is a contiguous row range where every tracked signal climbs from
//! the low edge of its band towards the high edge. Each signal gets a
//! per-row growth flag from a small hysteresis state machine; the flags of
//! all signals are ANDed and every run of `true` rows is one stage.
//!
//! Growth rules for one signal (the current value is truncated towards zero,
//! the previous value is used as recorded):
//!
//! - value == min: start a new run here. If a run was already open and the
//!   previous row also sat at min, that previous row is unflagged, so a long
//!   plateau at min contributes only its last row.
//! - in growth, value dropped by more than the tolerance: unflag the whole
//!   run and leave growth.
//! - in growth, dropped by at most the tolerance: flag and extend.
//! - in growth, value within `[min, max]`: flag and extend; reaching max
//!   completes the run (flags kept).
//! - in growth, value above max: leave growth, flags kept.
//! - missing value (NaN): unflag the run and leave growth.
//!
//! A table checked against no signals at all is one stage spanning every row.

use crate::raster::RasterTable;
use crate::types::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest drop between consecutive rows that does not end a growth run
pub const DEFAULT_DROP_TOLERANCE: f64 = 2.0;

/// Inclusive `[min, max]` band a signal should grow through
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Band from `min` with no upper limit
    pub fn unbounded_above(min: f64) -> Self {
        Self::new(min, f64::INFINITY)
    }
}

impl From<(f64, f64)> for Band {
    fn from((min, max): (f64, f64)) -> Self {
        Self::new(min, max)
    }
}

impl From<Band> for (f64, f64) {
    fn from(band: Band) -> Self {
        (band.min, band.max)
    }
}

/// Inclusive row range `[start_index, end_index]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub start_index: usize,
    pub end_index: usize,
}

impl Stage {
    pub fn new(start_index: usize, end_index: usize) -> Self {
        debug_assert!(end_index >= start_index);
        Self {
            start_index,
            end_index,
        }
    }

    /// Number of rows in the stage
    pub fn len(&self) -> usize {
        self.end_index - self.start_index + 1
    }

    /// The stage's rows of a column
    pub fn slice<'a>(&self, values: &'a [f64]) -> &'a [f64] {
        &values[self.start_index..=self.end_index]
    }
}

/// Growth-flag state machine with a configurable drop tolerance
#[derive(Debug, Clone, Copy)]
pub struct StageDetector {
    tolerance: f64,
}

impl Default for StageDetector {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_DROP_TOLERANCE,
        }
    }
}

impl StageDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Per-row growth flags of one signal
    pub fn growth_flags(&self, values: &[f64], band: Band) -> Vec<bool> {
        let mut flags = vec![false; values.len()];
        let mut in_growth = false;
        let mut run: Vec<usize> = Vec::new();

        for (i, &raw) in values.iter().enumerate() {
            if raw.is_nan() {
                if in_growth {
                    run.drain(..).for_each(|r| flags[r] = false);
                    in_growth = false;
                }
                continue;
            }

            let value = raw.trunc();

            if value == band.min {
                if in_growth && i > 0 && values[i - 1].trunc() == band.min {
                    flags[i - 1] = false;
                }
                in_growth = true;
                flags[i] = true;
                run.clear();
                run.push(i);
                continue;
            }

            if !in_growth {
                continue;
            }

            // A run is only ever open after its first row, so i > 0 here
            let previous = values[i - 1];
            if value < previous {
                if previous - value <= self.tolerance {
                    flags[i] = true;
                    run.push(i);
                } else {
                    run.drain(..).for_each(|r| flags[r] = false);
                    in_growth = false;
                }
            } else if value >= band.min && value <= band.max {
                flags[i] = true;
                run.push(i);
                if value == band.max {
                    in_growth = false;
                    run.clear();
                }
            } else if value > band.max {
                in_growth = false;
                run.clear();
            }
        }

        flags
    }

    /// Stages over a set of equally long columns, each with its own band
    pub fn find_in_columns(&self, columns: &[(&[f64], Band)]) -> Vec<Stage> {
        let Some(rows) = columns.first().map(|(values, _)| values.len()) else {
            return Vec::new();
        };

        let mut combined = vec![true; rows];
        for (values, band) in columns {
            let flags = self.growth_flags(values, *band);
            for (c, f) in combined.iter_mut().zip(flags) {
                *c &= f;
            }
        }

        stages_from_flags(&combined)
    }

    /// Stages of a table where every filtered signal grows through its band
    pub fn find_stages(&self, table: &RasterTable, filters: &BTreeMap<String, Band>) -> Result<Vec<Stage>> {
        if filters.is_empty() {
            let rows = table.row_count();
            return Ok(if rows == 0 { Vec::new() } else { vec![Stage::new(0, rows - 1)] });
        }

        let columns = filters
            .iter()
            .map(|(name, band)| {
                table
                    .column(name)
                    .map(|values| (values, *band))
                    .ok_or_else(|| PipelineError::MissingColumn(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self.find_in_columns(&columns))
    }
}

/// Stages of a table using the default drop tolerance
pub fn find_stages(table: &RasterTable, filters: &BTreeMap<String, Band>) -> Result<Vec<Stage>> {
    StageDetector::default().find_stages(table, filters)
}

/// Contiguous runs of `true` as inclusive row ranges
pub fn stages_from_flags(flags: &[bool]) -> Vec<Stage> {
    let mut stages = Vec::new();
    let mut start: Option<usize> = None;

    for (i, &flag) in flags.iter().enumerate() {
        match (flag, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                stages.push(Stage::new(s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        stages.push(Stage::new(s, flags.len() - 1));
    }

    stages
}
