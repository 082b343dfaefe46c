//! Driving-condition metrics
//!
//! Decoded CSV tables are grouped by condition labels taken from their file
//! names, split into stages with the stage detector, and reduced to one
//! `StageMetrics` record per stage:
//!
//! - net change (last minus first) of the tracked signals
//! - the first wheel-slip point: stages of the rear-minus-front wheel speed
//!   divergence are detected inside the stage, and the row nearest the middle
//!   of the first one is taken; at that row the slip time, the motor speed
//!   difference and the largest wheel speed are recorded
//! - the operating point nearest the stage mean of the driver input

use crate::raster::RasterTable;
use crate::stages::{Band, Stage, StageDetector, DEFAULT_DROP_TOLERANCE};
use crate::types::{PipelineError, Result};
use crate::writer::{read_csv_table, TIME_COLUMN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Signal names, bands and grouping keywords for the metrics pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Signals that must grow through their band for a stage
    pub stage_filters: BTreeMap<String, Band>,
    /// Signals whose net change over a stage is reported
    pub change_signals: Vec<String>,
    pub front_wheels: Vec<String>,
    pub rear_wheels: Vec<String>,
    /// Wheels whose largest speed is reported at the slip point
    pub wheel_group: Vec<String>,
    pub front_motor: String,
    pub rear_motor: String,
    /// Signal averaged over the stage to pick the operating point
    pub driver_input: String,
    pub operating_points: Vec<f64>,
    /// Keyword axes; each combination of one keyword per axis is a group
    pub keywords: Vec<Vec<String>>,
    /// Column holding the time of each row
    pub time_column: String,
    pub drop_tolerance: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let strings = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let mut stage_filters = BTreeMap::new();
        stage_filters.insert("AccPdlPosn_342".to_string(), Band::new(0.0, 40.0));

        Self {
            stage_filters,
            change_signals: strings(&["LWSAngle_11F"]),
            front_wheels: strings(&["WhlSpdFL_122", "WhlSpdFR_122"]),
            rear_wheels: strings(&["WhlSpdRL_122", "WhlSpdRR_122"]),
            wheel_group: strings(&["WhlSpdFL_122", "WhlSpdFR_122", "WhlSpdRL_122", "WhlSpdRR_122"]),
            front_motor: "FMSpd_242".to_string(),
            rear_motor: "RMSpd_250".to_string(),
            driver_input: "AccPdlPosn_342".to_string(),
            operating_points: vec![20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0],
            keywords: vec![
                strings(&["on", "off"]),
                strings(&["冰", "雪"]),
                strings(&["eco", "sport"]),
            ],
            time_column: TIME_COLUMN.to_string(),
            drop_tolerance: DEFAULT_DROP_TOLERANCE,
        }
    }
}

/// Values at the first wheel-slip point of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlipMetrics {
    /// Time of the slip row
    pub slip_first_time: f64,
    /// Front minus rear motor speed at the slip row
    pub monitor_diff: f64,
    /// Largest wheel speed at the slip row
    #[serde(rename = "slip_WhlSpd")]
    pub slip_whl_spd: f64,
}

/// Metrics of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Source file name
    pub file: String,
    #[serde(flatten)]
    pub stage: Stage,
    /// `<signal>_change` -> last minus first value
    pub changes: BTreeMap<String, f64>,
    pub slip: Option<SlipMetrics>,
    /// Operating point nearest the mean driver input
    pub throttle: Option<f64>,
}

/// A file left out of the metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

/// Metrics per condition group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedMetrics {
    /// Every condition group, including those without matching files
    pub groups: BTreeMap<String, Vec<StageMetrics>>,
    pub skipped: Vec<SkippedFile>,
}

impl GroupedMetrics {
    /// Total number of stage records
    pub fn stage_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// Condition groups as `(label, keywords)`, in cartesian-product order
pub fn condition_groups(keywords: &[Vec<String>]) -> Vec<(String, Vec<String>)> {
    let mut combos: Vec<Vec<String>> = vec![Vec::new()];
    for axis in keywords {
        combos = combos
            .iter()
            .flat_map(|prefix| {
                axis.iter().map(move |word| {
                    let mut combo = prefix.clone();
                    combo.push(word.clone());
                    combo
                })
            })
            .collect();
    }

    combos
        .into_iter()
        .filter(|combo| !combo.is_empty())
        .map(|combo| (combo.join("_"), combo))
        .collect()
}

/// First group whose keywords all occur in the lower-cased file name
pub fn match_condition<'a>(file_name: &str, groups: &'a [(String, Vec<String>)]) -> Option<&'a str> {
    let lower = file_name.to_lowercase();
    groups
        .iter()
        .find(|(_, words)| words.iter().all(|w| lower.contains(&w.to_lowercase())))
        .map(|(label, _)| label.as_str())
}

/// Metrics of every stage in one table
pub fn compute_file_metrics(table: &RasterTable, file: &str, config: &MetricsConfig) -> Result<Vec<StageMetrics>> {
    let detector = StageDetector::new().with_tolerance(config.drop_tolerance);
    let stages = detector.find_stages(table, &config.stage_filters)?;

    log::debug!("{}: {} stages", file, stages.len());

    Ok(stages
        .into_iter()
        .map(|stage| compute_stage_metrics(table, stage, file, config))
        .collect())
}

/// Metrics of one stage
pub fn compute_stage_metrics(table: &RasterTable, stage: Stage, file: &str, config: &MetricsConfig) -> StageMetrics {
    let mut changes = BTreeMap::new();
    for name in &config.change_signals {
        match table.column(name) {
            Some(values) => {
                let rows = stage.slice(values);
                changes.insert(format!("{}_change", name), rows[rows.len() - 1] - rows[0]);
            }
            None => log::debug!("{}: change signal '{}' not in table", file, name),
        }
    }

    let throttle = table
        .column(&config.driver_input)
        .and_then(|values| nan_mean(stage.slice(values)))
        .and_then(|mean| nearest_point(mean, &config.operating_points));

    StageMetrics {
        file: file.to_string(),
        stage,
        changes,
        slip: slip_metrics(table, stage, config),
        throttle,
    }
}

fn slip_metrics(table: &RasterTable, stage: Stage, config: &MetricsConfig) -> Option<SlipMetrics> {
    let column = |name: &String| table.column(name).map(|values| stage.slice(values));
    let group = |names: &[String]| names.iter().map(column).collect::<Option<Vec<_>>>();

    let front = group(&config.front_wheels)?;
    let rear = group(&config.rear_wheels)?;
    let wheels = group(&config.wheel_group)?;
    let front_motor = column(&config.front_motor)?;
    let rear_motor = column(&config.rear_motor)?;
    let times = stage.slice(time_values(table, config));

    let divergence = (0..stage.len())
        .map(|row| Some(row_mean(&rear, row)? - row_mean(&front, row)?))
        .collect::<Option<Vec<f64>>>()?;

    let detector = StageDetector::new().with_tolerance(config.drop_tolerance);
    let first = *detector
        .find_in_columns(&[(&divergence, Band::unbounded_above(0.0))])
        .first()?;

    let midpoint = (times[first.start_index] + times[first.end_index]) / 2.0;
    let row = nearest_row(times, midpoint)?;

    Some(SlipMetrics {
        slip_first_time: times[row],
        monitor_diff: front_motor[row] - rear_motor[row],
        slip_whl_spd: wheels
            .iter()
            .map(|w| w[row])
            .filter(|v| !v.is_nan())
            .fold(f64::NAN, f64::max),
    })
}

fn time_values<'a>(table: &'a RasterTable, config: &MetricsConfig) -> &'a [f64] {
    table.column(&config.time_column).unwrap_or(table.time())
}

/// Mean across columns at one row; `None` for an empty group
fn row_mean(columns: &[&[f64]], row: usize) -> Option<f64> {
    if columns.is_empty() {
        return None;
    }
    Some(columns.iter().map(|c| c[row]).sum::<f64>() / columns.len() as f64)
}

fn nan_mean(values: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Candidate nearest to `value`; ties go to the earlier candidate
fn nearest_point(value: f64, candidates: &[f64]) -> Option<f64> {
    candidates
        .iter()
        .copied()
        .fold(None, |best: Option<f64>, c| match best {
            Some(b) if (b - value).abs() <= (c - value).abs() => Some(b),
            _ => Some(c),
        })
}

/// First row whose time is nearest to `target`
fn nearest_row(times: &[f64], target: f64) -> Option<usize> {
    times
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, t)| {
            let distance = (t - target).abs();
            match best {
                Some((_, d)) if d <= distance => best,
                _ => Some((i, distance)),
            }
        })
        .map(|(i, _)| i)
}

/// CSV tables at a path: the file itself, or every `*.csv` in a directory
pub fn discover_tables(source: &Path) -> Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    if !source.is_dir() {
        return Err(PipelineError::Config(format!(
            "metrics source not found: {:?}",
            source
        )));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(source)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Group the tables at `source` by condition and compute their stage metrics
pub fn compute_grouped_metrics(source: &Path, config: &MetricsConfig) -> Result<GroupedMetrics> {
    let groups = condition_groups(&config.keywords);
    let mut result = GroupedMetrics {
        groups: groups
            .iter()
            .map(|(label, _)| (label.clone(), Vec::new()))
            .collect(),
        skipped: Vec::new(),
    };

    for path in discover_tables(source)? {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(label) = match_condition(&file, &groups) else {
            log::info!("{}: no condition group matches, skipped", file);
            result.skipped.push(SkippedFile {
                file,
                reason: "no condition group matches the file name".to_string(),
            });
            continue;
        };

        let metrics = read_csv_table(&path).and_then(|table| compute_file_metrics(&table, &file, config));
        match metrics {
            Ok(metrics) => {
                log::info!("{}: {} stages in group {}", file, metrics.len(), label);
                if let Some(records) = result.groups.get_mut(label) {
                    records.extend(metrics);
                }
            }
            Err(e) => {
                log::warn!("{}: {}", file, e);
                result.skipped.push(SkippedFile {
                    file,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Column;

    fn words(list: &[&[&str]]) -> Vec<Vec<String>> {
        list.iter()
            .map(|axis| axis.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_condition_groups_order() {
        let groups = condition_groups(&words(&[&["on", "off"], &["eco", "sport"]]));
        let labels: Vec<&str> = groups.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["on_eco", "on_sport", "off_eco", "off_sport"]);
    }

    #[test]
    fn test_match_condition() {
        let groups = condition_groups(&MetricsConfig::default().keywords);
        assert_eq!(match_condition("Off_冰_Eco_01.csv", &groups), Some("off_冰_eco"));
        assert_eq!(match_condition("ON_雪_SPORT.csv", &groups), Some("on_雪_sport"));
        assert_eq!(match_condition("highway.csv", &groups), None);
    }

    #[test]
    fn test_nearest_point_prefers_smaller_on_tie() {
        let points = MetricsConfig::default().operating_points;
        assert_eq!(nearest_point(25.0, &points), Some(20.0));
        assert_eq!(nearest_point(27.0, &points), Some(30.0));
        assert_eq!(nearest_point(500.0, &points), Some(100.0));
        assert_eq!(nearest_point(1.0, &[]), None);
    }

    #[test]
    fn test_nearest_row() {
        assert_eq!(nearest_row(&[0.0, 0.1, 0.2, 0.3], 0.15), Some(1));
        assert_eq!(nearest_row(&[0.0, 0.1, 0.2, 0.3], 0.26), Some(3));
        assert_eq!(nearest_row(&[], 0.0), None);
    }

    fn column(name: &str, values: &[f64]) -> Column {
        Column {
            name: name.to_string(),
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_stage_metrics() {
        let time = vec![0.0, 0.1, 0.2, 0.3, 0.5];
        let table = RasterTable::new(
            time.clone(),
            vec![
                column("timestamps", &time),
                column("AccPdlPosn_342", &[0.0, 10.0, 20.0, 30.0, 40.0]),
                column("LWSAngle_11F", &[1.0, 2.0, 3.0, 4.0, 6.0]),
                column("WhlSpdFL_122", &[10.0, 10.0, 10.0, 10.0, 10.0]),
                column("WhlSpdFR_122", &[10.0, 10.0, 10.0, 10.0, 10.0]),
                column("WhlSpdRL_122", &[20.0, 10.0, 11.0, 13.0, 14.0]),
                column("WhlSpdRR_122", &[20.0, 10.0, 11.0, 13.0, 16.0]),
                column("FMSpd_242", &[100.0, 100.0, 100.0, 150.0, 100.0]),
                column("RMSpd_250", &[90.0, 90.0, 90.0, 100.0, 90.0]),
            ],
        )
        .unwrap();

        let metrics = compute_file_metrics(&table, "on_冰_eco.csv", &MetricsConfig::default()).unwrap();
        assert_eq!(metrics.len(), 1);

        let m = &metrics[0];
        assert_eq!(m.stage, Stage::new(0, 4));
        assert_eq!(m.changes["LWSAngle_11F_change"], 5.0);
        assert_eq!(m.throttle, Some(20.0));

        // Divergence [10, 0, 1, 3, 5]: growth from row 1 to 4, midpoint 0.3 -> row 3
        let slip = m.slip.as_ref().unwrap();
        assert_eq!(slip.slip_first_time, 0.3);
        assert_eq!(slip.monitor_diff, 50.0);
        assert_eq!(slip.slip_whl_spd, 13.0);
    }

    #[test]
    fn test_empty_wheel_group_skips_slip() {
        let table = RasterTable::new(
            vec![0.0, 0.1, 0.2],
            vec![
                column("AccPdlPosn_342", &[0.0, 20.0, 40.0]),
                column("WhlSpdRL_122", &[10.0, 11.0, 12.0]),
                column("WhlSpdRR_122", &[10.0, 11.0, 12.0]),
                column("FMSpd_242", &[100.0, 100.0, 100.0]),
                column("RMSpd_250", &[90.0, 90.0, 90.0]),
            ],
        )
        .unwrap();
        let config = MetricsConfig {
            front_wheels: Vec::new(),
            ..MetricsConfig::default()
        };

        let metrics = compute_file_metrics(&table, "x.csv", &config).unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].slip.is_none());
        assert_eq!(row_mean(&[], 0), None);
        let rear: [&[f64]; 2] = [&[1.0, 2.0], &[3.0, 4.0]];
        assert_eq!(row_mean(&rear, 1), Some(3.0));
    }

    #[test]
    fn test_missing_slip_columns() {
        let table = RasterTable::new(
            vec![0.0, 0.1],
            vec![column("AccPdlPosn_342", &[0.0, 40.0])],
        )
        .unwrap();

        let metrics = compute_file_metrics(&table, "x.csv", &MetricsConfig::default()).unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].slip.is_none());
        assert!(metrics[0].changes.is_empty());
        assert_eq!(metrics[0].throttle, Some(20.0));
    }

    #[test]
    fn test_missing_stage_column() {
        let table = RasterTable::new(vec![0.0], vec![column("Other", &[0.0])]).unwrap();
        let err = compute_file_metrics(&table, "x.csv", &MetricsConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn(_)));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{ "stage_filters": { "Pedal": [0, 60] }, "operating_points": [10, 20] }"#;
        let config: MetricsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stage_filters["Pedal"], Band::new(0.0, 60.0));
        assert_eq!(config.operating_points, vec![10.0, 20.0]);
        assert_eq!(config.driver_input, "AccPdlPosn_342");
    }
}
