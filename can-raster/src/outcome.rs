//! Per-file outcomes and the run summary
//!
//! Decode failures are counted, never propagated: each frame that cannot be
//! decoded bumps a `DecodeErrorKind` counter in the file's taxonomy. A unit's
//! result is a `FileOutcome`; the orchestrator folds all of them into a
//! `RunSummary`.

use crate::config::SizeTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Longest diagnostic kept on a failed outcome
pub const MAX_DIAGNOSTIC_CHARS: usize = 500;

/// Why a single frame produced no values
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DecodeErrorKind {
    /// Identifier not defined in the database
    UnknownMessage,
    /// Multiplexer value selects no defined signal group
    MultiplexerMismatch,
    /// Payload shorter than a signal's bit range
    MalformedPayload,
}

impl DecodeErrorKind {
    /// Explanation shown in the run report
    pub fn hint(self) -> &'static str {
        match self {
            DecodeErrorKind::UnknownMessage => "message identifier is not defined in the DBC file",
            DecodeErrorKind::MultiplexerMismatch => {
                "multiplexer value in the data matches no group defined in the DBC file"
            }
            DecodeErrorKind::MalformedPayload => "payload is shorter than the signal layout requires",
        }
    }
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeErrorKind::UnknownMessage => "UnknownMessage",
            DecodeErrorKind::MultiplexerMismatch => "MultiplexerMismatch",
            DecodeErrorKind::MalformedPayload => "MalformedPayload",
        };
        f.write_str(name)
    }
}

/// Error kind -> frame count
pub type ErrorTaxonomy = BTreeMap<DecodeErrorKind, u64>;

/// Counters gathered while decoding one log file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodeStats {
    /// Frames read from the log
    pub total_frames: u64,
    /// Frames that produced at least one value
    pub decoded_frames: u64,
    /// Frames that produced nothing
    pub error_count: u64,
    /// Breakdown of `error_count` by kind
    pub error_taxonomy: ErrorTaxonomy,
    /// Signals with at least one sample
    pub signal_count: usize,
    /// Samples kept across all signals
    pub data_points: u64,
}

impl DecodeStats {
    /// Count one undecodable frame
    pub fn record_error(&mut self, kind: DecodeErrorKind) {
        self.error_count += 1;
        *self.error_taxonomy.entry(kind).or_insert(0) += 1;
    }

    /// Estimated memory of the accumulated series (16 bytes per sample)
    pub fn estimated_memory_mb(&self) -> f64 {
        (self.data_points * 16) as f64 / 1024.0 / 1024.0
    }
}

/// Result of one work unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOutcome {
    /// Log file name (no directory)
    pub file_name: String,
    /// Database file name the log was decoded with
    pub database: String,
    pub total_frames: u64,
    pub decoded_frames: u64,
    pub error_count: u64,
    pub error_taxonomy: ErrorTaxonomy,
    pub signal_count: usize,
    pub data_points: u64,
    pub estimated_memory_mb: f64,
    pub size_tier: SizeTier,
    pub success: bool,
    /// One-line failure reason
    pub error: Option<String>,
    /// Extra failure detail, at most `MAX_DIAGNOSTIC_CHARS` characters
    pub diagnostic: Option<String>,
    /// Formats whose primary and fallback save both failed
    pub save_warnings: Vec<String>,
    /// Files written
    pub outputs: Vec<PathBuf>,
    /// Wall time spent on the unit, in seconds
    pub elapsed_secs: f64,
}

impl FileOutcome {
    /// Blank outcome for a unit that has not run yet
    pub fn new(file_name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Copy decode counters into the outcome
    pub fn apply_stats(&mut self, stats: &DecodeStats) {
        self.total_frames = stats.total_frames;
        self.decoded_frames = stats.decoded_frames;
        self.error_count = stats.error_count;
        self.error_taxonomy = stats.error_taxonomy.clone();
        self.signal_count = stats.signal_count;
        self.data_points = stats.data_points;
        self.estimated_memory_mb = stats.estimated_memory_mb();
    }

    /// Mark the outcome failed
    pub fn fail(&mut self, error: impl fmt::Display) {
        self.success = false;
        self.error = Some(error.to_string());
    }

    /// Mark the outcome failed with a diagnostic trail
    pub fn fail_with_diagnostic(&mut self, error: impl fmt::Display, diagnostic: &str) {
        self.fail(error);
        self.diagnostic = Some(truncate_diagnostic(diagnostic));
    }
}

/// Keep the last `MAX_DIAGNOSTIC_CHARS` characters of a diagnostic
pub fn truncate_diagnostic(text: &str) -> String {
    let count = text.chars().count();
    if count <= MAX_DIAGNOSTIC_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - MAX_DIAGNOSTIC_CHARS).collect()
    }
}

/// Aggregate over all outcomes of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Outcomes in completion order
    pub outcomes: Vec<FileOutcome>,
    pub success_count: usize,
    pub failed_count: usize,
    pub total_frames: u64,
    pub decoded_frames: u64,
    pub error_count: u64,
    pub data_points: u64,
    /// Taxonomies of every outcome merged
    pub error_taxonomy: ErrorTaxonomy,
    /// True if the run was cut short by the cancel flag
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Fold outcomes into a summary
    pub fn from_outcomes(
        outcomes: Vec<FileOutcome>,
        started_at: DateTime<Utc>,
        interrupted: bool,
    ) -> Self {
        let success_count = outcomes.iter().filter(|o| o.success).count();
        let mut error_taxonomy = ErrorTaxonomy::new();
        for outcome in &outcomes {
            for (kind, count) in &outcome.error_taxonomy {
                *error_taxonomy.entry(*kind).or_insert(0) += count;
            }
        }

        Self {
            success_count,
            failed_count: outcomes.len() - success_count,
            total_frames: outcomes.iter().map(|o| o.total_frames).sum(),
            decoded_frames: outcomes.iter().map(|o| o.decoded_frames).sum(),
            error_count: outcomes.iter().map(|o| o.error_count).sum(),
            data_points: outcomes.iter().map(|o| o.data_points).sum(),
            error_taxonomy,
            interrupted,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        }
    }

    /// Number of work units that ran
    pub fn file_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Decoded frames as a percentage of all frames
    pub fn decode_rate(&self) -> f64 {
        percentage(self.decoded_frames, self.total_frames)
    }

    /// Error kinds sorted by count, largest first
    pub fn taxonomy_by_count(&self) -> Vec<(DecodeErrorKind, u64)> {
        let mut entries: Vec<_> = self.error_taxonomy.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
    }

    /// Outcomes with at least one save warning
    pub fn save_warnings(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.save_warnings.is_empty())
    }
}

/// `part / whole` in percent, 0 when `whole` is 0
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
