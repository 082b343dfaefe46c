//! Core types shared by the decode pipeline
//!
//! Frames as read from a log container, the log container kinds the pipeline
//! understands, and the error type every fallible operation returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Mask selecting the identifier bits of a CAN ID (drops the extended-frame flag)
pub const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

/// Raw CAN frame from a log file (BLF, ASC)
///
/// Frames are yielded in file order and never reordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Timestamp in seconds, as recorded in the log
    pub timestamp: f64,
    /// CAN channel number (e.g., 1, 2...)
    pub channel: u8,
    /// CAN message ID (11-bit or 29-bit, extended flag stripped)
    pub can_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
}

impl Frame {
    /// Get the data length - number of payload bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

/// Log container kinds, detected from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Vector binary logging format (.blf)
    Blf,
    /// Vector ASCII trace (.asc)
    Asc,
}

impl FileKind {
    /// Classify a path by its extension (case-insensitive)
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());

        match extension.as_deref() {
            Some("blf") => Some(FileKind::Blf),
            Some("asc") => Some(FileKind::Asc),
            _ => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Blf => write!(f, "BLF"),
            FileKind::Asc => write!(f, "ASC"),
        }
    }
}

/// Errors that can occur while planning, decoding, resampling or saving
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No work units: no log files found for the configured databases")]
    NoWorkUnits,

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Failed to parse log file: {0}")]
    LogParse(String),

    #[error("No valid signals decoded")]
    NoSignals,

    #[error("Out of memory while building the raster table (estimated {estimated_mb:.0} MB). Suggestions: 1) increase step to {suggested_step:.3} or more 2) restrict signal_names 3) reduce workers to 1")]
    ResourceExhausted {
        /// Estimated size of the allocation that failed
        estimated_mb: f64,
        /// A step value that would shrink the table five-fold
        suggested_step: f64,
    },

    #[error("Failed to save {format}: {message}")]
    Save { format: String, message: String },

    #[error("all output formats failed to save")]
    AllSavesFailed,

    #[error("Invalid table: {0}")]
    Table(String),

    #[error("Column not found: {0}")]
    MissingColumn(String),

    #[error("interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
