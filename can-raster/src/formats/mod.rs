//! Log file format readers (BLF, ASC)
//!
//! Each reader is an iterator over `Frame`s in file order.

use crate::types::{FileKind, Frame, Result};
use std::path::Path;

pub mod asc;
pub mod blf;

pub use asc::{AscFrameIterator, AscParser};
pub use blf::{BlfFrameIterator, BlfParser};

/// Common trait for all log file readers
pub trait LogFileParser: Iterator<Item = Result<Frame>> + Sized {
    /// Open a log file and return an iterator over its frames
    fn parse(path: &Path) -> Result<Self>;
}

impl LogFileParser for BlfFrameIterator {
    fn parse(path: &Path) -> Result<Self> {
        BlfParser::parse(path)
    }
}

impl LogFileParser for AscFrameIterator {
    fn parse(path: &Path) -> Result<Self> {
        AscParser::parse(path)
    }
}

/// Frame stream of any supported container
pub type FrameStream = Box<dyn Iterator<Item = Result<Frame>>>;

/// Open a log file with the reader matching its kind
pub fn open_log(path: &Path, kind: FileKind) -> Result<FrameStream> {
    Ok(match kind {
        FileKind::Blf => Box::new(BlfFrameIterator::parse(path)?),
        FileKind::Asc => Box::new(AscFrameIterator::parse(path)?),
    })
}
