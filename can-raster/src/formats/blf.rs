//! BLF (Binary Log Format) file reader
//!
//! Reads Vector BLF files using the `ablf` crate. Only CAN message objects
//! (type 86) carry frames; log containers (type 10) are unpacked by `ablf`
//! and every other object type is skipped.
//!
//! Object timestamps are stored either in 10 µs or in 1 ns units, selected by
//! the object header flags.

use crate::types::{Frame, PipelineError, Result, CAN_ID_MASK};
use ablf::{BlfFile, ObjectTypes};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Object header flag: timestamp unit is 10 µs
const TIME_TEN_MICS: u32 = 0x01;

/// Extended-identifier flag carried in the raw BLF CAN ID
const BLF_EXTENDED_ID: u32 = 0x8000_0000;

/// CAN message flag bits
const MSG_FLAG_EXTENDED: u32 = 0x02;
const MSG_FLAG_FD: u32 = 0x80;

/// Build a frame from the raw fields of a CAN message object
fn message_frame(timestamp: f64, channel: u16, raw_id: u32, flags: u32, data: Vec<u8>) -> Frame {
    Frame {
        timestamp,
        channel: channel as u8,
        can_id: raw_id & CAN_ID_MASK,
        is_extended: (raw_id & BLF_EXTENDED_ID) != 0 || (flags & MSG_FLAG_EXTENDED) != 0,
        is_fd: (flags & MSG_FLAG_FD) != 0,
        data,
    }
}

/// BLF file parser using ablf crate
pub struct BlfParser;

impl BlfParser {
    /// Open a BLF file and return an iterator over its CAN frames
    pub fn parse(path: &Path) -> Result<BlfFrameIterator> {
        log::info!("Parsing BLF file: {:?}", path);

        let file = File::open(path).map_err(|e| {
            PipelineError::LogParse(format!("Failed to open BLF file {:?}: {}", path, e))
        })?;

        let blf = BlfFile::from_reader(BufReader::new(file)).map_err(|(e, _)| {
            PipelineError::LogParse(format!("Failed to parse BLF file {:?}: {}", path, e))
        })?;

        if !blf.is_valid() {
            return Err(PipelineError::LogParse(format!(
                "Invalid BLF file format: {:?}",
                path
            )));
        }

        Ok(BlfFrameIterator {
            objects: blf.into_iter(),
            skipped_types: HashSet::new(),
        })
    }
}

/// Iterator over CAN frames from a BLF file
pub struct BlfFrameIterator {
    objects: ablf::ObjectIterator<BufReader<File>>,
    skipped_types: HashSet<u32>,
}

impl Iterator for BlfFrameIterator {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let obj = self.objects.next()?;
            match obj.data {
                ObjectTypes::CanMessage86(msg) => {
                    let scale = if msg.header.flags & TIME_TEN_MICS != 0 {
                        1e-5
                    } else {
                        1e-9
                    };
                    return Some(Ok(message_frame(
                        msg.header.timestamp_ns as f64 * scale,
                        msg.channel.into(),
                        msg.id,
                        msg.flags.into(),
                        msg.data,
                    )));
                }
                _ => {
                    if self.skipped_types.insert(obj.object_type) {
                        log::debug!(
                            "Skipping BLF object type {} (size {} bytes)",
                            obj.object_type,
                            obj.object_size
                        );
                    }
                    continue;
                }
            }
        }
    }
}
