//! ASC (Vector ASCII trace) file reader
//!
//! Understands the `base hex|dec` and `timestamps absolute|relative` header
//! keywords, classic CAN data lines and CAN FD lines:
//!
//! ```text
//! 0.010000 1  122             Rx   d 8 10 27 00 00 00 00 00 00
//! 0.020000 2  18FEF100x       Tx   d 8 00 11 22 33 44 55 66 77
//! 0.030000 CANFD 1 Rx 342 AccPedal 1 0 a 12 01 02 03 04 05 06 07 08 09 0a 0b 0c
//! ```
//!
//! Remote frames, error frames, statistics and every other event are skipped.

use crate::types::{Frame, PipelineError, Result, CAN_ID_MASK};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// ASC file parser
pub struct AscParser;

impl AscParser {
    /// Open an ASC file and return an iterator over its CAN frames
    pub fn parse(path: &Path) -> Result<AscFrameIterator> {
        log::info!("Parsing ASC file: {:?}", path);

        let file = File::open(path).map_err(|e| {
            PipelineError::LogParse(format!("Failed to open ASC file {:?}: {}", path, e))
        })?;

        Ok(AscFrameIterator::new(BufReader::new(file)))
    }
}

/// Iterator over CAN frames from an ASC trace
pub struct AscFrameIterator {
    reader: Box<dyn BufRead>,
    buffer: Vec<u8>,
    line_no: usize,
    radix: u32,
    relative: bool,
    last_timestamp: f64,
}

impl AscFrameIterator {
    /// Read frames from any buffered source
    pub fn new(reader: impl BufRead + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            buffer: Vec::with_capacity(256),
            line_no: 0,
            radix: 16,
            relative: false,
            last_timestamp: 0.0,
        }
    }

    /// Apply header keywords; returns true if the line was a header line
    fn apply_header(&mut self, tokens: &[&str]) -> bool {
        match tokens.first().map(|t| t.to_ascii_lowercase()).as_deref() {
            Some("base") => {
                if let Some(base) = tokens.get(1) {
                    self.radix = if base.eq_ignore_ascii_case("dec") { 10 } else { 16 };
                }
                if let (Some(&"timestamps"), Some(mode)) = (tokens.get(2), tokens.get(3)) {
                    self.relative = mode.eq_ignore_ascii_case("relative");
                }
                true
            }
            Some("date") | Some("begin") | Some("end") | Some("//") => true,
            Some("no") | Some("internal") => true,
            _ => false,
        }
    }
}

impl Iterator for AscFrameIterator {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(PipelineError::LogParse(format!(
                        "Failed to read ASC line {}: {}",
                        self.line_no + 1,
                        e
                    ))))
                }
            }
            self.line_no += 1;

            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() || self.apply_header(&tokens) {
                continue;
            }

            let Some(mut frame) = parse_frame_line(&tokens, self.radix) else {
                log::trace!("ASC line {} skipped: {}", self.line_no, line.trim_end());
                continue;
            };

            if self.relative {
                frame.timestamp += self.last_timestamp;
            }
            self.last_timestamp = frame.timestamp;
            return Some(Ok(frame));
        }
    }
}

/// Parse one event line into a frame; None for anything that is not a data frame
fn parse_frame_line(tokens: &[&str], radix: u32) -> Option<Frame> {
    let timestamp: f64 = tokens.first()?.parse().ok()?;

    if tokens.get(1)?.eq_ignore_ascii_case("CANFD") {
        return parse_fd_line(timestamp, &tokens[2..], radix);
    }

    // <ch> <id>[x] <Rx|Tx> d <dlc> <bytes...>
    let channel: u8 = tokens.get(1)?.parse().ok()?;
    let (can_id, is_extended) = parse_id(tokens.get(2)?, radix)?;
    if !is_direction(tokens.get(3)?) || !tokens.get(4)?.eq_ignore_ascii_case("d") {
        return None;
    }
    let dlc = usize::from_str_radix(tokens.get(5)?, radix).ok()?.min(8);
    let data = parse_bytes(tokens.get(6..6 + dlc)?, radix)?;

    Some(Frame {
        timestamp,
        channel,
        can_id,
        data,
        is_extended,
        is_fd: false,
    })
}

/// `<ch> <dir> <id>[x] [name] <brs> <esi> <dlc> <data_len> <bytes...>`
fn parse_fd_line(timestamp: f64, tokens: &[&str], radix: u32) -> Option<Frame> {
    let channel: u8 = tokens.first()?.parse().ok()?;
    if !is_direction(tokens.get(1)?) {
        return None;
    }
    let (can_id, is_extended) = parse_id(tokens.get(2)?, radix)?;

    let mut idx = 3;
    if !matches!(*tokens.get(idx)?, "0" | "1") {
        idx += 1;
    }
    // brs, esi, dlc
    idx += 3;
    let data_len: usize = tokens.get(idx)?.parse().ok()?;
    idx += 1;
    let data = parse_bytes(tokens.get(idx..idx + data_len)?, radix)?;

    Some(Frame {
        timestamp,
        channel,
        can_id,
        data,
        is_extended,
        is_fd: true,
    })
}

fn is_direction(token: &str) -> bool {
    token.eq_ignore_ascii_case("Rx") || token.eq_ignore_ascii_case("Tx")
}

fn parse_id(token: &str, radix: u32) -> Option<(u32, bool)> {
    let (digits, is_extended) = match token.strip_suffix(&['x', 'X'][..]) {
        Some(digits) => (digits, true),
        None => (token, false),
    };
    let id = u32::from_str_radix(digits, radix).ok()?;
    Some((id & CAN_ID_MASK, is_extended))
}

fn parse_bytes(tokens: &[&str], radix: u32) -> Option<Vec<u8>> {
    tokens
        .iter()
        .map(|t| u8::from_str_radix(t, radix).ok())
        .collect()
}
