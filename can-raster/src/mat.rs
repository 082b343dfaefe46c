//! MATLAB level 5 MAT-file output
//!
//! Every vector is stored as a `1 x n` double matrix. With compression on,
//! each matrix element is wrapped in a zlib `miCOMPRESSED` element.

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;
use miniz_oxide::deflate::compress_to_vec_zlib;
use std::io::{self, Write};

const HEADER_TEXT_LEN: usize = 116;
const MAT_VERSION: u16 = 0x0100;

const MI_INT8: u32 = 1;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_DOUBLE: u32 = 9;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

const MX_DOUBLE_CLASS: u32 = 6;

const ZLIB_LEVEL: u8 = 6;

/// Streaming writer for named double vectors
pub struct MatWriter<W: Write> {
    inner: W,
    compress: bool,
}

impl<W: Write> MatWriter<W> {
    /// Write the 128-byte file header
    pub fn new(mut inner: W, compress: bool) -> io::Result<Self> {
        write_header(&mut inner)?;
        Ok(Self { inner, compress })
    }

    /// Append one variable
    pub fn write_vector(&mut self, name: &str, values: &[f64]) -> io::Result<()> {
        let matrix = matrix_element(name, values)?;
        if self.compress {
            let packed = compress_to_vec_zlib(&matrix, ZLIB_LEVEL);
            write_tag(&mut self.inner, MI_COMPRESSED, packed.len())?;
            self.inner.write_all(&packed)
        } else {
            self.inner.write_all(&matrix)
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Turn a signal name into a valid MATLAB identifier
///
/// Characters outside `[A-Za-z0-9_]` become `_`; names not starting with a
/// letter get an `x` prefix.
pub fn variable_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic()) {
        out.insert(0, 'x');
    }
    out
}

fn write_header<W: Write>(out: &mut W) -> io::Result<()> {
    let text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created on: {}",
        std::env::consts::OS,
        Utc::now().format("%a %b %e %H:%M:%S %Y")
    );
    let mut header = [b' '; HEADER_TEXT_LEN];
    let len = text.len().min(HEADER_TEXT_LEN);
    header[..len].copy_from_slice(&text.as_bytes()[..len]);

    out.write_all(&header)?;
    // Subsystem data offset, unused
    out.write_all(&[0u8; 8])?;
    out.write_u16::<LittleEndian>(MAT_VERSION)?;
    out.write_all(b"IM")
}

fn element_size(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("MAT element of {} bytes exceeds the 4 GiB limit", len),
        )
    })
}

fn write_tag<W: Write>(out: &mut W, data_type: u32, len: usize) -> io::Result<()> {
    out.write_u32::<LittleEndian>(data_type)?;
    out.write_u32::<LittleEndian>(element_size(len)?)
}

fn pad_to_8(buf: &mut Vec<u8>) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}

fn matrix_element(name: &str, values: &[f64]) -> io::Result<Vec<u8>> {
    let columns = i32::try_from(values.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many rows for a MAT vector"))?;
    let data_len = values.len().saturating_mul(8);

    let mut body = Vec::with_capacity(48 + name.len() + data_len);

    write_tag(&mut body, MI_UINT32, 8)?;
    body.write_u32::<LittleEndian>(MX_DOUBLE_CLASS)?;
    body.write_u32::<LittleEndian>(0)?;

    write_tag(&mut body, MI_INT32, 8)?;
    body.write_i32::<LittleEndian>(1)?;
    body.write_i32::<LittleEndian>(columns)?;

    write_tag(&mut body, MI_INT8, name.len())?;
    body.extend_from_slice(name.as_bytes());
    pad_to_8(&mut body);

    write_tag(&mut body, MI_DOUBLE, data_len)?;
    for value in values {
        body.write_f64::<LittleEndian>(*value)?;
    }

    let mut element = Vec::with_capacity(body.len() + 8);
    write_tag(&mut element, MI_MATRIX, body.len())?;
    element.extend_from_slice(&body);
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ByteOrder;
    use miniz_oxide::inflate::decompress_to_vec_zlib;

    fn write(compress: bool) -> Vec<u8> {
        let mut mat = MatWriter::new(Vec::new(), compress).unwrap();
        mat.write_vector("Speed", &[1.0, f64::NAN, 3.5]).unwrap();
        mat.finish().unwrap()
    }

    #[test]
    fn test_header() {
        let bytes = write(false);
        assert!(bytes.starts_with(b"MATLAB 5.0 MAT-file"));
        assert_eq!(LittleEndian::read_u16(&bytes[124..126]), 0x0100);
        assert_eq!(&bytes[126..128], b"IM");
    }

    #[test]
    fn test_uncompressed_matrix_layout() {
        let bytes = write(false);
        let element = &bytes[128..];
        assert_eq!(LittleEndian::read_u32(&element[0..4]), MI_MATRIX);
        assert_eq!(LittleEndian::read_u32(&element[4..8]) as usize, element.len() - 8);

        // Flags, dims, name, data
        assert_eq!(LittleEndian::read_u32(&element[16..20]), MX_DOUBLE_CLASS);
        assert_eq!(LittleEndian::read_i32(&element[32..36]), 1);
        assert_eq!(LittleEndian::read_i32(&element[36..40]), 3);
        assert_eq!(LittleEndian::read_u32(&element[44..48]), 5);
        assert_eq!(&element[48..53], b"Speed");
        assert_eq!(LittleEndian::read_u32(&element[56..60]), MI_DOUBLE);
        assert_eq!(LittleEndian::read_u32(&element[60..64]), 24);
        assert_eq!(LittleEndian::read_f64(&element[64..72]), 1.0);
        assert!(LittleEndian::read_f64(&element[72..80]).is_nan());
        assert_eq!(LittleEndian::read_f64(&element[80..88]), 3.5);
        assert_eq!(element.len(), 88);
    }

    #[test]
    fn test_compressed_matches_plain() {
        let plain = write(false);
        let packed = write(true);
        let element = &packed[128..];
        assert_eq!(LittleEndian::read_u32(&element[0..4]), MI_COMPRESSED);
        let len = LittleEndian::read_u32(&element[4..8]) as usize;
        assert_eq!(element.len(), len + 8);

        let inflated = decompress_to_vec_zlib(&element[8..]).unwrap();
        assert_eq!(inflated, &plain[128..]);
    }

    #[test]
    fn test_variable_name() {
        assert_eq!(variable_name("WhlSpdFL_122"), "WhlSpdFL_122");
        assert_eq!(variable_name("Engine.Speed"), "Engine_Speed");
        assert_eq!(variable_name("1st"), "x1st");
        assert_eq!(variable_name("_hidden"), "x_hidden");
    }
}
