//! Table output
//!
//! Every requested format gets a primary save and, if that fails, one
//! fallback save. A warning is recorded only when both fail; the other
//! formats are still attempted.
//!
//! | format  | primary                              | fallback                 |
//! |---------|--------------------------------------|--------------------------|
//! | CSV     | `timestamps` index column, 1 MiB buffer | no index column       |
//! | Parquet | Snappy, `timestamps` index column    | uncompressed, no index   |
//! | MAT     | zlib-compressed variables            | uncompressed variables   |
//!
//! NaN cells are written as empty CSV fields and as Parquet nulls. MAT files
//! keep NaN and always carry the `timestamps` vector.

use crate::config::SaveFormat;
use crate::mat::{self, MatWriter};
use crate::raster::{Column, RasterTable};
use crate::types::{PipelineError, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the time index column
pub const TIME_COLUMN: &str = "timestamps";

const CSV_BUFFER_CAPACITY: usize = 1 << 20;

type SaveFn = fn(&RasterTable, &Path) -> Result<()>;

/// Primary and fallback save for one format
struct FormatWriter {
    primary: SaveFn,
    fallback: SaveFn,
}

fn format_writer(format: SaveFormat) -> FormatWriter {
    match format {
        SaveFormat::Csv => FormatWriter {
            primary: write_csv_indexed,
            fallback: write_csv_plain,
        },
        SaveFormat::Parquet => FormatWriter {
            primary: write_parquet_snappy,
            fallback: write_parquet_plain,
        },
        SaveFormat::Mat => FormatWriter {
            primary: write_mat_compressed,
            fallback: write_mat_plain,
        },
    }
}

/// What `write_table` produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    /// Files written successfully
    pub written: Vec<PathBuf>,
    /// One message per format whose primary and fallback both failed
    pub warnings: Vec<String>,
}

impl WriteReport {
    /// True if no requested format could be saved
    pub fn all_failed(&self) -> bool {
        self.written.is_empty()
    }
}

/// Output path for a table in a given format
pub fn output_path(dir: &Path, base_name: &str, format: SaveFormat) -> PathBuf {
    dir.join(format!("{}{}", base_name, format.extension()))
}

/// Write a table in every requested format
pub fn write_table(
    table: &RasterTable,
    base_name: &str,
    dir: &Path,
    formats: &[SaveFormat],
) -> WriteReport {
    let mut report = WriteReport::default();

    for &format in formats {
        let path = output_path(dir, base_name, format);
        let writer = format_writer(format);

        let primary_err = match (writer.primary)(table, &path) {
            Ok(()) => {
                log::debug!("Saved {:?}", path);
                report.written.push(path);
                continue;
            }
            Err(e) => e,
        };

        log::warn!(
            "Saving {:?} failed ({}), retrying with fallback writer",
            path,
            primary_err
        );

        match (writer.fallback)(table, &path) {
            Ok(()) => report.written.push(path),
            Err(fallback_err) => {
                let warning = format!(
                    "{}: {}; fallback: {}",
                    format, primary_err, fallback_err
                );
                log::warn!("Could not save {:?}: {}", path, warning);
                report.warnings.push(warning);
            }
        }
    }

    report
}

fn save_error(format: SaveFormat, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Save {
        format: format.to_string(),
        message: err.to_string(),
    }
}

fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn write_csv(table: &RasterTable, path: &Path, with_index: bool, capacity: Option<usize>) -> Result<()> {
    let csv_err = |e: csv::Error| save_error(SaveFormat::Csv, e);

    let mut builder = csv::WriterBuilder::new();
    if let Some(capacity) = capacity {
        builder.buffer_capacity(capacity);
    }
    let mut wtr = builder.from_path(path).map_err(csv_err)?;

    if with_index {
        wtr.write_field(TIME_COLUMN).map_err(csv_err)?;
    }
    for name in table.column_names() {
        wtr.write_field(name).map_err(csv_err)?;
    }
    wtr.write_record(None::<&[u8]>).map_err(csv_err)?;

    for (row, t) in table.time().iter().enumerate() {
        if with_index {
            wtr.write_field(t.to_string()).map_err(csv_err)?;
        }
        for column in table.columns() {
            wtr.write_field(format_cell(column.values[row])).map_err(csv_err)?;
        }
        wtr.write_record(None::<&[u8]>).map_err(csv_err)?;
    }

    wtr.flush().map_err(|e| save_error(SaveFormat::Csv, e))?;
    Ok(())
}

fn write_csv_indexed(table: &RasterTable, path: &Path) -> Result<()> {
    write_csv(table, path, true, Some(CSV_BUFFER_CAPACITY))
}

fn write_csv_plain(table: &RasterTable, path: &Path) -> Result<()> {
    write_csv(table, path, false, None)
}

fn to_record_batch(table: &RasterTable, with_index: bool) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(table.columns().len() + 1);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns().len() + 1);

    if with_index {
        fields.push(Field::new(TIME_COLUMN, DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(table.time().to_vec())));
    }
    for column in table.columns() {
        fields.push(Field::new(column.name.as_str(), DataType::Float64, true));
        let values: Float64Array = column
            .values
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect();
        arrays.push(Arc::new(values));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| save_error(SaveFormat::Parquet, e))
}

fn write_parquet(table: &RasterTable, path: &Path, with_index: bool, compression: Compression) -> Result<()> {
    let batch = to_record_batch(table, with_index)?;
    let file = File::create(path).map_err(|e| save_error(SaveFormat::Parquet, e))?;

    let props = WriterProperties::builder()
        .set_compression(compression)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| save_error(SaveFormat::Parquet, e))?;
    writer
        .write(&batch)
        .map_err(|e| save_error(SaveFormat::Parquet, e))?;
    writer
        .close()
        .map_err(|e| save_error(SaveFormat::Parquet, e))?;
    Ok(())
}

fn write_parquet_snappy(table: &RasterTable, path: &Path) -> Result<()> {
    write_parquet(table, path, true, Compression::SNAPPY)
}

fn write_parquet_plain(table: &RasterTable, path: &Path) -> Result<()> {
    write_parquet(table, path, false, Compression::UNCOMPRESSED)
}

fn write_mat(table: &RasterTable, path: &Path, compress: bool) -> Result<()> {
    let mat_err = |e: std::io::Error| save_error(SaveFormat::Mat, e);

    let file = File::create(path).map_err(mat_err)?;
    let mut writer = MatWriter::new(BufWriter::new(file), compress).map_err(mat_err)?;
    writer.write_vector(TIME_COLUMN, table.time()).map_err(mat_err)?;
    for column in table.columns() {
        writer
            .write_vector(&mat::variable_name(&column.name), &column.values)
            .map_err(mat_err)?;
    }
    writer.finish().map_err(mat_err)?;
    Ok(())
}

fn write_mat_compressed(table: &RasterTable, path: &Path) -> Result<()> {
    write_mat(table, path, true)
}

fn write_mat_plain(table: &RasterTable, path: &Path) -> Result<()> {
    write_mat(table, path, false)
}

/// Read a CSV table back
///
/// A leading `timestamps` column is the time index. Tables saved without it
/// get the row number as time and keep every column as a signal. Empty or
/// non-numeric cells become NaN.
pub fn read_csv_table(path: &Path) -> Result<RasterTable> {
    let table_err = |e: csv::Error| PipelineError::Table(format!("{:?}: {}", path, e));

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(false)
        .from_path(path)
        .map_err(table_err)?;

    let headers = rdr.headers().map_err(table_err)?.clone();
    if headers.is_empty() {
        return Err(PipelineError::Table(format!("{:?}: no header row", path)));
    }

    let indexed = headers.get(0) == Some(TIME_COLUMN);
    let mut time = Vec::new();
    let mut columns: Vec<Column> = headers
        .iter()
        .skip(usize::from(indexed))
        .map(|name| Column {
            name: name.to_string(),
            values: Vec::new(),
        })
        .collect();

    for record in rdr.records() {
        let record = record.map_err(table_err)?;
        let mut cells = record.iter().map(parse_cell);
        if indexed {
            time.push(cells.next().unwrap_or(f64::NAN));
        } else {
            time.push(time.len() as f64);
        }
        for (column, value) in columns.iter_mut().zip(cells) {
            column.values.push(value);
        }
    }

    RasterTable::new(time, columns)
}

fn parse_cell(cell: &str) -> f64 {
    cell.trim().parse().unwrap_or(f64::NAN)
}
