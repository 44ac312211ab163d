use std::fs::File;
use std::io::{BufReader, Seek};
use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::classify::TabularFormat;
use crate::config::{ConversionConfig, ParquetCompression};
use crate::transform::TransformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConversionStats {
    pub rows: u64,
    pub batches: u64,
    pub columns: usize,
}

/// Turns one tabular source into exactly one output stream.
pub trait Converter: Send + Sync {
    /// Content type recorded on converted objects.
    fn content_type(&self) -> &'static str;

    /// Reads `input` and writes the converted form into `output`.
    fn convert(
        &self,
        input: &Path,
        format: TabularFormat,
        output: &mut File,
    ) -> Result<ConversionStats, TransformError>;
}

/// CSV, TSV and JSON Lines to Parquet.
///
/// The schema is inferred over the whole input, then rows are streamed in
/// batches of `batch_rows`.
#[derive(Debug, Clone)]
pub struct ParquetConverter {
    batch_rows: usize,
    compression: ParquetCompression,
}

impl ParquetConverter {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            batch_rows: config.batch_rows.max(1),
            compression: config.compression,
        }
    }

    fn writer_properties(&self) -> WriterProperties {
        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };
        WriterProperties::builder()
            .set_compression(compression)
            .build()
    }

    fn write_batches<I>(
        &self,
        schema: Arc<Schema>,
        batches: I,
        output: &mut File,
    ) -> Result<ConversionStats, TransformError>
    where
        I: Iterator<Item = Result<RecordBatch, ArrowError>>,
    {
        let mut stats = ConversionStats {
            columns: schema.fields().len(),
            ..Default::default()
        };
        let mut writer = ArrowWriter::try_new(output, schema, Some(self.writer_properties()))
            .map_err(parquet_error)?;

        for batch in batches {
            let batch = batch.map_err(arrow_error)?;
            stats.rows += batch.num_rows() as u64;
            stats.batches += 1;
            writer.write(&batch).map_err(parquet_error)?;
        }

        writer.close().map_err(parquet_error)?;
        Ok(stats)
    }

    fn convert_delimited(
        &self,
        input: &Path,
        delimiter: u8,
        output: &mut File,
    ) -> Result<ConversionStats, TransformError> {
        let mut file = File::open(input)?;
        let format = arrow::csv::reader::Format::default()
            .with_header(true)
            .with_delimiter(delimiter);
        let (schema, _) = format.infer_schema(&mut file, None).map_err(arrow_error)?;
        ensure_columns(&schema)?;
        file.rewind()?;

        let schema = Arc::new(schema);
        let reader = arrow::csv::ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_delimiter(delimiter)
            .with_batch_size(self.batch_rows)
            .build(file)
            .map_err(arrow_error)?;

        self.write_batches(schema, reader, output)
    }

    fn convert_json_lines(
        &self,
        input: &Path,
        output: &mut File,
    ) -> Result<ConversionStats, TransformError> {
        let mut reader = BufReader::new(File::open(input)?);
        let (schema, _) = arrow::json::reader::infer_json_schema_from_seekable(&mut reader, None)
            .map_err(arrow_error)?;
        ensure_columns(&schema)?;
        reader.rewind()?;

        let schema = Arc::new(schema);
        let rows = arrow::json::ReaderBuilder::new(schema.clone())
            .with_batch_size(self.batch_rows)
            .build(reader)
            .map_err(arrow_error)?;

        self.write_batches(schema, rows, output)
    }
}

impl Converter for ParquetConverter {
    fn content_type(&self) -> &'static str {
        "application/vnd.apache.parquet"
    }

    fn convert(
        &self,
        input: &Path,
        format: TabularFormat,
        output: &mut File,
    ) -> Result<ConversionStats, TransformError> {
        let stats = match format {
            TabularFormat::Csv => self.convert_delimited(input, b',', output)?,
            TabularFormat::Tsv => self.convert_delimited(input, b'\t', output)?,
            TabularFormat::JsonLines => self.convert_json_lines(input, output)?,
        };
        output.sync_all()?;
        debug!(
            rows = stats.rows,
            batches = stats.batches,
            columns = stats.columns,
            "Converted to parquet"
        );
        Ok(stats)
    }
}

fn ensure_columns(schema: &Schema) -> Result<(), TransformError> {
    if schema.fields().is_empty() {
        return Err(TransformError::Malformed("no columns found".to_string()));
    }
    Ok(())
}

fn arrow_error(e: ArrowError) -> TransformError {
    match e {
        ArrowError::IoError(_, source) => TransformError::Io(source),
        other => TransformError::Malformed(other.to_string()),
    }
}

fn parquet_error(e: parquet::errors::ParquetError) -> TransformError {
    TransformError::Io(std::io::Error::other(e.to_string()))
}
