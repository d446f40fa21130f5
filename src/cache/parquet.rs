//! Parquet encoding of cached payloads

use super::CacheError;
use crate::warehouse::ResultSet;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::basic::Compression;
use datafusion::parquet::file::properties::{WriterProperties, WriterVersion};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for payload files.
#[derive(Debug, Clone)]
pub struct ParquetConfig {
    pub max_row_group_size: usize,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            max_row_group_size: 100_000,
        }
    }
}

fn writer_properties(config: &ParquetConfig) -> WriterProperties {
    WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::LZ4)
        .set_max_row_group_size(config.max_row_group_size)
        .build()
}

/// Writes batches to a temporary sibling file and renames it into place on
/// [`close`](Self::close), so readers never observe a partial payload.
///
/// Lifecycle: new(path) -> init(schema) -> write_batch()* -> close()
pub struct StreamingParquetWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    config: ParquetConfig,
    writer: Option<ArrowWriter<File>>,
    row_count: usize,
}

impl StreamingParquetWriter {
    pub fn new(path: PathBuf) -> Self {
        Self::with_config(path, ParquetConfig::default())
    }

    pub fn with_config(path: PathBuf, config: ParquetConfig) -> Self {
        let tmp_path = path.with_extension(format!("parquet.tmp-{}", nanoid::nanoid!(8)));
        Self {
            path,
            tmp_path,
            config,
            writer: None,
            row_count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init(&mut self, schema: &SchemaRef) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.tmp_path)?;
        let writer = ArrowWriter::try_new(
            file,
            Arc::clone(schema),
            Some(writer_properties(&self.config)),
        )?;
        self.writer = Some(writer);
        Ok(())
    }

    pub fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), CacheError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            CacheError::Parquet("Writer not initialized - call init() first".into())
        })?;
        self.row_count += batch.num_rows();
        writer.write(batch)?;
        Ok(())
    }

    /// Finish the file and move it into place. Returns the rows written.
    pub fn close(mut self) -> Result<usize, CacheError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| CacheError::Parquet("Writer not initialized".into()))?;
        let finished = writer
            .close()
            .map_err(CacheError::from)
            .and_then(|_| std::fs::rename(&self.tmp_path, &self.path).map_err(CacheError::from));
        if let Err(e) = finished {
            let _ = std::fs::remove_file(&self.tmp_path);
            return Err(e);
        }
        Ok(self.row_count)
    }
}

impl Drop for StreamingParquetWriter {
    fn drop(&mut self) {
        // Abandoned before close: remove the partial file.
        if self.writer.is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Write a whole result set to `path`.
pub fn write_parquet(path: &Path, rows: &ResultSet) -> Result<usize, CacheError> {
    let mut writer = StreamingParquetWriter::new(path.to_path_buf());
    writer.init(&rows.schema)?;
    for batch in &rows.batches {
        writer.write_batch(batch)?;
    }
    writer.close()
}

/// Read a payload written by [`write_parquet`].
pub fn read_parquet(path: &Path) -> Result<ResultSet, CacheError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = Arc::clone(builder.schema());
    let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
    Ok(ResultSet::new(schema, batches))
}
