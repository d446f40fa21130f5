//! Warehouse abstraction: query job submission, job status, results and tables.
//!
//! Everything above this module talks to a [`Warehouse`] trait object. Two
//! implementations ship with the crate:
//!
//! - [`BigQueryWarehouse`] - Google BigQuery via `gcp-bigquery-client`
//! - [`MemoryWarehouse`] - an in-process DataFusion session whose queries run
//!   as background tokio tasks, used for tests and local work

mod bigquery;
mod error;
mod memory;

pub use bigquery::{bigquery_type_to_arrow, BigQueryWarehouse};
pub use error::WarehouseError;
pub use memory::MemoryWarehouse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::error::ArrowError;
use datafusion::arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::time::Duration;

/// A table inside a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Backtick-quoted reference usable in SQL text, e.g. `` `ds`.`tbl` ``.
    pub fn quoted(&self) -> String {
        format!(
            "`{}`.`{}`",
            self.dataset.replace('`', "\\`"),
            self.table.replace('`', "\\`")
        )
    }
}

impl Display for TableRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// How a query's output interacts with an existing destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    Truncate,
    Append,
    #[default]
    Empty,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
            WriteDisposition::Append => "WRITE_APPEND",
            WriteDisposition::Empty => "WRITE_EMPTY",
        }
    }
}

/// Configuration passed along with a query submission.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub destination: Option<TableRef>,
    pub write_disposition: WriteDisposition,
    pub use_legacy_sql: bool,
    /// Passed through to the warehouse; this crate never enforces it.
    pub job_timeout: Option<Duration>,
}

/// Kind of warehouse work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Query,
    Copy,
    Load,
    Extract,
}

/// Opaque reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub location: Option<String>,
}

impl JobHandle {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            location: None,
        }
    }
}

/// Lifecycle state as reported by the warehouse itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobState {
    Pending,
    Running,
    Done,
}

/// One error entry attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorDetail {
    pub reason: Option<String>,
    pub message: String,
    pub location: Option<String>,
}

impl JobErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            reason: None,
            message: message.into(),
            location: None,
        }
    }
}

impl Display for JobErrorDetail {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {}", reason, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Snapshot of a job's state at the moment it was polled.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub handle: JobHandle,
    pub kind: JobKind,
    pub state: RemoteJobState,
    pub errors: Vec<JobErrorDetail>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub destination: Option<TableRef>,
    pub total_bytes_processed: Option<u64>,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        self.state == RemoteJobState::Done
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Rows produced by a finished query, as Arrow record batches.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl ResultSet {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    /// In-memory size of the batches.
    pub fn memory_size(&self) -> usize {
        self.batches.iter().map(|b| b.get_array_memory_size()).sum()
    }

    /// All batches concatenated into a single one.
    pub fn concat(&self) -> Result<RecordBatch, ArrowError> {
        datafusion::arrow::compute::concat_batches(&self.schema, &self.batches)
    }

    /// Render rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, ArrowError> {
        let mut writer = datafusion::arrow::json::ArrayWriter::new(Vec::new());
        for batch in &self.batches {
            writer.write(batch)?;
        }
        writer.finish()?;
        let buf = writer.into_inner();
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&buf).map_err(|e| ArrowError::JsonError(e.to_string()))
    }
}

/// Table metadata used for cache hit tests and partition management.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub table: TableRef,
    pub created_at: DateTime<Utc>,
    pub num_rows: Option<u64>,
    pub num_bytes: Option<u64>,
}

/// Operations the query layer needs from a data warehouse.
#[async_trait]
pub trait Warehouse: Debug + Send + Sync {
    /// Short name used in logs ("bigquery", "memory").
    fn name(&self) -> &str;

    /// Submit a query job and return immediately with its handle.
    async fn submit_query(
        &self,
        sql: &str,
        config: &JobConfig,
    ) -> Result<JobHandle, WarehouseError>;

    /// Poll the job once.
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError>;

    /// Bytes the finished job's result occupies, if the warehouse reports it.
    async fn result_size(&self, job: &JobHandle) -> Result<Option<u64>, WarehouseError>;

    /// Download the result of a finished query job.
    async fn fetch_results(&self, job: &JobHandle) -> Result<ResultSet, WarehouseError>;

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), WarehouseError>;

    /// Table metadata, or `None` when the table does not exist.
    async fn get_table(&self, table: &TableRef) -> Result<Option<TableMeta>, WarehouseError>;

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableRef>, WarehouseError>;

    async fn delete_table(&self, table: &TableRef) -> Result<(), WarehouseError>;

    /// Create or replace `table` with the given rows.
    async fn load_table(&self, table: &TableRef, rows: &ResultSet) -> Result<(), WarehouseError>;
}

/// Poll a job until the warehouse reports it done.
///
/// Used for short internal jobs (cache copies and reads) that are not tracked
/// by the job pool and cannot be interrupted.
pub async fn poll_until_done(
    warehouse: &dyn Warehouse,
    job: &JobHandle,
    interval: Duration,
) -> Result<JobStatus, WarehouseError> {
    loop {
        let status = warehouse.job_status(job).await?;
        if status.is_done() {
            return Ok(status);
        }
        tokio::time::sleep(interval).await;
    }
}
