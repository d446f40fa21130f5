//! In-process warehouse backed by a DataFusion session.
//!
//! Queries are planned and executed on background tokio tasks so callers see
//! the same pending -> running -> done lifecycle a remote warehouse exposes.
//! Every query result lands in a destination table: the configured one, or an
//! anonymous `_anonymous.<job_id>` table, mirroring how BigQuery materializes
//! query output.

use super::{
    JobConfig, JobErrorDetail, JobHandle, JobKind, JobStatus, RemoteJobState, ResultSet,
    TableMeta, TableRef, Warehouse, WarehouseError, WriteDisposition,
};
use crate::id::generate_job_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::{CatalogProvider, MemorySchemaProvider};
use datafusion::datasource::MemTable;
use datafusion::prelude::{SessionConfig, SessionContext};
use datafusion::sql::TableReference;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Dataset holding results of queries submitted without a destination.
pub const ANONYMOUS_DATASET: &str = "_anonymous";

struct MemoryJob {
    status: JobStatus,
    result: Option<ResultSet>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct TableEntry {
    created_at: DateTime<Utc>,
    batches: Vec<RecordBatch>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, MemoryJob>,
    tables: HashMap<TableRef, TableEntry>,
}

pub struct MemoryWarehouse {
    ctx: SessionContext,
    state: Arc<Mutex<State>>,
    execution_delay: Mutex<Duration>,
    submit_failure: Mutex<Option<WarehouseError>>,
}

impl Debug for MemoryWarehouse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("MemoryWarehouse")
            .field("jobs", &state.jobs.len())
            .field("tables", &state.tables.len())
            .finish()
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        let config =
            SessionConfig::new().set_str("datafusion.sql_parser.dialect", "BigQuery");
        Self {
            ctx: SessionContext::new_with_config(config),
            state: Arc::new(Mutex::new(State::default())),
            execution_delay: Mutex::new(Duration::ZERO),
            submit_failure: Mutex::new(None),
        }
    }

    /// Delay before each job starts running. Jobs report `Pending` meanwhile.
    pub fn set_execution_delay(&self, delay: Duration) {
        *self.execution_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Make every following `submit_query` fail with `error` until cleared.
    pub fn set_submit_failure(&self, error: Option<WarehouseError>) {
        *self.submit_failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Create or replace a table with the given rows.
    pub fn register_table(&self, table: &TableRef, rows: ResultSet) -> Result<(), WarehouseError> {
        write_table(&self.ctx, &self.state, table, rows, WriteDisposition::Truncate)
    }

    /// Override a table's creation time.
    pub fn set_table_created_at(&self, table: &TableRef, created_at: DateTime<Utc>) {
        let mut state = lock(&self.state);
        if let Some(entry) = state.tables.get_mut(table) {
            entry.created_at = created_at;
        }
    }

    /// Drop all record of a job, as if the warehouse had expired it.
    pub fn forget_job(&self, job_id: &str) -> bool {
        lock(&self.state).jobs.remove(job_id).is_some()
    }

    pub fn job_count(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    fn delay(&self) -> Duration {
        *self.execution_delay.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock(state: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn table_reference(table: &TableRef) -> TableReference {
    TableReference::partial(table.dataset.as_str(), table.table.as_str())
}

fn ensure_dataset(ctx: &SessionContext, dataset: &str) -> Result<(), WarehouseError> {
    let catalog_name = ctx.state().config_options().catalog.default_catalog.clone();
    let catalog = ctx
        .catalog(&catalog_name)
        .ok_or_else(|| WarehouseError::NotFound(format!("catalog {}", catalog_name)))?;
    if catalog.schema(dataset).is_none() {
        catalog.register_schema(dataset, Arc::new(MemorySchemaProvider::new()))?;
    }
    Ok(())
}

fn write_table(
    ctx: &SessionContext,
    state: &Mutex<State>,
    table: &TableRef,
    rows: ResultSet,
    disposition: WriteDisposition,
) -> Result<(), WarehouseError> {
    ensure_dataset(ctx, &table.dataset)?;
    let reference = table_reference(table);
    let existing = lock(state).tables.get(table).cloned();

    let (batches, created_at) = match (disposition, existing) {
        (WriteDisposition::Empty, Some(_)) => {
            return Err(WarehouseError::BadRequest(format!(
                "Already Exists: Table {}",
                table
            )));
        }
        (WriteDisposition::Append, Some(entry)) => {
            let mut batches = entry.batches;
            batches.extend(rows.batches);
            (batches, entry.created_at)
        }
        _ => (rows.batches, Utc::now()),
    };

    let mem = MemTable::try_new(rows.schema.clone(), vec![batches.clone()])?;
    ctx.deregister_table(reference.clone())?;
    ctx.register_table(reference, Arc::new(mem))?;

    lock(state)
        .tables
        .insert(table.clone(), TableEntry { created_at, batches });
    Ok(())
}

fn stopped() -> JobErrorDetail {
    JobErrorDetail {
        reason: Some("stopped".to_string()),
        message: "Job execution was cancelled".to_string(),
        location: None,
    }
}

async fn execute(
    ctx: &SessionContext,
    state: &Mutex<State>,
    sql: &str,
    destination: &TableRef,
    disposition: WriteDisposition,
) -> Result<ResultSet, JobErrorDetail> {
    let invalid = |e: datafusion::error::DataFusionError| JobErrorDetail {
        reason: Some("invalidQuery".to_string()),
        message: e.to_string(),
        location: Some("query".to_string()),
    };

    let df = ctx.sql(sql).await.map_err(invalid)?;
    let schema = Arc::clone(df.schema().inner());
    let batches = df.collect().await.map_err(invalid)?;
    let rows = ResultSet::new(schema, batches);

    write_table(ctx, state, destination, rows.clone(), disposition).map_err(|e| JobErrorDetail {
        reason: Some("invalid".to_string()),
        message: e.to_string(),
        location: Some(destination.to_string()),
    })?;
    Ok(rows)
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit_query(
        &self,
        sql: &str,
        config: &JobConfig,
    ) -> Result<JobHandle, WarehouseError> {
        if let Some(error) = self
            .submit_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(error);
        }
        if config.use_legacy_sql {
            return Err(WarehouseError::BadRequest(
                "legacy SQL is not supported by the in-process warehouse".to_string(),
            ));
        }

        let job_id = generate_job_id();
        let handle = JobHandle::new(job_id.clone());
        let destination = config
            .destination
            .clone()
            .unwrap_or_else(|| TableRef::new(ANONYMOUS_DATASET, job_id.clone()));
        let cancel = CancellationToken::new();

        lock(&self.state).jobs.insert(
            job_id.clone(),
            MemoryJob {
                status: JobStatus {
                    handle: handle.clone(),
                    kind: JobKind::Query,
                    state: RemoteJobState::Pending,
                    errors: vec![],
                    created_at: Some(Utc::now()),
                    started_at: None,
                    ended_at: None,
                    destination: Some(destination.clone()),
                    total_bytes_processed: None,
                },
                result: None,
                cancel: cancel.clone(),
            },
        );

        let ctx = self.ctx.clone();
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let disposition = config.write_disposition;
        let delay = self.delay();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    finish(&state, &job_id, Err(stopped()));
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if let Some(job) = lock(&state).jobs.get_mut(&job_id) {
                job.status.state = RemoteJobState::Running;
                job.status.started_at = Some(Utc::now());
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(stopped()),
                r = execute(&ctx, &state, &sql, &destination, disposition) => r,
            };
            finish(&state, &job_id, outcome);
        });

        debug!(job_id = %handle.job_id, "Submitted in-process query job");
        Ok(handle)
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError> {
        lock(&self.state)
            .jobs
            .get(&job.job_id)
            .map(|j| j.status.clone())
            .ok_or_else(|| WarehouseError::NotFound(format!("Job {}", job.job_id)))
    }

    async fn result_size(&self, job: &JobHandle) -> Result<Option<u64>, WarehouseError> {
        let state = lock(&self.state);
        let entry = state
            .jobs
            .get(&job.job_id)
            .ok_or_else(|| WarehouseError::NotFound(format!("Job {}", job.job_id)))?;
        Ok(entry.result.as_ref().map(|r| r.memory_size() as u64))
    }

    async fn fetch_results(&self, job: &JobHandle) -> Result<ResultSet, WarehouseError> {
        let state = lock(&self.state);
        let entry = state
            .jobs
            .get(&job.job_id)
            .ok_or_else(|| WarehouseError::NotFound(format!("Job {}", job.job_id)))?;

        if !entry.status.is_done() {
            return Err(WarehouseError::BadRequest(format!(
                "Job {} has not completed",
                job.job_id
            )));
        }
        if let Some(error) = entry.status.errors.first() {
            return Err(WarehouseError::BadRequest(error.to_string()));
        }
        entry
            .result
            .clone()
            .ok_or_else(|| WarehouseError::NotFound(format!("Results of job {}", job.job_id)))
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), WarehouseError> {
        let state = lock(&self.state);
        let entry = state
            .jobs
            .get(&job.job_id)
            .ok_or_else(|| WarehouseError::NotFound(format!("Job {}", job.job_id)))?;
        entry.cancel.cancel();
        Ok(())
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableMeta>, WarehouseError> {
        Ok(lock(&self.state).tables.get(table).map(|entry| TableMeta {
            table: table.clone(),
            created_at: entry.created_at,
            num_rows: Some(entry.batches.iter().map(|b| b.num_rows() as u64).sum()),
            num_bytes: Some(
                entry
                    .batches
                    .iter()
                    .map(|b| b.get_array_memory_size() as u64)
                    .sum(),
            ),
        }))
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableRef>, WarehouseError> {
        let mut tables: Vec<TableRef> = lock(&self.state)
            .tables
            .keys()
            .filter(|t| t.dataset == dataset)
            .cloned()
            .collect();
        tables.sort();
        Ok(tables)
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        if lock(&self.state).tables.remove(table).is_none() {
            return Err(WarehouseError::NotFound(format!("Table {}", table)));
        }
        self.ctx.deregister_table(table_reference(table))?;
        Ok(())
    }

    async fn load_table(&self, table: &TableRef, rows: &ResultSet) -> Result<(), WarehouseError> {
        write_table(
            &self.ctx,
            &self.state,
            table,
            rows.clone(),
            WriteDisposition::Truncate,
        )
    }
}

fn finish(state: &Mutex<State>, job_id: &str, outcome: Result<ResultSet, JobErrorDetail>) {
    let mut state = lock(state);
    let Some(job) = state.jobs.get_mut(job_id) else {
        warn!(job_id = %job_id, "Finished job is no longer tracked");
        return;
    };
    if job.status.is_done() {
        return;
    }
    job.status.state = RemoteJobState::Done;
    job.status.ended_at = Some(Utc::now());
    match outcome {
        Ok(rows) => {
            job.status.total_bytes_processed = Some(rows.memory_size() as u64);
            job.result = Some(rows);
        }
        Err(error) => job.status.errors.push(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::poll_until_done;

    async fn run(warehouse: &MemoryWarehouse, sql: &str, config: &JobConfig) -> JobStatus {
        let job = warehouse.submit_query(sql, config).await.unwrap();
        poll_until_done(warehouse, &job, Duration::from_millis(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_lands_in_anonymous_table() {
        let warehouse = MemoryWarehouse::new();
        let status = run(&warehouse, "SELECT 1 AS x", &JobConfig::default()).await;

        assert!(status.is_done());
        assert!(!status.has_errors());
        let destination = status.destination.clone().unwrap();
        assert_eq!(destination.dataset, ANONYMOUS_DATASET);
        assert!(warehouse.get_table(&destination).await.unwrap().is_some());

        let rows = warehouse.fetch_results(&status.handle).await.unwrap();
        assert_eq!(rows.num_rows(), 1);
    }

    #[tokio::test]
    async fn test_invalid_sql_reports_job_error() {
        let warehouse = MemoryWarehouse::new();
        let status = run(&warehouse, "SELEC 1", &JobConfig::default()).await;

        assert!(status.is_done());
        assert_eq!(status.errors[0].reason.as_deref(), Some("invalidQuery"));
        assert!(warehouse.fetch_results(&status.handle).await.is_err());
    }

    #[tokio::test]
    async fn test_write_dispositions() {
        let warehouse = MemoryWarehouse::new();
        let table = TableRef::new("ds", "t");
        let truncate = JobConfig {
            destination: Some(table.clone()),
            write_disposition: WriteDisposition::Truncate,
            ..Default::default()
        };
        run(&warehouse, "SELECT 1 AS x", &truncate).await;

        let append = JobConfig {
            write_disposition: WriteDisposition::Append,
            ..truncate.clone()
        };
        run(&warehouse, "SELECT 2 AS x", &append).await;
        assert_eq!(warehouse.get_table(&table).await.unwrap().unwrap().num_rows, Some(2));

        let empty = JobConfig {
            write_disposition: WriteDisposition::Empty,
            ..truncate.clone()
        };
        let status = run(&warehouse, "SELECT 3 AS x", &empty).await;
        assert!(status.has_errors());

        let status = run(&warehouse, "SELECT * FROM `ds`.`t`", &JobConfig::default()).await;
        let rows = warehouse.fetch_results(&status.handle).await.unwrap();
        assert_eq!(rows.num_rows(), 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let warehouse = MemoryWarehouse::new();
        warehouse.set_execution_delay(Duration::from_secs(60));
        let job = warehouse
            .submit_query("SELECT 1", &JobConfig::default())
            .await
            .unwrap();
        assert_eq!(
            warehouse.job_status(&job).await.unwrap().state,
            RemoteJobState::Pending
        );

        warehouse.cancel_job(&job).await.unwrap();
        let status = poll_until_done(&warehouse, &job, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(status.errors[0].reason.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_forgotten_job_is_not_found() {
        let warehouse = MemoryWarehouse::new();
        let status = run(&warehouse, "SELECT 1", &JobConfig::default()).await;
        assert!(warehouse.forget_job(&status.handle.job_id));

        let err = warehouse.job_status(&status.handle).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_submit_failure_knob() {
        let warehouse = MemoryWarehouse::new();
        warehouse.set_submit_failure(Some(WarehouseError::Forbidden("quota".into())));
        assert!(warehouse
            .submit_query("SELECT 1", &JobConfig::default())
            .await
            .is_err());

        warehouse.set_submit_failure(None);
        assert!(warehouse
            .submit_query("SELECT 1", &JobConfig::default())
            .await
            .is_ok());
    }
}
