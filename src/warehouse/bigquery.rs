//! BigQuery warehouse implementation using gcp-bigquery-client

use super::{
    JobConfig, JobErrorDetail, JobHandle, JobKind, JobStatus, RemoteJobState, ResultSet,
    TableMeta, TableRef, Warehouse, WarehouseError,
};
use crate::id::generate_job_id;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use datafusion::arrow::array::{
    ArrayBuilder, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::field_type::FieldType;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::job::Job;
use gcp_bigquery_client::model::table::Table;
use gcp_bigquery_client::model::table_cell::TableCell;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::model::table_row::TableRow;
use gcp_bigquery_client::table::ListOptions;
use gcp_bigquery_client::Client;
use serde::Deserialize;
use std::fmt::{self, Debug, Formatter};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const BATCH_SIZE: usize = 10_000;

pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    location: Option<String>,
}

impl Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryWarehouse")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .finish()
    }
}

impl BigQueryWarehouse {
    /// Build a client from a service account key JSON string.
    pub async fn from_key_json(
        key_json: &str,
        project_id: impl Into<String>,
        location: Option<String>,
    ) -> Result<Self, WarehouseError> {
        let sa_key = serde_json::from_str(key_json).map_err(|e| {
            WarehouseError::Connection(format!("Invalid service account key JSON: {}", e))
        })?;
        let client = Client::from_service_account_key(sa_key, false)
            .await
            .map_err(|e| {
                WarehouseError::Connection(format!("Failed to create BigQuery client: {}", e))
            })?;
        Ok(Self {
            client,
            project_id: project_id.into(),
            location,
        })
    }

    /// Build a client from a key file, or from application default
    /// credentials when no path is given.
    pub async fn connect(
        credentials_path: Option<&Path>,
        project_id: impl Into<String>,
        location: Option<String>,
    ) -> Result<Self, WarehouseError> {
        match credentials_path {
            Some(path) => {
                let key_json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    WarehouseError::Connection(format!(
                        "Failed to read credentials {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_key_json(&key_json, project_id, location).await
            }
            None => {
                let client = Client::from_application_default_credentials()
                    .await
                    .map_err(|e| {
                        WarehouseError::Connection(format!(
                            "Failed to create BigQuery client: {}",
                            e
                        ))
                    })?;
                Ok(Self {
                    client,
                    project_id: project_id.into(),
                    location,
                })
            }
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn location_for<'a>(&'a self, job: &'a JobHandle) -> Option<&'a str> {
        job.location.as_deref().or(self.location.as_deref())
    }

    async fn get_job(&self, job: &JobHandle) -> Result<JobView, WarehouseError> {
        let raw = self
            .client
            .job()
            .get_job(&self.project_id, &job.job_id, self.location_for(job))
            .await
            .map_err(map_bq_error)?;
        JobView::from_job(&raw)
    }
}

/// Map a vendor error onto [`WarehouseError`].
fn map_bq_error(e: BQError) -> WarehouseError {
    match e {
        BQError::ResponseError { error } => {
            WarehouseError::from_status(error.error.code, error.error.message)
        }
        other => WarehouseError::Api {
            code: 500,
            message: other.to_string(),
        },
    }
}

// The REST resources are read back through a narrow view so that optional
// fields and numeric-as-string encodings are handled in one place.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    job_reference: Option<JobReferenceView>,
    configuration: Option<ConfigurationView>,
    status: Option<StatusView>,
    statistics: Option<StatisticsView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceView {
    job_id: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigurationView {
    job_type: Option<String>,
    query: Option<QueryConfigView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryConfigView {
    destination_table: Option<TableReferenceView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReferenceView {
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusView {
    state: Option<String>,
    error_result: Option<ErrorView>,
    errors: Option<Vec<ErrorView>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ErrorView {
    reason: Option<String>,
    message: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsView {
    creation_time: Option<serde_json::Value>,
    start_time: Option<serde_json::Value>,
    end_time: Option<serde_json::Value>,
    total_bytes_processed: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableView {
    creation_time: Option<serde_json::Value>,
    num_rows: Option<serde_json::Value>,
    num_bytes: Option<serde_json::Value>,
}

impl JobView {
    fn from_job(job: &Job) -> Result<Self, WarehouseError> {
        let value =
            serde_json::to_value(job).map_err(|e| WarehouseError::Conversion(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| WarehouseError::Conversion(e.to_string()))
    }

    fn destination(&self) -> Option<TableRef> {
        self.configuration
            .as_ref()
            .and_then(|c| c.query.as_ref())
            .and_then(|q| q.destination_table.as_ref())
            .map(|t| TableRef::new(&t.dataset_id, &t.table_id))
    }

    fn into_status(self, fallback: &JobHandle) -> JobStatus {
        let destination = self.destination();
        let handle = match &self.job_reference {
            Some(JobReferenceView {
                job_id: Some(job_id),
                location,
            }) => JobHandle {
                job_id: job_id.clone(),
                location: location.clone().or_else(|| fallback.location.clone()),
            },
            _ => fallback.clone(),
        };

        let kind = match self
            .configuration
            .as_ref()
            .and_then(|c| c.job_type.as_deref())
        {
            Some("COPY") => JobKind::Copy,
            Some("LOAD") => JobKind::Load,
            Some("EXTRACT") => JobKind::Extract,
            _ => JobKind::Query,
        };

        let status = self.status.unwrap_or_default();
        let state = match status.state.as_deref() {
            Some("DONE") => RemoteJobState::Done,
            Some("RUNNING") => RemoteJobState::Running,
            _ => RemoteJobState::Pending,
        };

        // errorResult repeats one of the entries in errors when both are set
        let mut errors: Vec<ErrorView> = status.errors.unwrap_or_default();
        if let Some(result) = status.error_result {
            if !errors.contains(&result) {
                errors.insert(0, result);
            }
        }
        let errors = errors
            .into_iter()
            .map(|e| JobErrorDetail {
                reason: e.reason,
                message: e.message.unwrap_or_default(),
                location: e.location,
            })
            .collect();

        let stats = self.statistics.unwrap_or_default();
        JobStatus {
            handle,
            kind,
            state,
            errors,
            created_at: stats.creation_time.as_ref().and_then(millis_to_datetime),
            started_at: stats.start_time.as_ref().and_then(millis_to_datetime),
            ended_at: stats.end_time.as_ref().and_then(millis_to_datetime),
            destination,
            total_bytes_processed: stats.total_bytes_processed.as_ref().and_then(value_to_u64),
        }
    }
}

/// BigQuery encodes int64 fields as JSON strings.
fn value_to_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn millis_to_datetime(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

fn query_job_body(
    project_id: &str,
    job_id: &str,
    location: Option<&str>,
    sql: &str,
    config: &JobConfig,
) -> serde_json::Value {
    let mut query = serde_json::json!({
        "query": sql,
        "useLegacySql": config.use_legacy_sql,
        "writeDisposition": config.write_disposition.as_str(),
    });
    if let Some(dest) = &config.destination {
        query["destinationTable"] = serde_json::json!({
            "projectId": project_id,
            "datasetId": dest.dataset,
            "tableId": dest.table,
        });
    }

    let mut configuration = serde_json::json!({ "query": query });
    if let Some(timeout) = config.job_timeout {
        configuration["jobTimeoutMs"] = serde_json::Value::String(timeout.as_millis().to_string());
    }

    let mut reference = serde_json::json!({
        "projectId": project_id,
        "jobId": job_id,
    });
    if let Some(location) = location {
        reference["location"] = serde_json::Value::String(location.to_string());
    }

    serde_json::json!({
        "jobReference": reference,
        "configuration": configuration,
    })
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &str {
        "bigquery"
    }

    async fn submit_query(
        &self,
        sql: &str,
        config: &JobConfig,
    ) -> Result<JobHandle, WarehouseError> {
        let job_id = generate_job_id();
        let body = query_job_body(
            &self.project_id,
            &job_id,
            self.location.as_deref(),
            sql,
            config,
        );
        let job: Job =
            serde_json::from_value(body).map_err(|e| WarehouseError::Conversion(e.to_string()))?;

        let inserted = self
            .client
            .job()
            .insert(&self.project_id, job)
            .await
            .map_err(map_bq_error)?;
        let view = JobView::from_job(&inserted)?;

        let handle = match view.job_reference {
            Some(JobReferenceView {
                job_id: Some(id),
                location,
            }) => JobHandle {
                job_id: id,
                location: location.or_else(|| self.location.clone()),
            },
            _ => JobHandle {
                job_id,
                location: self.location.clone(),
            },
        };
        debug!(job_id = %handle.job_id, "Submitted BigQuery job");
        Ok(handle)
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError> {
        Ok(self.get_job(job).await?.into_status(job))
    }

    async fn result_size(&self, job: &JobHandle) -> Result<Option<u64>, WarehouseError> {
        let Some(destination) = self.get_job(job).await?.destination() else {
            return Ok(None);
        };
        Ok(self.get_table(&destination).await?.and_then(|t| t.num_bytes))
    }

    async fn fetch_results(&self, job: &JobHandle) -> Result<ResultSet, WarehouseError> {
        let mut page_token: Option<String> = None;
        let mut schema: Option<SchemaRef> = None;
        let mut batches = Vec::new();
        let mut row_buffer: Vec<TableRow> = Vec::with_capacity(BATCH_SIZE);

        loop {
            let page = self
                .client
                .job()
                .get_query_results(
                    &self.project_id,
                    &job.job_id,
                    GetQueryResultsParameters {
                        page_token: page_token.clone(),
                        location: self.location_for(job).map(str::to_string),
                        ..Default::default()
                    },
                )
                .await
                .map_err(map_bq_error)?;

            if page.job_complete == Some(false) {
                return Err(WarehouseError::BadRequest(format!(
                    "Job {} is not complete",
                    job.job_id
                )));
            }

            if schema.is_none() {
                let fields = page
                    .schema
                    .as_ref()
                    .and_then(|s| s.fields.as_ref())
                    .map(|f| f.as_slice())
                    .unwrap_or(&[]);
                schema = Some(Arc::new(schema_from_fields(fields)));
            }
            let arrow_schema = schema.clone().unwrap_or_else(|| Arc::new(Schema::empty()));

            if let Some(rows) = page.rows {
                for row in rows {
                    row_buffer.push(row);
                    if row_buffer.len() >= BATCH_SIZE {
                        batches.push(rows_to_batch(&row_buffer, &arrow_schema)?);
                        row_buffer.clear();
                    }
                }
            }

            page_token = page.page_token;
            if page_token.is_none() {
                break;
            }
        }

        let schema = schema.unwrap_or_else(|| Arc::new(Schema::empty()));
        if !row_buffer.is_empty() {
            batches.push(rows_to_batch(&row_buffer, &schema)?);
        }
        Ok(ResultSet::new(schema, batches))
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), WarehouseError> {
        self.client
            .job()
            .cancel_job(&self.project_id, &job.job_id, self.location_for(job))
            .await
            .map_err(map_bq_error)?;
        Ok(())
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableMeta>, WarehouseError> {
        let raw = match self
            .client
            .table()
            .get(&self.project_id, &table.dataset, &table.table, None)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let err = map_bq_error(e);
                if err.is_not_found() {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let value =
            serde_json::to_value(&raw).map_err(|e| WarehouseError::Conversion(e.to_string()))?;
        let view: TableView =
            serde_json::from_value(value).map_err(|e| WarehouseError::Conversion(e.to_string()))?;
        let created_at = view
            .creation_time
            .as_ref()
            .and_then(millis_to_datetime)
            .ok_or_else(|| {
                WarehouseError::Conversion(format!("Table {} has no creation time", table))
            })?;

        Ok(Some(TableMeta {
            table: table.clone(),
            created_at,
            num_rows: view.num_rows.as_ref().and_then(value_to_u64),
            num_bytes: view.num_bytes.as_ref().and_then(value_to_u64),
        }))
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableRef>, WarehouseError> {
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut options = ListOptions::default();
            if let Some(token) = page_token.take() {
                options = options.page_token(token);
            }
            let page = self
                .client
                .table()
                .list(&self.project_id, dataset, options)
                .await
                .map_err(map_bq_error)?;

            for entry in page.tables.unwrap_or_default() {
                tables.push(TableRef::new(
                    entry.table_reference.dataset_id,
                    entry.table_reference.table_id,
                ));
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        tables.sort();
        Ok(tables)
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        self.client
            .table()
            .delete(&self.project_id, &table.dataset, &table.table)
            .await
            .map_err(map_bq_error)
    }

    async fn load_table(&self, table: &TableRef, rows: &ResultSet) -> Result<(), WarehouseError> {
        match self.delete_table(table).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let definition: Table = serde_json::from_value(table_body(
            &self.project_id,
            table,
            &rows.schema,
        ))
        .map_err(|e| WarehouseError::Conversion(e.to_string()))?;
        self.client
            .table()
            .create(definition)
            .await
            .map_err(map_bq_error)?;

        let json_rows = rows
            .to_json_rows()
            .map_err(|e| WarehouseError::Conversion(e.to_string()))?;
        for chunk in json_rows.chunks(BATCH_SIZE) {
            let mut request = TableDataInsertAllRequest::new();
            for row in chunk {
                request.add_row(None, row).map_err(map_bq_error)?;
            }
            let response = self
                .client
                .tabledata()
                .insert_all(&self.project_id, &table.dataset, &table.table, request)
                .await
                .map_err(map_bq_error)?;
            let response = serde_json::to_value(&response)
                .map_err(|e| WarehouseError::Conversion(e.to_string()))?;
            if let Some(errors) = response.get("insertErrors").filter(|e| !e.is_null()) {
                return Err(WarehouseError::BadRequest(format!(
                    "Insert into {} failed: {}",
                    table, errors
                )));
            }
        }
        debug!(table = %table, rows = rows.num_rows(), "Loaded table");
        Ok(())
    }
}

/// BigQuery column type for an Arrow type.
fn arrow_to_bigquery_type(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Boolean => "BOOLEAN",
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => "INTEGER",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "FLOAT",
        DataType::Binary | DataType::LargeBinary => "BYTES",
        DataType::Date32 | DataType::Date64 => "DATE",
        DataType::Timestamp(_, Some(_)) => "TIMESTAMP",
        DataType::Timestamp(_, None) => "DATETIME",
        _ => "STRING",
    }
}

fn table_body(project_id: &str, table: &TableRef, schema: &Schema) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = schema
        .fields()
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name(),
                "type": arrow_to_bigquery_type(f.data_type()),
                "mode": if f.is_nullable() { "NULLABLE" } else { "REQUIRED" },
            })
        })
        .collect();
    serde_json::json!({
        "tableReference": {
            "projectId": project_id,
            "datasetId": table.dataset,
            "tableId": table.table,
        },
        "schema": { "fields": fields },
    })
}

/// Convert BigQuery FieldType enum to Arrow DataType
fn field_type_to_arrow(ft: &FieldType) -> DataType {
    match ft {
        FieldType::Bool | FieldType::Boolean => DataType::Boolean,
        FieldType::Int64 | FieldType::Integer => DataType::Int64,
        FieldType::Float64 | FieldType::Float => DataType::Float64,
        FieldType::Bytes => DataType::Binary,
        FieldType::Date => DataType::Date32,
        FieldType::Datetime => DataType::Timestamp(TimeUnit::Microsecond, None),
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        _ => DataType::Utf8,
    }
}

/// Build Arrow schema from BigQuery TableFieldSchema
fn schema_from_fields(fields: &[TableFieldSchema]) -> Schema {
    let arrow_fields: Vec<Field> = fields
        .iter()
        .map(|f| {
            let repeated = f
                .mode
                .as_ref()
                .map(|m| m.eq_ignore_ascii_case("REPEATED"))
                .unwrap_or(false);
            let nullable = f
                .mode
                .as_ref()
                .map(|m| !m.eq_ignore_ascii_case("REQUIRED"))
                .unwrap_or(true);
            // Repeated values arrive as nested JSON and are kept as text
            let data_type = if repeated {
                DataType::Utf8
            } else {
                field_type_to_arrow(&f.r#type)
            };
            Field::new(&f.name, data_type, nullable)
        })
        .collect();
    Schema::new(arrow_fields)
}

/// Convert a BigQuery SQL type name to Arrow DataType
pub fn bigquery_type_to_arrow(bq_type: &str) -> DataType {
    let type_upper = bq_type.to_uppercase();
    let base_type = type_upper.split('<').next().unwrap_or(&type_upper).trim();
    let base_type = base_type.split('(').next().unwrap_or(base_type).trim();

    match base_type {
        "BOOL" | "BOOLEAN" => DataType::Boolean,
        "INT64" | "INT" | "SMALLINT" | "INTEGER" | "BIGINT" | "TINYINT" | "BYTEINT" => {
            DataType::Int64
        }
        "FLOAT" | "FLOAT64" => DataType::Float64,
        "BYTES" => DataType::Binary,
        "DATE" => DataType::Date32,
        "DATETIME" => DataType::Timestamp(TimeUnit::Microsecond, None),
        "TIMESTAMP" => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        _ => DataType::Utf8,
    }
}

fn rows_to_batch(rows: &[TableRow], schema: &SchemaRef) -> Result<RecordBatch, WarehouseError> {
    let num_cols = schema.fields().len();

    let mut builders: Vec<Box<dyn ArrayBuilder>> = schema
        .fields()
        .iter()
        .map(|f| make_builder(f.data_type(), rows.len()))
        .collect();

    for row in rows {
        let cells = row.columns.as_deref().unwrap_or(&[]);
        for (col_idx, builder) in builders.iter_mut().enumerate().take(num_cols) {
            let data_type = schema.field(col_idx).data_type();
            append_cell(builder, cells.get(col_idx), data_type)?;
        }
    }

    let arrays: Vec<Arc<dyn datafusion::arrow::array::Array>> =
        builders.iter_mut().map(|b| b.finish()).collect();

    RecordBatch::try_new(Arc::clone(schema), arrays)
        .map_err(|e| WarehouseError::Conversion(e.to_string()))
}

fn make_builder(data_type: &DataType, capacity: usize) -> Box<dyn ArrayBuilder> {
    match data_type {
        DataType::Boolean => Box::new(BooleanBuilder::with_capacity(capacity)),
        DataType::Int64 => Box::new(Int64Builder::with_capacity(capacity)),
        DataType::Float64 => Box::new(Float64Builder::with_capacity(capacity)),
        DataType::Binary => Box::new(BinaryBuilder::with_capacity(capacity, capacity * 32)),
        DataType::Date32 => Box::new(Date32Builder::with_capacity(capacity)),
        DataType::Timestamp(_, tz) => {
            let mut b = TimestampMicrosecondBuilder::with_capacity(capacity);
            if let Some(tz) = tz {
                b = b.with_timezone(tz.as_ref());
            }
            Box::new(b)
        }
        _ => Box::new(StringBuilder::with_capacity(capacity, capacity * 32)),
    }
}

fn downcast<T: ArrayBuilder>(builder: &mut Box<dyn ArrayBuilder>) -> Result<&mut T, WarehouseError> {
    builder
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or_else(|| WarehouseError::Conversion("column builder type mismatch".to_string()))
}

/// Append a BigQuery cell value to the matching Arrow builder.
/// The REST API returns scalar values as JSON strings.
fn append_cell(
    builder: &mut Box<dyn ArrayBuilder>,
    cell: Option<&TableCell>,
    data_type: &DataType,
) -> Result<(), WarehouseError> {
    let owned;
    let value_str = match cell.and_then(|c| c.value.as_ref()) {
        Some(serde_json::Value::String(s)) => Some(s.as_str()),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => {
            owned = other.to_string();
            Some(owned.as_str())
        }
    };

    match data_type {
        DataType::Boolean => {
            let b = downcast::<BooleanBuilder>(builder)?;
            match value_str {
                Some(s) => b.append_value(s.eq_ignore_ascii_case("true")),
                None => b.append_null(),
            }
        }
        DataType::Int64 => {
            let b = downcast::<Int64Builder>(builder)?;
            match value_str.and_then(|s| s.parse::<i64>().ok()) {
                Some(v) => b.append_value(v),
                None => b.append_null(),
            }
        }
        DataType::Float64 => {
            let b = downcast::<Float64Builder>(builder)?;
            match value_str.and_then(|s| s.parse::<f64>().ok()) {
                Some(v) => b.append_value(v),
                None => b.append_null(),
            }
        }
        DataType::Date32 => {
            let b = downcast::<Date32Builder>(builder)?;
            match value_str.and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()) {
                Some(date) => {
                    let days = (date - chrono::NaiveDate::default()).num_days() as i32;
                    b.append_value(days);
                }
                None => b.append_null(),
            }
        }
        DataType::Timestamp(_, tz) => {
            let b = downcast::<TimestampMicrosecondBuilder>(builder)?;
            match value_str {
                // TIMESTAMP: epoch seconds as a float string
                Some(s) if tz.is_some() => match s.parse::<f64>() {
                    Ok(epoch_secs) => b.append_value((epoch_secs * 1_000_000.0) as i64),
                    Err(_) => {
                        warn!(value = s, "Failed to parse BigQuery TIMESTAMP value");
                        b.append_null();
                    }
                },
                // DATETIME: ISO-like civil time
                Some(s) => {
                    let parsed = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .or_else(|_| {
                            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                        });
                    match parsed {
                        Ok(dt) => b.append_value(dt.and_utc().timestamp_micros()),
                        Err(_) => {
                            warn!(value = s, "Failed to parse BigQuery DATETIME value");
                            b.append_null();
                        }
                    }
                }
                None => b.append_null(),
            }
        }
        DataType::Binary => {
            let b = downcast::<BinaryBuilder>(builder)?;
            match value_str {
                // BYTES are base64 encoded
                Some(s) => match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s) {
                    Ok(bytes) => b.append_value(&bytes),
                    Err(_) => b.append_value(s.as_bytes()),
                },
                None => b.append_null(),
            }
        }
        _ => {
            let b = downcast::<StringBuilder>(builder)?;
            match value_str {
                Some(s) => b.append_value(s),
                None => b.append_null(),
            }
        }
    }
    Ok(())
}
