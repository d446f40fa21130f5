use bqt::cache::{
    resolve, CacheBackend, CacheError, LocalDiskCache, ManualClock, RemoteTableCache, Ttl,
};
use bqt::diagnostics::explain_query_error;
use bqt::job::{AssumeNo, AssumeYes, ResultFormat};
use bqt::partition::PartitionSelection;
use bqt::warehouse::{MemoryWarehouse, ResultSet, TableRef, Warehouse, WarehouseError};
use bqt::{Bqt, CacheMode, QueryOptions};
use chrono::{TimeZone, Utc};
use datafusion::arrow::array::Int64Array;
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: TempDir,
    warehouse: Arc<MemoryWarehouse>,
    client: Bqt,
}

fn local_harness(clock: Option<Arc<ManualClock>>, ttl: Ttl) -> Harness {
    let dir = TempDir::new().unwrap();
    let warehouse = Arc::new(MemoryWarehouse::new());
    let mut cache = LocalDiskCache::new(dir.path(), warehouse.clone())
        .unwrap()
        .with_ttl(ttl)
        .with_sweep(0.0, Duration::from_secs(3600));
    let mut builder = Bqt::builder(warehouse.clone())
        .poll_interval(Duration::from_millis(5))
        .pool_poll_interval(Duration::from_millis(5));
    if let Some(clock) = clock {
        cache = cache.with_clock(clock.clone());
        builder = builder.clock(clock);
    }
    let client = builder.cache(Arc::new(cache)).build();
    Harness {
        _dir: dir,
        warehouse,
        client,
    }
}

fn single_column(values: Vec<i64>) -> ResultSet {
    let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))]).unwrap();
    ResultSet::new(schema, vec![batch])
}

#[tokio::test]
async fn test_equivalent_queries_share_cache_entry() {
    let h = local_harness(None, Ttl::Never);
    let cancel = CancellationToken::new();
    let options = QueryOptions::default();

    let first = h.client.submit("SELECT  1", &options, &cancel).await.unwrap();
    assert!(!first.is_cached());
    let rows = first.results(ResultFormat::Arrow, &cancel).await.unwrap().unwrap();
    assert_eq!(rows.num_rows(), 1);
    assert_eq!(h.warehouse.job_count(), 1);

    let second = h.client.submit("select 1", &options, &cancel).await.unwrap();
    assert!(second.is_cached());
    let rows = second.results(ResultFormat::JsonRows, &cancel).await.unwrap().unwrap();
    assert_eq!(rows.num_rows(), 1);
    assert_eq!(h.warehouse.job_count(), 1);
}

#[tokio::test]
async fn test_renew_and_bypass() {
    let h = local_harness(None, Ttl::Never);
    let cancel = CancellationToken::new();
    let sql = "SELECT 7 AS lucky";
    let key = resolve(sql);

    h.client
        .query(sql, &QueryOptions::default().with_cache(CacheMode::Bypass), &cancel)
        .await
        .unwrap();
    assert!(!h.client.cache().hit(&key).await.unwrap());

    h.client.query(sql, &QueryOptions::default(), &cancel).await.unwrap();
    let first_job = h.client.cache().fetch(&key).await.unwrap().metadata.job_id;

    let renewed = h
        .client
        .submit(sql, &QueryOptions::default().with_cache(CacheMode::Renew), &cancel)
        .await
        .unwrap();
    assert!(!renewed.is_cached());
    renewed.results(ResultFormat::Arrow, &cancel).await.unwrap();

    let second_job = h.client.cache().fetch(&key).await.unwrap().metadata.job_id;
    assert_ne!(first_job, second_job);
    assert_eq!(h.warehouse.job_count(), 3);
}

#[tokio::test]
async fn test_stale_entry_runs_query_again() {
    let h = local_harness(None, Ttl::Never);
    let cancel = CancellationToken::new();
    let sql = "SELECT 3 AS three";

    let first = h.client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap();
    first.results(ResultFormat::Arrow, &cancel).await.unwrap();
    let job_id = first.job().unwrap().job_id().to_string();
    h.warehouse.forget_job(&job_id);

    let second = h.client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap();
    assert!(!second.is_cached());
    let output = second.results(ResultFormat::Arrow, &cancel).await.unwrap().unwrap();
    assert_eq!(output.num_rows(), 1);

    let third = h.client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap();
    assert!(third.is_cached());
}

#[tokio::test]
async fn test_ttl_expiry_through_facade() {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let h = local_harness(Some(clock.clone()), Ttl::Seconds(60));
    let cancel = CancellationToken::new();
    let sql = "SELECT 5 AS five";

    h.client.query(sql, &QueryOptions::default(), &cancel).await.unwrap();

    clock.set(start + chrono::Duration::seconds(59));
    assert!(h.client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap().is_cached());

    clock.set(start + chrono::Duration::seconds(61));
    assert!(!h.client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap().is_cached());
}

#[tokio::test]
async fn test_remote_cache_uses_cache_table_as_destination() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cache = Arc::new(
        RemoteTableCache::new(warehouse.clone(), Some("query_cache".into()))
            .with_poll_interval(Duration::from_millis(5)),
    );
    let client = Bqt::builder(warehouse.clone())
        .cache(cache.clone())
        .poll_interval(Duration::from_millis(5))
        .build();
    let cancel = CancellationToken::new();
    let sql = "SELECT 11 AS eleven";

    let first = client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap();
    first.results(ResultFormat::Arrow, &cancel).await.unwrap();
    let status = first.job().unwrap().last_status().unwrap();
    assert_eq!(status.destination, Some(cache.table_for(&resolve(sql)).unwrap()));

    let second = client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap();
    assert!(second.is_cached());
    let output = second.results(ResultFormat::JsonRows, &cancel).await.unwrap().unwrap();
    assert_eq!(output.as_json_rows().unwrap()[0]["eleven"], serde_json::json!(11));

    assert!(client.clear_cache(sql).await.unwrap());
    assert!(!client.submit(sql, &QueryOptions::default(), &cancel).await.unwrap().is_cached());
}

#[tokio::test]
async fn test_facade_bounds_in_flight_jobs() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_execution_delay(Duration::from_millis(20));
    let client = Bqt::builder(warehouse.clone())
        .concurrency(10)
        .poll_interval(Duration::from_millis(5))
        .pool_poll_interval(Duration::from_millis(5))
        .build();
    let cancel = CancellationToken::new();

    for i in 0..25 {
        let sql = format!("SELECT {} AS n", i);
        client.submit(&sql, &QueryOptions::default(), &cancel).await.unwrap();
        assert!(client.pool().in_flight() <= 10);
    }
    client.wait_for_jobs(None, true, &cancel).await.unwrap();
    assert_eq!(client.pool().in_flight(), 0);
}

#[tokio::test]
async fn test_query_errors_are_explained() {
    let h = local_harness(None, Ttl::Never);
    let cancel = CancellationToken::new();
    let sql = "SELEC 1";

    let err = h
        .client
        .query(sql, &QueryOptions::default(), &cancel)
        .await
        .unwrap_err();
    let text = explain_query_error(&err, Some(sql));
    assert!(text.contains("invalidQuery"), "{}", text);
    assert!(!h.client.cache().hit(&resolve(sql)).await.unwrap());

    h.warehouse
        .set_submit_failure(Some(WarehouseError::Forbidden("bigquery.jobs.create".into())));
    let err = h
        .client
        .query("SELECT 1", &QueryOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(explain_query_error(&err, None).starts_with("Access denied"));
    h.warehouse.set_submit_failure(None);
    h.client.wait_for_jobs(None, false, &cancel).await.ok();
    assert_eq!(h.client.pool().in_flight(), 0);
}

#[tokio::test]
async fn test_delete_partition_range() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    for day in 1..=5 {
        let table = TableRef::new("finance", format!("transactions_2024010{}", day));
        warehouse.register_table(&table, single_column(vec![day])).unwrap();
    }
    warehouse
        .register_table(&TableRef::new("finance", "transactions"), single_column(vec![0]))
        .unwrap();
    let client = Bqt::builder(warehouse.clone()).build();

    let selection = PartitionSelection {
        start: chrono::NaiveDate::from_ymd_opt(2024, 1, 2),
        end: chrono::NaiveDate::from_ymd_opt(2024, 1, 4),
        ..PartitionSelection::table("finance", "transactions")
    };

    let declined = client.delete_tables(&selection, &AssumeNo).await.unwrap();
    assert!(declined.is_empty());
    assert_eq!(warehouse.list_tables("finance").await.unwrap().len(), 6);

    let deleted = client.delete_tables(&selection, &AssumeYes).await.unwrap();
    let names: Vec<&str> = deleted.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(
        names,
        vec!["transactions_20240102", "transactions_20240103", "transactions_20240104"]
    );

    let remaining: Vec<String> = warehouse
        .list_tables("finance")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.table)
        .collect();
    assert_eq!(
        remaining,
        vec!["transactions", "transactions_20240101", "transactions_20240105"]
    );
}

#[tokio::test]
async fn test_remote_cache_without_dataset_fails_query() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let client = Bqt::builder(warehouse.clone())
        .cache(Arc::new(RemoteTableCache::new(warehouse.clone(), None)))
        .poll_interval(Duration::from_millis(5))
        .build();
    let cancel = CancellationToken::new();

    for mode in [CacheMode::Use, CacheMode::Renew] {
        let options = QueryOptions::default().with_cache(mode);
        let err = client.query("SELECT 1 AS one", &options, &cancel).await.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<CacheError>(), Some(CacheError::CacheNotConfigured(_))),
            "unexpected error: {err:#}"
        );
    }
    assert_eq!(warehouse.job_count(), 0);

    let options = QueryOptions::default().with_cache(CacheMode::Bypass);
    let rows = client.query("SELECT 1 AS one", &options, &cancel).await.unwrap().unwrap();
    assert_eq!(rows.num_rows(), 1);
}
