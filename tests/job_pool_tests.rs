use bqt::job::{
    AssumeNo, AssumeYes, JobError, JobPool, JobPoolError, JobResult, JobState, QueryOutput,
    ResultCallback, ResultFormat, WaitOutcome, WaitSettings,
};
use bqt::warehouse::{JobConfig, MemoryWarehouse, ResultSet, Warehouse};
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_settings() -> WaitSettings {
    WaitSettings {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

async fn submit(warehouse: &Arc<MemoryWarehouse>, sql: &str, settings: WaitSettings) -> JobResult {
    let handle = warehouse
        .submit_query(sql, &JobConfig::default())
        .await
        .unwrap();
    JobResult::with_query(warehouse.clone(), handle, settings, sql)
}

fn counting_callback(counter: Arc<AtomicUsize>) -> ResultCallback {
    Arc::new(move |rows: ResultSet, _job: JobResult| {
        let counter = counter.clone();
        async move {
            assert_eq!(rows.num_rows(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_results_fire_callbacks_once() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let job = submit(&warehouse, "SELECT 42 AS answer", fast_settings()).await;
    let cancel = CancellationToken::new();

    let fired = Arc::new(AtomicUsize::new(0));
    let callback = counting_callback(fired.clone());
    assert!(job.register_on_results_callback(callback.clone()));
    assert!(!job.register_on_results_callback(callback));
    assert_eq!(job.pending_callbacks(), 1);

    let output = job.results(ResultFormat::Arrow, &cancel).await.unwrap().unwrap();
    assert_eq!(output.num_rows(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(job.last_known_state(), JobState::FinishedSuccess);

    // Served from the materialized result; callbacks are not invoked again.
    warehouse.forget_job(job.job_id());
    let again = job.results(ResultFormat::JsonRows, &cancel).await.unwrap().unwrap();
    let rows = again.as_json_rows().unwrap();
    assert_eq!(rows[0]["answer"], serde_json::json!(42));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_state_progresses_monotonically() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_execution_delay(Duration::from_millis(100));
    let job = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;

    assert_eq!(job.state().await.unwrap(), JobState::Pending);
    assert!(!job.is_finished().await.unwrap());

    let mut seen = vec![JobState::Pending];
    while !job.is_finished().await.unwrap() {
        seen.push(job.last_known_state());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    seen.push(job.last_known_state());

    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&JobState::FinishedSuccess));
}

#[tokio::test]
async fn test_failed_job_reports_errors() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let job = submit(&warehouse, "SELEC oops", fast_settings()).await;
    let cancel = CancellationToken::new();

    let fired = Arc::new(AtomicUsize::new(0));
    job.register_on_results_callback(counting_callback(fired.clone()));

    match job.results(ResultFormat::Arrow, &cancel).await {
        Err(JobError::Failed { errors, .. }) => {
            assert_eq!(errors[0].reason.as_deref(), Some("invalidQuery"));
        }
        other => panic!("expected failure, got {:?}", other.map(|o| o.map(|o| o.num_rows()))),
    }
    assert_eq!(job.last_known_state(), JobState::FinishedError);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_job_is_reported() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let job = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    warehouse.forget_job(job.job_id());

    let err = job
        .results(ResultFormat::Arrow, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::JobDoesNotExist { .. }));
}

#[tokio::test]
async fn test_oversized_result_is_refused() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let settings = WaitSettings {
        max_result_bytes: Some(1),
        ..fast_settings()
    };
    let job = submit(&warehouse, "SELECT 'a fairly long string' AS s", settings).await;

    let err = job
        .results(ResultFormat::Arrow, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        JobError::ResultsTooBig {
            result_bytes,
            available_bytes,
            ..
        } => {
            assert_eq!(available_bytes, 1);
            assert!(result_bytes > 1);
        }
        other => panic!("expected ResultsTooBig, got {:?}", other),
    }
}

#[tokio::test]
async fn test_interrupt_with_and_without_remote_cancel() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_execution_delay(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let declined = submit(
        &warehouse,
        "SELECT 1 AS one",
        WaitSettings {
            confirm: Arc::new(AssumeNo),
            ..fast_settings()
        },
    )
    .await;
    assert!(declined.results(ResultFormat::Arrow, &cancel).await.unwrap().is_none());
    assert_eq!(declined.state().await.unwrap(), JobState::Pending);

    let accepted = submit(
        &warehouse,
        "SELECT 1 AS one",
        WaitSettings {
            confirm: Arc::new(AssumeYes),
            ..fast_settings()
        },
    )
    .await;
    assert_eq!(
        accepted.wait(&cancel).await.unwrap(),
        WaitOutcome::Interrupted {
            cancelled_remote: true
        }
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    let status = accepted.status().await.unwrap();
    assert!(status.is_done());
    assert_eq!(status.errors[0].reason.as_deref(), Some("stopped"));
}

#[tokio::test]
async fn test_pool_never_exceeds_concurrency() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_execution_delay(Duration::from_millis(30));
    let pool = JobPool::new(10).with_poll_interval(Duration::from_millis(5));
    let cancel = CancellationToken::new();

    let mut max_in_flight = 0;
    for i in 0..25 {
        let reservation = pool.reserve_slot(&cancel).await.unwrap();
        let job = submit(&warehouse, &format!("SELECT {} AS n", i), fast_settings()).await;
        pool.queue_reserved(job, reservation);
        max_in_flight = max_in_flight.max(pool.in_flight());
        assert!(pool.in_flight() <= 10);
    }
    assert_eq!(max_in_flight, 10);

    let outcome = pool.wait_for_jobs(None, true, &cancel).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Finished);
    assert_eq!(pool.in_flight(), 0);
    assert_eq!(warehouse.job_count(), 25);
}

#[tokio::test]
async fn test_queue_job_waits_for_a_reaped_slot() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pool = JobPool::new(2).with_poll_interval(Duration::from_millis(5));
    let cancel = CancellationToken::new();

    warehouse.set_execution_delay(Duration::from_millis(80));
    let first = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    let second = submit(&warehouse, "SELECT 2 AS two", fast_settings()).await;
    warehouse.set_execution_delay(Duration::ZERO);
    pool.queue_job(first.clone(), &cancel).await.unwrap();
    pool.queue_job(second.clone(), &cancel).await.unwrap();
    assert_eq!(pool.in_flight(), 2);

    let third = submit(&warehouse, "SELECT 3 AS three", fast_settings()).await;
    let blocked =
        tokio::time::timeout(Duration::from_millis(20), pool.queue_job(third.clone(), &cancel)).await;
    assert!(blocked.is_err(), "queue_job must wait while the pool is full");
    assert_eq!(pool.in_flight(), 2);
    assert!(!pool.contains(third.job_id()));

    pool.queue_job(third.clone(), &cancel).await.unwrap();
    assert!(pool.contains(third.job_id()));
    assert!(pool.in_flight() <= 2);
    assert!(first.is_finished().await.unwrap() || second.is_finished().await.unwrap());
}

#[tokio::test]
async fn test_queue_job_is_idempotent() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_execution_delay(Duration::from_secs(30));
    let pool = JobPool::new(2);
    let cancel = CancellationToken::new();

    let job = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    pool.queue_job(job.clone(), &cancel).await.unwrap();
    let again = pool.queue_job(job.clone(), &cancel).await.unwrap();
    assert_eq!(again.job_id(), job.job_id());
    assert_eq!(pool.in_flight(), 1);
    assert!(pool.contains(job.job_id()));
}

#[tokio::test]
async fn test_wait_for_jobs_halts_on_error() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pool = JobPool::new(10).with_poll_interval(Duration::from_millis(5));
    let cancel = CancellationToken::new();

    let bad = submit(&warehouse, "SELEC broken", fast_settings()).await;
    let good = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    pool.queue_job(bad.clone(), &cancel).await.unwrap();
    pool.queue_job(good.clone(), &cancel).await.unwrap();

    let mut failures = None;
    for _ in 0..200 {
        match pool.wait_for_jobs(None, true, &cancel).await {
            Err(JobPoolError::JobsFailed(f)) => {
                failures = Some(f);
                break;
            }
            Ok(_) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    let failures = failures.expect("failed job should halt the wait");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job_id, bad.job_id());
    assert!(!pool.contains(bad.job_id()));
}

#[tokio::test]
async fn test_wait_for_jobs_leaves_slots_free() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pool = JobPool::new(4).with_poll_interval(Duration::from_millis(5));
    let cancel = CancellationToken::new();

    warehouse.set_execution_delay(Duration::from_secs(30));
    let slow = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    warehouse.set_execution_delay(Duration::ZERO);
    pool.queue_job(slow.clone(), &cancel).await.unwrap();
    for _ in 0..3 {
        let job = submit(&warehouse, "SELECT 2 AS two", fast_settings()).await;
        pool.queue_job(job, &cancel).await.unwrap();
    }

    pool.wait_for_jobs(Some(3), false, &cancel).await.unwrap();
    assert_eq!(pool.in_flight(), 1);
    assert!(pool.contains(slow.job_id()));
}

#[tokio::test]
async fn test_wait_for_job_removes_it() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pool = JobPool::new(3);
    let cancel = CancellationToken::new();

    let job = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    pool.queue_job(job.clone(), &cancel).await.unwrap();
    let outcome = pool.wait_for_job(&job, true, &cancel).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Finished);
    assert_eq!(pool.in_flight(), 0);

    let output = job.results(ResultFormat::Arrow, &cancel).await.unwrap();
    assert!(matches!(output, Some(QueryOutput::Arrow(_))));
}

#[tokio::test]
async fn test_interrupted_pool_wait_keeps_jobs_when_declined() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_execution_delay(Duration::from_secs(30));
    let pool = JobPool::new(3).with_confirm(Arc::new(AssumeNo));
    let cancel = CancellationToken::new();

    let job = submit(&warehouse, "SELECT 1 AS one", fast_settings()).await;
    pool.queue_job(job.clone(), &cancel).await.unwrap();

    cancel.cancel();
    let outcome = pool.wait_for_jobs(None, false, &cancel).await.unwrap();
    assert!(outcome.is_interrupted());
    assert!(pool.contains(job.job_id()));
    assert!(matches!(
        pool.reserve_slot(&cancel).await,
        Err(JobPoolError::Interrupted)
    ));
}
