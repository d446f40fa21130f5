//! Wrapper around one submitted warehouse job.

use super::wait::{available_memory, format_elapsed, WaitOutcome, WaitSettings};
use super::{JobError, JobState, QueryOutput, ResultFormat};
use crate::warehouse::{JobErrorDetail, JobHandle, JobStatus, ResultSet, Warehouse};
use futures::future::BoxFuture;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Invoked with the materialized result once the job's results resolve.
pub type ResultCallback = Arc<dyn Fn(ResultSet, JobResult) -> BoxFuture<'static, ()> + Send + Sync>;

struct Inner {
    warehouse: Arc<dyn Warehouse>,
    handle: JobHandle,
    query: Option<String>,
    settings: WaitSettings,
    last_status: Mutex<Option<JobStatus>>,
    state: Mutex<JobState>,
    callbacks: Mutex<Vec<ResultCallback>>,
    materialized: tokio::sync::Mutex<Option<ResultSet>>,
}

/// A submitted job. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobResult {
    inner: Arc<Inner>,
}

impl Debug for JobResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResult")
            .field("job_id", &self.inner.handle.job_id)
            .field("state", &self.last_known_state())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn same_callback(a: &ResultCallback, b: &ResultCallback) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl JobResult {
    pub fn new(warehouse: Arc<dyn Warehouse>, handle: JobHandle, settings: WaitSettings) -> Self {
        Self::build(warehouse, handle, settings, None)
    }

    /// Like [`new`](Self::new), keeping the SQL text for diagnostics.
    pub fn with_query(
        warehouse: Arc<dyn Warehouse>,
        handle: JobHandle,
        settings: WaitSettings,
        query: impl Into<String>,
    ) -> Self {
        Self::build(warehouse, handle, settings, Some(query.into()))
    }

    fn build(
        warehouse: Arc<dyn Warehouse>,
        handle: JobHandle,
        settings: WaitSettings,
        query: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                warehouse,
                handle,
                query,
                settings,
                last_status: Mutex::new(None),
                state: Mutex::new(JobState::Pending),
                callbacks: Mutex::new(Vec::new()),
                materialized: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.handle.job_id
    }

    pub fn handle(&self) -> &JobHandle {
        &self.inner.handle
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.query.as_deref()
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.inner.warehouse
    }

    /// Poll the warehouse once and record what it reports.
    pub async fn status(&self) -> Result<JobStatus, JobError> {
        let status = self
            .inner
            .warehouse
            .job_status(&self.inner.handle)
            .await
            .map_err(|e| JobError::from_warehouse(self.job_id(), e))?;

        {
            let mut state = lock(&self.inner.state);
            *state = state.advance(JobState::from_status(&status));
        }
        *lock(&self.inner.last_status) = Some(status.clone());
        Ok(status)
    }

    /// Poll once; true when the job is done (with or without errors).
    pub async fn is_finished(&self) -> Result<bool, JobError> {
        Ok(self.state().await?.is_finished())
    }

    /// Poll once and return the current state.
    pub async fn state(&self) -> Result<JobState, JobError> {
        self.status().await?;
        Ok(self.last_known_state())
    }

    /// State as of the last poll, without contacting the warehouse.
    pub fn last_known_state(&self) -> JobState {
        *lock(&self.inner.state)
    }

    /// Status as of the last poll.
    pub fn last_status(&self) -> Option<JobStatus> {
        lock(&self.inner.last_status).clone()
    }

    /// Errors reported by the last poll.
    pub fn errors(&self) -> Vec<JobErrorDetail> {
        lock(&self.inner.last_status)
            .as_ref()
            .map(|s| s.errors.clone())
            .unwrap_or_default()
    }

    /// Register a callback to run when results resolve. Registering the same
    /// `Arc` twice is a no-op. Returns whether the callback was added.
    pub fn register_on_results_callback(&self, callback: ResultCallback) -> bool {
        let mut callbacks = lock(&self.inner.callbacks);
        if callbacks.iter().any(|c| same_callback(c, &callback)) {
            return false;
        }
        callbacks.push(callback);
        true
    }

    pub fn pending_callbacks(&self) -> usize {
        lock(&self.inner.callbacks).len()
    }

    /// Poll until the job finishes or `cancel` fires.
    ///
    /// On cancellation the configured [`Confirm`](super::Confirm) decides
    /// whether the remote job is cancelled too; the wait then returns
    /// `Interrupted` without error either way.
    #[tracing::instrument(name = "job_wait", skip(self, cancel), fields(job_id = %self.job_id()))]
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<WaitOutcome, JobError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Ok(self.interrupt().await);
            }
            if self.state().await?.is_finished() {
                return Ok(WaitOutcome::Finished);
            }
            info!(
                job_id = %self.job_id(),
                state = %self.last_known_state(),
                elapsed = %format_elapsed(started.elapsed()),
                "Waiting for job"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(self.interrupt().await),
                _ = tokio::time::sleep(self.inner.settings.poll_interval) => {}
            }
        }
    }

    /// Ask whether to cancel the remote job after an interrupt.
    pub(crate) async fn interrupt(&self) -> WaitOutcome {
        let prompt = format!("Cancel job {} in the warehouse?", self.job_id());
        if !self.inner.settings.confirm.confirm(&prompt) {
            info!(job_id = %self.job_id(), "Wait interrupted; job left running");
            return WaitOutcome::Interrupted {
                cancelled_remote: false,
            };
        }
        match self.inner.warehouse.cancel_job(&self.inner.handle).await {
            Ok(()) => {
                info!(job_id = %self.job_id(), "Job cancelled");
                WaitOutcome::Interrupted {
                    cancelled_remote: true,
                }
            }
            Err(e) => {
                warn!(job_id = %self.job_id(), error = %e, "Failed to cancel job");
                WaitOutcome::Interrupted {
                    cancelled_remote: false,
                }
            }
        }
    }

    /// Wait for the job, download its result and fire pending callbacks.
    ///
    /// Returns `Ok(None)` when interrupted. The downloaded result is kept, so
    /// later calls do not hit the warehouse again.
    #[tracing::instrument(name = "job_results", skip(self, cancel), fields(job_id = %self.job_id(), rows))]
    pub async fn results(
        &self,
        format: ResultFormat,
        cancel: &CancellationToken,
    ) -> Result<Option<QueryOutput>, JobError> {
        let rows = {
            let mut materialized = self.inner.materialized.lock().await;
            match materialized.as_ref() {
                Some(rows) => rows.clone(),
                None => {
                    if self.wait(cancel).await?.is_interrupted() {
                        return Ok(None);
                    }
                    let rows = self.download().await?;
                    *materialized = Some(rows.clone());
                    rows
                }
            }
        };
        tracing::Span::current().record("rows", rows.num_rows());

        let callbacks: Vec<ResultCallback> = std::mem::take(&mut *lock(&self.inner.callbacks));
        for callback in callbacks {
            callback(rows.clone(), self.clone()).await;
        }

        QueryOutput::render(&rows, format).map(Some)
    }

    /// Provide a result obtained elsewhere (e.g. from the cache).
    pub async fn set_results(&self, rows: ResultSet) {
        *self.inner.materialized.lock().await = Some(rows);
    }

    async fn download(&self) -> Result<ResultSet, JobError> {
        let errors = self.errors();
        if !errors.is_empty() {
            return Err(JobError::Failed {
                job_id: self.job_id().to_string(),
                errors,
            });
        }

        let warehouse = &self.inner.warehouse;
        let size = warehouse
            .result_size(&self.inner.handle)
            .await
            .map_err(|e| JobError::from_warehouse(self.job_id(), e))?;
        let available = self.inner.settings.max_result_bytes.or_else(available_memory);
        if let (Some(result_bytes), Some(available_bytes)) = (size, available) {
            if result_bytes > available_bytes {
                return Err(JobError::ResultsTooBig {
                    job_id: self.job_id().to_string(),
                    result_bytes,
                    available_bytes,
                });
            }
        }

        warehouse
            .fetch_results(&self.inner.handle)
            .await
            .map_err(|e| JobError::from_warehouse(self.job_id(), e))
    }
}
