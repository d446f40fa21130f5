//! Bounded registry of in-flight jobs.
//!
//! Every tracked job holds one permit of a semaphore sized to the pool's
//! concurrency, so the number of tracked jobs can never exceed it. Permits
//! are only returned when finished jobs are reaped by polling.

use super::wait::{format_elapsed, AssumeNo, Confirm, WaitOutcome};
use super::{JobError, JobFailure, JobPoolError, JobResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_POOL_POLL_INTERVAL: Duration = Duration::from_secs(2);

struct PoolEntry {
    job: JobResult,
    _slot: OwnedSemaphorePermit,
}

/// A free slot held for a job that is about to be submitted.
#[derive(Debug)]
pub struct SlotReservation {
    permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct JobPool {
    concurrency: usize,
    poll_interval: Duration,
    confirm: Arc<dyn Confirm>,
    slots: Arc<Semaphore>,
    jobs: Mutex<Vec<PoolEntry>>,
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.job, f)
    }
}

impl Default for JobPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl JobPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            concurrency,
            poll_interval: DEFAULT_POOL_POLL_INTERVAL,
            confirm: Arc::new(AssumeNo),
            slots: Arc::new(Semaphore::new(concurrency)),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Prompt used when a pool-wide wait is interrupted.
    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<PoolEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn in_flight(&self) -> usize {
        self.entries().len()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.get(job_id).is_some()
    }

    pub fn get(&self, job_id: &str) -> Option<JobResult> {
        self.entries()
            .iter()
            .find(|e| e.job.job_id() == job_id)
            .map(|e| e.job.clone())
    }

    /// Snapshot of tracked jobs.
    pub fn jobs(&self) -> Vec<JobResult> {
        self.entries().iter().map(|e| e.job.clone()).collect()
    }

    fn remove(&self, job_ids: &[String]) {
        self.entries()
            .retain(|e| !job_ids.iter().any(|id| id == e.job.job_id()));
    }

    /// Wait for a free slot, reaping finished jobs to make room.
    ///
    /// Fails with `JobsFailed` if a reaped job carries errors, and with
    /// `Interrupted` when `cancel` fires first.
    pub async fn reserve_slot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SlotReservation, JobPoolError> {
        loop {
            if cancel.is_cancelled() {
                return Err(JobPoolError::Interrupted);
            }
            if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
                return Ok(SlotReservation { permit });
            }
            if self.reap(true).await? > 0 {
                continue;
            }
            info!(in_flight = self.in_flight(), "Job pool is full, waiting for a free slot");
            tokio::select! {
                _ = cancel.cancelled() => return Err(JobPoolError::Interrupted),
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    let permit = permit.map_err(|_| JobPoolError::Interrupted)?;
                    return Ok(SlotReservation { permit });
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Track a job using a slot reserved beforehand. A job that is already
    /// tracked is returned as is and the reservation released.
    pub fn queue_reserved(&self, job: JobResult, reservation: SlotReservation) -> JobResult {
        let mut entries = self.entries();
        if let Some(existing) = entries.iter().find(|e| e.job.job_id() == job.job_id()) {
            return existing.job.clone();
        }
        entries.push(PoolEntry {
            job: job.clone(),
            _slot: reservation.permit,
        });
        job
    }

    /// Track a job, waiting for a free slot first. No-op for a job that is
    /// already tracked.
    #[tracing::instrument(name = "queue_job", skip(self, job, cancel), fields(job_id = %job.job_id()))]
    pub async fn queue_job(
        &self,
        job: JobResult,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JobPoolError> {
        if let Some(existing) = self.get(job.job_id()) {
            return Ok(existing);
        }
        let reservation = self.reserve_slot(cancel).await?;
        Ok(self.queue_reserved(job, reservation))
    }

    /// Poll every tracked job once and drop the finished ones. Returns how
    /// many were removed.
    async fn reap(&self, halt_on_error: bool) -> Result<usize, JobPoolError> {
        let mut finished = Vec::new();
        let mut failures = Vec::new();

        for job in self.jobs() {
            match job.status().await {
                Ok(status) if status.is_done() => {
                    if status.has_errors() {
                        failures.push(JobFailure {
                            job_id: job.job_id().to_string(),
                            errors: status.errors.clone(),
                        });
                    }
                    finished.push(job.job_id().to_string());
                }
                Ok(_) => {}
                Err(JobError::JobDoesNotExist { job_id }) => {
                    failures.push(JobFailure {
                        errors: vec![crate::warehouse::JobErrorDetail::new(format!(
                            "job {} does not exist",
                            job_id
                        ))],
                        job_id: job_id.clone(),
                    });
                    finished.push(job_id);
                }
                Err(e) => warn!(job_id = %job.job_id(), error = %e, "Failed to poll job"),
            }
        }

        self.remove(&finished);
        for failure in &failures {
            for detail in &failure.errors {
                error!(job_id = %failure.job_id, error = %detail, "Job failed");
            }
        }
        if halt_on_error && !failures.is_empty() {
            return Err(JobPoolError::JobsFailed(failures));
        }
        Ok(finished.len())
    }

    /// Poll tracked jobs until at most `concurrency - min_free_slots` remain.
    ///
    /// `None` drains the pool. Finished jobs are removed as they are seen;
    /// with `halt_on_error` the first poll that removes failed jobs returns
    /// `JobsFailed`, leaving unfinished jobs tracked.
    #[tracing::instrument(name = "wait_for_jobs", skip(self, cancel))]
    pub async fn wait_for_jobs(
        &self,
        min_free_slots: Option<usize>,
        halt_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, JobPoolError> {
        let min_free = min_free_slots
            .unwrap_or(self.concurrency)
            .min(self.concurrency);
        let target = self.concurrency - min_free;
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.interrupt().await);
            }
            self.reap(halt_on_error).await?;
            let in_flight = self.in_flight();
            if in_flight <= target {
                return Ok(WaitOutcome::Finished);
            }
            info!(
                in_flight,
                elapsed = %format_elapsed(started.elapsed()),
                "Waiting for jobs"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(self.interrupt().await),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Wait for one job and remove it from the pool once it finishes.
    pub async fn wait_for_job(
        &self,
        job: &JobResult,
        halt_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, JobPoolError> {
        let outcome = match job.wait(cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, JobError::JobDoesNotExist { .. }) {
                    self.remove(&[job.job_id().to_string()]);
                }
                return Err(e.into());
            }
        };

        match outcome {
            WaitOutcome::Finished => {
                self.remove(&[job.job_id().to_string()]);
                let errors = job.errors();
                for detail in &errors {
                    error!(job_id = %job.job_id(), error = %detail, "Job failed");
                }
                if halt_on_error && !errors.is_empty() {
                    return Err(JobPoolError::JobsFailed(vec![JobFailure {
                        job_id: job.job_id().to_string(),
                        errors,
                    }]));
                }
            }
            WaitOutcome::Interrupted {
                cancelled_remote: true,
            } => self.remove(&[job.job_id().to_string()]),
            WaitOutcome::Interrupted { .. } => {}
        }
        Ok(outcome)
    }

    /// Offer to cancel every tracked job. Declining leaves them tracked.
    async fn interrupt(&self) -> WaitOutcome {
        let jobs = self.jobs();
        let prompt = format!("Cancel {} running job(s) in the warehouse?", jobs.len());
        if jobs.is_empty() || !self.confirm.confirm(&prompt) {
            info!(in_flight = jobs.len(), "Wait interrupted; jobs left running");
            return WaitOutcome::Interrupted {
                cancelled_remote: false,
            };
        }

        let mut cancelled = Vec::new();
        for job in &jobs {
            match job.warehouse().cancel_job(job.handle()).await {
                Ok(()) => cancelled.push(job.job_id().to_string()),
                Err(e) => warn!(job_id = %job.job_id(), error = %e, "Failed to cancel job"),
            }
        }
        info!(cancelled = cancelled.len(), "Cancelled jobs");
        self.remove(&cancelled);
        WaitOutcome::Interrupted {
            cancelled_remote: !cancelled.is_empty(),
        }
    }
}
