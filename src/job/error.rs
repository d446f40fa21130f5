//! Error types for job results and the job pool

use crate::warehouse::{JobErrorDetail, WarehouseError};
use thiserror::Error;

fn join_errors(errors: &[JobErrorDetail]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum JobError {
    /// The warehouse no longer knows the job (expired or never existed)
    #[error("job {job_id} does not exist")]
    JobDoesNotExist { job_id: String },

    /// Result is larger than the memory available to download it
    #[error(
        "results of job {job_id} are too big to load: {result_bytes} bytes, {available_bytes} bytes available"
    )]
    ResultsTooBig {
        job_id: String,
        result_bytes: u64,
        available_bytes: u64,
    },

    /// The job finished with errors
    #[error("job {job_id} failed: {}", join_errors(.errors))]
    Failed {
        job_id: String,
        errors: Vec<JobErrorDetail>,
    },

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("result conversion failed: {0}")]
    Conversion(String),
}

impl JobError {
    /// Translate a warehouse error for `job_id`, mapping not-found onto
    /// [`JobError::JobDoesNotExist`].
    pub fn from_warehouse(job_id: &str, e: WarehouseError) -> Self {
        if e.is_not_found() {
            JobError::JobDoesNotExist {
                job_id: job_id.to_string(),
            }
        } else {
            JobError::Warehouse(e)
        }
    }
}

fn describe_failures(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.job_id, join_errors(&f.errors)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A job that finished with errors while draining the pool.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub job_id: String,
    pub errors: Vec<JobErrorDetail>,
}

#[derive(Debug, Error)]
pub enum JobPoolError {
    #[error("{} job(s) failed: {}", .0.len(), describe_failures(.0))]
    JobsFailed(Vec<JobFailure>),

    /// Cancelled while waiting for a free slot; nothing was queued
    #[error("interrupted while waiting for a free job slot")]
    Interrupted,

    #[error(transparent)]
    Job(#[from] JobError),
}
