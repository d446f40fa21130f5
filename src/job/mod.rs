//! Query job lifecycle: [`JobResult`] wraps one submitted warehouse job and
//! [`JobPool`] bounds how many are in flight at once.

mod error;
mod pool;
mod result;
mod wait;

pub use error::{JobError, JobFailure, JobPoolError};
pub use pool::{JobPool, SlotReservation, DEFAULT_CONCURRENCY, DEFAULT_POOL_POLL_INTERVAL};
pub use result::{JobResult, ResultCallback};
pub use wait::{
    format_elapsed, AssumeNo, AssumeYes, Confirm, WaitOutcome, WaitSettings,
    DEFAULT_POLL_INTERVAL,
};

use crate::warehouse::{JobStatus, ResultSet};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};

/// Observable state of a job.
///
/// Ordered by progress; a [`JobResult`] never reports a state lower than one
/// it already reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    Pending,
    Running,
    FinishedSuccess,
    FinishedError,
}

impl JobState {
    /// Derive the state from a single status poll.
    pub fn from_status(status: &JobStatus) -> Self {
        if status.is_done() {
            if status.has_errors() {
                JobState::FinishedError
            } else {
                JobState::FinishedSuccess
            }
        } else if status.started_at.is_some() {
            JobState::Running
        } else {
            JobState::Pending
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::FinishedSuccess | JobState::FinishedError)
    }

    /// Combine a newly observed state with the last reported one.
    pub(crate) fn advance(self, observed: JobState) -> JobState {
        if self.is_finished() {
            self
        } else {
            self.max(observed)
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::FinishedSuccess => "finished_success",
            JobState::FinishedError => "finished_error",
        })
    }
}

/// Shape in which query results are handed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultFormat {
    #[default]
    Arrow,
    JsonRows,
}

#[derive(Debug, Clone)]
pub enum QueryOutput {
    Arrow(ResultSet),
    JsonRows(Vec<Map<String, Value>>),
}

impl QueryOutput {
    pub fn render(rows: &ResultSet, format: ResultFormat) -> Result<Self, JobError> {
        Ok(match format {
            ResultFormat::Arrow => QueryOutput::Arrow(rows.clone()),
            ResultFormat::JsonRows => QueryOutput::JsonRows(
                rows.to_json_rows()
                    .map_err(|e| JobError::Conversion(e.to_string()))?,
            ),
        })
    }

    pub fn num_rows(&self) -> usize {
        match self {
            QueryOutput::Arrow(rows) => rows.num_rows(),
            QueryOutput::JsonRows(rows) => rows.len(),
        }
    }

    pub fn as_arrow(&self) -> Option<&ResultSet> {
        match self {
            QueryOutput::Arrow(rows) => Some(rows),
            QueryOutput::JsonRows(_) => None,
        }
    }

    pub fn as_json_rows(&self) -> Option<&[Map<String, Value>]> {
        match self {
            QueryOutput::Arrow(_) => None,
            QueryOutput::JsonRows(rows) => Some(rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{JobErrorDetail, JobHandle, JobKind, RemoteJobState};
    use chrono::Utc;

    fn status(state: RemoteJobState, started: bool, errors: bool) -> JobStatus {
        JobStatus {
            handle: JobHandle::new("bqt_job_test"),
            kind: JobKind::Query,
            state,
            errors: if errors {
                vec![JobErrorDetail::new("boom")]
            } else {
                vec![]
            },
            created_at: Some(Utc::now()),
            started_at: started.then(Utc::now),
            ended_at: None,
            destination: None,
            total_bytes_processed: None,
        }
    }

    #[test]
    fn test_state_derivation() {
        assert_eq!(
            JobState::from_status(&status(RemoteJobState::Pending, false, false)),
            JobState::Pending
        );
        assert_eq!(
            JobState::from_status(&status(RemoteJobState::Running, true, false)),
            JobState::Running
        );
        assert_eq!(
            JobState::from_status(&status(RemoteJobState::Done, true, false)),
            JobState::FinishedSuccess
        );
        assert_eq!(
            JobState::from_status(&status(RemoteJobState::Done, true, true)),
            JobState::FinishedError
        );
    }

    #[test]
    fn test_state_never_regresses() {
        assert_eq!(JobState::Running.advance(JobState::Pending), JobState::Running);
        assert_eq!(
            JobState::FinishedSuccess.advance(JobState::Running),
            JobState::FinishedSuccess
        );
        assert_eq!(
            JobState::FinishedError.advance(JobState::FinishedSuccess),
            JobState::FinishedError
        );
        assert_eq!(JobState::Pending.advance(JobState::Running), JobState::Running);
    }
}
