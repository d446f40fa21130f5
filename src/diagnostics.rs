//! Human-readable explanations of warehouse errors.
//!
//! Syntax errors reported by the warehouse carry a `[line:col]` position;
//! when the query text is known the offending line is shown with a caret
//! under the reported column.

use crate::job::JobError;
use crate::warehouse::{JobErrorDetail, WarehouseError};
use regex::Regex;
use std::sync::LazyLock;

static POSITION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[(\d+):(\d+)\]").ok());

/// Locate the `[line:col]` position in `message` and render that line of
/// `sql` with a caret. Lines and columns are 1-based.
pub fn pinpoint(message: &str, sql: &str) -> Option<String> {
    let caps = POSITION.as_ref()?.captures(message)?;
    let line_no: usize = caps.get(1)?.as_str().parse().ok()?;
    let col: usize = caps.get(2)?.as_str().parse().ok()?;
    let line = sql.lines().nth(line_no.checked_sub(1)?)?;

    let gutter = format!("{:>4} | ", line_no);
    let caret_offset = line.chars().take(col.saturating_sub(1)).count();
    Some(format!(
        "{}{}\n{}^",
        gutter,
        line,
        " ".repeat(gutter.len() + caret_offset)
    ))
}

fn with_context(summary: String, message: &str, sql: Option<&str>) -> String {
    match sql.and_then(|sql| pinpoint(message, sql)) {
        Some(snippet) => format!("{}\n{}", summary, snippet),
        None => summary,
    }
}

/// Explain a warehouse error, pointing into `sql` for syntax errors.
pub fn explain(err: &WarehouseError, sql: Option<&str>) -> String {
    match err {
        WarehouseError::NotFound(msg) => format!(
            "Not found: {}. Check that the project, dataset, table or job exists.",
            msg
        ),
        WarehouseError::Forbidden(msg) => format!(
            "Access denied: {}. Check the credentials and their permissions on the project.",
            msg
        ),
        WarehouseError::BadRequest(msg) => {
            with_context(format!("Invalid query: {}", msg), msg, sql)
        }
        other => other.to_string(),
    }
}

/// Explain the errors a finished job reported.
pub fn explain_job_errors(errors: &[JobErrorDetail], sql: Option<&str>) -> String {
    errors
        .iter()
        .map(|e| with_context(e.to_string(), &e.message, sql))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Explain an error surfaced by the query facade.
pub fn explain_query_error(err: &anyhow::Error, sql: Option<&str>) -> String {
    if let Some(e) = err.downcast_ref::<WarehouseError>() {
        return explain(e, sql);
    }
    match err.downcast_ref::<JobError>() {
        Some(JobError::Failed { job_id, errors }) => {
            format!("Job {} failed:\n{}", job_id, explain_job_errors(errors, sql))
        }
        Some(JobError::Warehouse(e)) => explain(e, sql),
        _ => format!("{:#}", err),
    }
}
