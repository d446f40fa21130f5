//! Blocking-wait plumbing shared by job results and the pool.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between polls of a single job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Asks the user a yes/no question.
///
/// Called from inside async waits; implementations may block briefly on
/// terminal input.
pub trait Confirm: Debug + Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Answers yes to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Answers no to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished,
    /// The cancellation token fired. `cancelled_remote` tells whether the
    /// warehouse job was cancelled as well.
    Interrupted { cancelled_remote: bool },
}

impl WaitOutcome {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, WaitOutcome::Interrupted { .. })
    }
}

/// Settings a [`JobResult`](super::JobResult) uses while waiting.
#[derive(Debug, Clone)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub confirm: Arc<dyn Confirm>,
    /// Upper bound on downloadable result size. `None` uses available
    /// system memory.
    pub max_result_bytes: Option<u64>,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            confirm: Arc::new(AssumeNo),
            max_result_bytes: None,
        }
    }
}

/// Human-readable elapsed time, e.g. `42s`, `3m 05s`, `1h 02m 03s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Memory available for downloading results, if the platform reports it.
pub(crate) fn available_memory() -> Option<u64> {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    match sys.available_memory() {
        0 => None,
        bytes => Some(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0s");
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(185)), "3m 05s");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_confirm_stubs() {
        assert!(AssumeYes.confirm("cancel?"));
        assert!(!AssumeNo.confirm("cancel?"));
    }
}
