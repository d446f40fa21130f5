//! Persistence for cursors and the transaction ledgers.

use super::source::TransactionRecord;
use super::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};

/// The committed cursor of one item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemCursor {
    pub item_id: String,
    pub cursor: String,
}

impl ItemCursor {
    pub fn new(item_id: impl Into<String>, cursor: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            cursor: cursor.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Added,
    Modified,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Added => "added",
            RecordKind::Modified => "modified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(RecordKind::Added),
            "modified" => Some(RecordKind::Modified),
            _ => None,
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the append-only transaction ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub run_id: String,
    pub item_id: String,
    pub kind: RecordKind,
    pub record: TransactionRecord,
    pub recorded_at: DateTime<Utc>,
}

/// A row of the append-only removal ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalRecord {
    pub run_id: String,
    pub item_id: String,
    pub transaction_id: String,
    pub removed_at: DateTime<Utc>,
}

/// Storage behind the cursor-resume protocol.
///
/// Cursors are staged per run and only become authoritative through
/// [`commit_run`](Self::commit_run), which writes a whole partition at once.
#[async_trait]
pub trait SyncStore: Debug + Send + Sync {
    /// Date of the latest committed partition.
    async fn latest_partition(&self) -> Result<Option<NaiveDate>, SyncError>;

    /// Cursors of the latest committed partition, ordered by item id.
    async fn latest_cursors(&self) -> Result<Vec<ItemCursor>, SyncError>;

    /// Record an item's final cursor for a run in progress. Staging the same
    /// item twice keeps the last cursor.
    async fn stage_cursor(&self, run_id: &str, item_id: &str, cursor: &str) -> Result<(), SyncError>;

    async fn staged_cursors(&self, run_id: &str) -> Result<Vec<ItemCursor>, SyncError>;

    async fn append_records(
        &self,
        run_id: &str,
        item_id: &str,
        kind: RecordKind,
        records: &[TransactionRecord],
        recorded_at: DateTime<Utc>,
    ) -> Result<(), SyncError>;

    async fn record_removals(
        &self,
        run_id: &str,
        item_id: &str,
        transaction_ids: &[String],
        removed_at: DateTime<Utc>,
    ) -> Result<(), SyncError>;

    /// Promote a run's staged cursors to `partition`, carrying forward items
    /// of the previous partition the run did not touch. Atomic: either the
    /// whole partition is written and staging cleared, or nothing changes.
    async fn commit_run(&self, run_id: &str, partition: NaiveDate) -> Result<Vec<ItemCursor>, SyncError>;

    /// Drop a run's staged cursors.
    async fn discard_run(&self, run_id: &str) -> Result<(), SyncError>;

    async fn records(&self) -> Result<Vec<LedgerRecord>, SyncError>;

    async fn removals(&self) -> Result<Vec<RemovalRecord>, SyncError>;
}
