//! Cursor-resumed transaction pulls.
//!
//! A run pages every item from its start cursor until the source reports no
//! more changes, appends what it saw to the ledgers, stages the item's final
//! cursor, and commits all staged cursors as one partition at the end. A run
//! that fails part-way leaves the previously committed partition untouched,
//! so the next run resumes from the same place.

use super::source::{SyncItem, SyncPage, TransactionRecord, TransactionSource};
use super::store::{ItemCursor, RecordKind, SyncStore};
use super::SyncError;
use crate::id::generate_run_id;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MAX_RESTARTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Page every item from the beginning.
    Backfill,
    /// Resume from the latest committed cursors.
    #[default]
    Incremental,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: String,
    pub pages: usize,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub restarts: usize,
    pub cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub run_id: String,
    pub partition: NaiveDate,
    pub items: Vec<ItemReport>,
    /// Full committed partition, including carried-forward items.
    pub committed: Vec<ItemCursor>,
}

impl SyncReport {
    pub fn total_added(&self) -> usize {
        self.items.iter().map(|i| i.added).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.items.iter().map(|i| i.removed).sum()
    }
}

/// Everything seen for one item during a single pass over its pages.
#[derive(Default)]
struct ItemChanges {
    added: Vec<TransactionRecord>,
    modified: Vec<TransactionRecord>,
    removed: Vec<String>,
    pages: usize,
    cursor: String,
}

impl ItemChanges {
    fn absorb(&mut self, page: SyncPage) {
        self.added.extend(page.added);
        self.modified.extend(page.modified);
        self.removed.extend(page.removed);
        self.pages += 1;
        self.cursor = page.next_cursor;
    }
}

#[derive(Debug)]
pub struct TransactionPuller {
    source: Arc<dyn TransactionSource>,
    store: Arc<dyn SyncStore>,
    max_restarts: usize,
}

impl TransactionPuller {
    pub fn new(source: Arc<dyn TransactionSource>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            source,
            store,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Pull every item and commit the resulting cursors as `partition`.
    #[tracing::instrument(
        name = "sync_run",
        skip(self, items),
        fields(run_id = tracing::field::Empty, items = items.len())
    )]
    pub async fn run(
        &self,
        items: &[SyncItem],
        mode: SyncMode,
        partition: NaiveDate,
    ) -> Result<SyncReport, SyncError> {
        let run_id = generate_run_id();
        tracing::Span::current().record("run_id", run_id.as_str());

        let start_cursors: HashMap<String, String> = match mode {
            SyncMode::Backfill => HashMap::new(),
            SyncMode::Incremental => self
                .store
                .latest_cursors()
                .await?
                .into_iter()
                .map(|c| (c.item_id, c.cursor))
                .collect(),
        };

        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            let start = start_cursors
                .get(&item.item_id)
                .map(String::as_str)
                .unwrap_or("");
            match self.pull_item(&run_id, item, start).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(run_id = %run_id, item_id = %item.item_id, error = %e, "Sync run aborted");
                    if let Err(discard) = self.store.discard_run(&run_id).await {
                        warn!(run_id = %run_id, error = %discard, "Failed to discard staged cursors");
                    }
                    return Err(e);
                }
            }
        }

        let committed = match self.store.commit_run(&run_id, partition).await {
            Ok(committed) => committed,
            Err(e) => {
                if let Err(discard) = self.store.discard_run(&run_id).await {
                    warn!(run_id = %run_id, error = %discard, "Failed to discard staged cursors");
                }
                return Err(e);
            }
        };

        let report = SyncReport {
            run_id,
            partition,
            items: reports,
            committed,
        };
        info!(
            run_id = %report.run_id,
            added = report.total_added(),
            removed = report.total_removed(),
            "Sync run committed"
        );
        Ok(report)
    }

    async fn pull_item(
        &self,
        run_id: &str,
        item: &SyncItem,
        start: &str,
    ) -> Result<ItemReport, SyncError> {
        let mut restarts = 0;
        let changes = loop {
            match self.page_through(item, start).await {
                Ok(changes) => break changes,
                Err(SyncError::MutationDuringPagination { .. }) if restarts < self.max_restarts => {
                    restarts += 1;
                    warn!(item_id = %item.item_id, restarts, "Source changed during pagination, restarting item");
                }
                Err(SyncError::MutationDuringPagination { item_id }) => {
                    return Err(SyncError::TooManyRestarts {
                        item_id,
                        attempts: restarts,
                    });
                }
                Err(e) => return Err(e),
            }
        };

        let now = Utc::now();
        if !changes.added.is_empty() {
            self.store
                .append_records(run_id, &item.item_id, RecordKind::Added, &changes.added, now)
                .await?;
        }
        if !changes.modified.is_empty() {
            self.store
                .append_records(run_id, &item.item_id, RecordKind::Modified, &changes.modified, now)
                .await?;
        }
        if !changes.removed.is_empty() {
            self.store
                .record_removals(run_id, &item.item_id, &changes.removed, now)
                .await?;
        }
        self.store
            .stage_cursor(run_id, &item.item_id, &changes.cursor)
            .await?;

        Ok(ItemReport {
            item_id: item.item_id.clone(),
            pages: changes.pages,
            added: changes.added.len(),
            modified: changes.modified.len(),
            removed: changes.removed.len(),
            restarts,
            cursor: changes.cursor,
        })
    }

    /// Page from `start` until the source has nothing more. Pages are held
    /// in memory so a restart never writes a partial pass.
    async fn page_through(&self, item: &SyncItem, start: &str) -> Result<ItemChanges, SyncError> {
        let mut changes = ItemChanges {
            cursor: start.to_string(),
            ..Default::default()
        };
        loop {
            let page = self.source.sync_page(item, &changes.cursor).await?;
            let has_more = page.has_more;
            changes.absorb(page);
            if !has_more {
                return Ok(changes);
            }
        }
    }
}
