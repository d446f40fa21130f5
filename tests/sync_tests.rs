use async_trait::async_trait;
use bqt::sync::{
    ItemCursor, LedgerRecord, RecordKind, RemovalRecord, SqliteSyncStore, SyncError, SyncItem,
    SyncMode, SyncPage, SyncStore, TransactionPuller, TransactionRecord, TransactionSource,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Pages served by (item, cursor). Items listed in `failing` answer with a
/// source error.
#[derive(Debug, Default)]
struct FakeSource {
    pages: Mutex<HashMap<(String, String), SyncPage>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeSource {
    fn serve(&self, item: &str, cursor: &str, page: SyncPage) {
        self.pages
            .lock()
            .unwrap()
            .insert((item.to_string(), cursor.to_string()), page);
    }

    fn fail_item(&self, item: &str) {
        self.failing.lock().unwrap().insert(item.to_string());
    }
}

#[async_trait]
impl TransactionSource for FakeSource {
    async fn sync_page(&self, item: &SyncItem, cursor: &str) -> Result<SyncPage, SyncError> {
        if self.failing.lock().unwrap().contains(&item.item_id) {
            return Err(SyncError::Source {
                item_id: item.item_id.clone(),
                code: "ITEM_LOGIN_REQUIRED".into(),
                message: "the login details of this item have changed".into(),
            });
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(item.item_id.clone(), cursor.to_string()))
            .cloned()
            .unwrap_or_else(|| SyncPage {
                next_cursor: cursor.to_string(),
                ..Default::default()
            }))
    }
}

/// Store that delegates to SQLite but can refuse to commit.
#[derive(Debug)]
struct FailingStore {
    inner: SqliteSyncStore,
    fail_commit: AtomicBool,
}

#[async_trait]
impl SyncStore for FailingStore {
    async fn latest_partition(&self) -> Result<Option<NaiveDate>, SyncError> {
        self.inner.latest_partition().await
    }

    async fn latest_cursors(&self) -> Result<Vec<ItemCursor>, SyncError> {
        self.inner.latest_cursors().await
    }

    async fn stage_cursor(&self, run_id: &str, item_id: &str, cursor: &str) -> Result<(), SyncError> {
        self.inner.stage_cursor(run_id, item_id, cursor).await
    }

    async fn staged_cursors(&self, run_id: &str) -> Result<Vec<ItemCursor>, SyncError> {
        self.inner.staged_cursors(run_id).await
    }

    async fn append_records(
        &self,
        run_id: &str,
        item_id: &str,
        kind: RecordKind,
        records: &[TransactionRecord],
        recorded_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.inner
            .append_records(run_id, item_id, kind, records, recorded_at)
            .await
    }

    async fn record_removals(
        &self,
        run_id: &str,
        item_id: &str,
        transaction_ids: &[String],
        removed_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.inner
            .record_removals(run_id, item_id, transaction_ids, removed_at)
            .await
    }

    async fn commit_run(&self, run_id: &str, partition: NaiveDate) -> Result<Vec<ItemCursor>, SyncError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(SyncError::Corrupt("disk full".into()));
        }
        self.inner.commit_run(run_id, partition).await
    }

    async fn discard_run(&self, run_id: &str) -> Result<(), SyncError> {
        self.inner.discard_run(run_id).await
    }

    async fn records(&self) -> Result<Vec<LedgerRecord>, SyncError> {
        self.inner.records().await
    }

    async fn removals(&self) -> Result<Vec<RemovalRecord>, SyncError> {
        self.inner.removals().await
    }
}

fn txn(id: &str, amount: f64) -> TransactionRecord {
    TransactionRecord::from_value(serde_json::json!({ "transaction_id": id, "amount": amount }))
        .unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
}

fn items(ids: &[&str]) -> Vec<SyncItem> {
    ids.iter()
        .map(|id| SyncItem::new(*id, format!("access-{}", id)))
        .collect()
}

async fn open_store(dir: &TempDir) -> Arc<SqliteSyncStore> {
    Arc::new(SqliteSyncStore::open(dir.path().join("sync.db")).await.unwrap())
}

#[tokio::test]
async fn test_added_then_removed_transaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let source = Arc::new(FakeSource::default());
    let puller = TransactionPuller::new(source.clone(), store.clone());

    source.serve(
        "I1",
        "",
        SyncPage {
            added: vec![txn("t1", 9.99)],
            next_cursor: "c1".into(),
            ..Default::default()
        },
    );
    let report = puller
        .run(&items(&["I1"]), SyncMode::Incremental, day(1))
        .await
        .unwrap();
    assert_eq!(report.committed, vec![ItemCursor::new("I1", "c1")]);
    let records = store.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Added);
    assert_eq!(records[0].record.transaction_id, "t1");

    source.serve(
        "I1",
        "c1",
        SyncPage {
            removed: vec!["t1".into()],
            next_cursor: "c2".into(),
            ..Default::default()
        },
    );
    let before = Utc::now();
    puller
        .run(&items(&["I1"]), SyncMode::Incremental, day(2))
        .await
        .unwrap();

    let removals = store.removals().await.unwrap();
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].transaction_id, "t1");
    assert!(removals[0].removed_at >= before - chrono::Duration::seconds(1));
    assert_eq!(
        store.latest_cursors().await.unwrap(),
        vec![ItemCursor::new("I1", "c2")]
    );
    assert_eq!(store.latest_partition().await.unwrap(), Some(day(2)));
}

#[tokio::test]
async fn test_pages_until_exhausted_and_records_modified() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let source = Arc::new(FakeSource::default());
    source.serve(
        "I1",
        "",
        SyncPage {
            added: vec![txn("t1", 1.0), txn("t2", 2.0)],
            has_more: true,
            next_cursor: "p1".into(),
            ..Default::default()
        },
    );
    source.serve(
        "I1",
        "p1",
        SyncPage {
            modified: vec![txn("t1", 1.5)],
            next_cursor: "p2".into(),
            ..Default::default()
        },
    );

    let puller = TransactionPuller::new(source.clone(), store.clone());
    let report = puller
        .run(&items(&["I1"]), SyncMode::Backfill, day(1))
        .await
        .unwrap();

    assert_eq!(report.items[0].pages, 2);
    assert_eq!(report.items[0].cursor, "p2");
    let kinds: Vec<(RecordKind, String)> = store
        .records()
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.kind, r.record.transaction_id))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (RecordKind::Added, "t1".to_string()),
            (RecordKind::Added, "t2".to_string()),
            (RecordKind::Modified, "t1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_aborted_run_keeps_previous_cursors() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let source = Arc::new(FakeSource::default());
    let puller = TransactionPuller::new(source.clone(), store.clone());

    source.serve("I1", "", SyncPage { next_cursor: "a1".into(), ..Default::default() });
    source.serve("I2", "", SyncPage { next_cursor: "b1".into(), ..Default::default() });
    puller
        .run(&items(&["I1", "I2"]), SyncMode::Incremental, day(1))
        .await
        .unwrap();
    let before = store.latest_cursors().await.unwrap();

    // I1 advances, then I2 fails: nothing may be committed.
    source.serve("I1", "a1", SyncPage { next_cursor: "a2".into(), ..Default::default() });
    source.fail_item("I2");
    let err = puller
        .run(&items(&["I1", "I2"]), SyncMode::Incremental, day(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Source { .. }));

    assert_eq!(store.latest_cursors().await.unwrap(), before);
    assert_eq!(store.latest_partition().await.unwrap(), Some(day(1)));
}

#[tokio::test]
async fn test_failed_commit_keeps_previous_cursors() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FailingStore {
        inner: SqliteSyncStore::open(dir.path().join("sync.db")).await.unwrap(),
        fail_commit: AtomicBool::new(false),
    });
    let source = Arc::new(FakeSource::default());
    let puller = TransactionPuller::new(source.clone(), store.clone());

    source.serve("I1", "", SyncPage { next_cursor: "a1".into(), ..Default::default() });
    puller
        .run(&items(&["I1"]), SyncMode::Incremental, day(1))
        .await
        .unwrap();

    source.serve("I1", "a1", SyncPage { next_cursor: "a2".into(), ..Default::default() });
    store.fail_commit.store(true, Ordering::SeqCst);
    let err = puller
        .run(&items(&["I1"]), SyncMode::Incremental, day(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Corrupt(_)));
    assert_eq!(
        store.latest_cursors().await.unwrap(),
        vec![ItemCursor::new("I1", "a1")]
    );

    // The next run resumes from the committed cursor, not the staged one.
    store.fail_commit.store(false, Ordering::SeqCst);
    let report = puller
        .run(&items(&["I1"]), SyncMode::Incremental, day(2))
        .await
        .unwrap();
    assert_eq!(report.committed, vec![ItemCursor::new("I1", "a2")]);
}

#[tokio::test]
async fn test_commit_is_union_of_updated_and_carried_items() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let source = Arc::new(FakeSource::default());
    let puller = TransactionPuller::new(source.clone(), store.clone());

    for (item, cursor) in [("I1", "a1"), ("I2", "b1"), ("I3", "c1")] {
        source.serve(item, "", SyncPage { next_cursor: cursor.into(), ..Default::default() });
    }
    puller
        .run(&items(&["I1", "I2", "I3"]), SyncMode::Incremental, day(1))
        .await
        .unwrap();

    source.serve("I1", "a1", SyncPage { next_cursor: "a2".into(), ..Default::default() });
    source.serve("I4", "", SyncPage { next_cursor: "d1".into(), ..Default::default() });
    let report = puller
        .run(&items(&["I1", "I4"]), SyncMode::Incremental, day(2))
        .await
        .unwrap();

    let expected = vec![
        ItemCursor::new("I1", "a2"),
        ItemCursor::new("I2", "b1"),
        ItemCursor::new("I3", "c1"),
        ItemCursor::new("I4", "d1"),
    ];
    assert_eq!(report.committed, expected);
    assert_eq!(store.latest_cursors().await.unwrap(), expected);

    let ids: HashSet<&str> = report.committed.iter().map(|c| c.item_id.as_str()).collect();
    assert_eq!(ids.len(), report.committed.len());
}

#[tokio::test]
async fn test_backfill_ignores_committed_cursors() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let source = Arc::new(FakeSource::default());
    let puller = TransactionPuller::new(source.clone(), store.clone());

    source.serve(
        "I1",
        "",
        SyncPage {
            added: vec![txn("t1", 3.0)],
            next_cursor: "a1".into(),
            ..Default::default()
        },
    );
    puller
        .run(&items(&["I1"]), SyncMode::Incremental, day(1))
        .await
        .unwrap();
    let report = puller
        .run(&items(&["I1"]), SyncMode::Backfill, day(1))
        .await
        .unwrap();

    assert_eq!(report.items[0].added, 1);
    assert_eq!(store.records().await.unwrap().len(), 2);
    assert_eq!(store.latest_cursors().await.unwrap(), vec![ItemCursor::new("I1", "a1")]);
}
