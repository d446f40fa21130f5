//! SQLite-backed [`SyncStore`].

use super::source::TransactionRecord;
use super::store::{ItemCursor, LedgerRecord, RecordKind, RemovalRecord, SyncStore};
use super::SyncError;
use crate::partition::partition_suffix;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::path::Path;
use tracing::{debug, info};

/// Schema steps, applied in order and recorded in `schema_migrations`.
const MIGRATIONS: &[(i64, &[&str])] = &[(
    1,
    &[
        r#"
        CREATE TABLE IF NOT EXISTS cursor_partitions (
            partition TEXT NOT NULL,
            item_id TEXT NOT NULL,
            cursor TEXT NOT NULL,
            run_id TEXT NOT NULL,
            committed_at TEXT NOT NULL,
            PRIMARY KEY (partition, item_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cursor_staging (
            run_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            cursor TEXT NOT NULL,
            staged_at TEXT NOT NULL,
            PRIMARY KEY (run_id, item_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS removed_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            removed_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_transactions_item ON transactions (item_id, transaction_id)",
    ],
)];

pub struct SqliteSyncStore {
    pool: SqlitePool,
    db_path: String,
}

impl Debug for SqliteSyncStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSyncStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Corrupt(format!("timestamp {:?}: {}", value, e)))
}

fn parse_partition(value: &str) -> Result<NaiveDate, SyncError> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|e| SyncError::Corrupt(format!("partition {:?}: {}", value, e)))
}

fn cursor_from_row(row: &SqliteRow) -> Result<ItemCursor, SyncError> {
    Ok(ItemCursor {
        item_id: row.try_get("item_id")?,
        cursor: row.try_get("cursor")?,
    })
}

impl SqliteSyncStore {
    /// Open (creating if needed) the database at `db_path` and bring its
    /// schema up to date.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let db_path = db_path.as_ref().display().to_string();
        let uri = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePool::connect(&uri).await?;
        let store = Self { pool, db_path };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        for (version, statements) in MIGRATIONS {
            if current >= *version {
                continue;
            }
            let mut tx = self.pool.begin().await?;
            for statement in *statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(version, "Applied cursor store migration");
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn latest_partition(&self) -> Result<Option<NaiveDate>, SyncError> {
        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(partition) FROM cursor_partitions")
                .fetch_one(&self.pool)
                .await?;
        latest.as_deref().map(parse_partition).transpose()
    }

    async fn latest_cursors(&self) -> Result<Vec<ItemCursor>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, cursor FROM cursor_partitions
            WHERE partition = (SELECT MAX(partition) FROM cursor_partitions)
            ORDER BY item_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cursor_from_row).collect()
    }

    async fn stage_cursor(&self, run_id: &str, item_id: &str, cursor: &str) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO cursor_staging (run_id, item_id, cursor, staged_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (run_id, item_id) DO UPDATE SET
                cursor = excluded.cursor,
                staged_at = excluded.staged_at
            "#,
        )
        .bind(run_id)
        .bind(item_id)
        .bind(cursor)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn staged_cursors(&self, run_id: &str) -> Result<Vec<ItemCursor>, SyncError> {
        let rows = sqlx::query(
            "SELECT item_id, cursor FROM cursor_staging WHERE run_id = ? ORDER BY item_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cursor_from_row).collect()
    }

    async fn append_records(
        &self,
        run_id: &str,
        item_id: &str,
        kind: RecordKind,
        records: &[TransactionRecord],
        recorded_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let recorded_at = recorded_at.to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO transactions (run_id, item_id, transaction_id, kind, payload, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(item_id)
            .bind(&record.transaction_id)
            .bind(kind.as_str())
            .bind(serde_json::to_string(&record.payload)?)
            .bind(&recorded_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_removals(
        &self,
        run_id: &str,
        item_id: &str,
        transaction_ids: &[String],
        removed_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let removed_at = removed_at.to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for transaction_id in transaction_ids {
            sqlx::query(
                r#"
                INSERT INTO removed_transactions (run_id, item_id, transaction_id, removed_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(item_id)
            .bind(transaction_id)
            .bind(&removed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(name = "commit_run", skip(self), fields(partition = %partition_suffix(partition)))]
    async fn commit_run(&self, run_id: &str, partition: NaiveDate) -> Result<Vec<ItemCursor>, SyncError> {
        let partition_key = partition_suffix(partition);
        let mut tx = self.pool.begin().await?;

        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(partition) FROM cursor_partitions")
                .fetch_one(&mut *tx)
                .await?;
        if let Some(latest) = &latest {
            if partition_key < *latest {
                return Err(SyncError::PartitionRegression {
                    partition: partition_key,
                    latest: latest.clone(),
                });
            }
        }

        // item_id -> (cursor, run that produced it)
        let mut merged: BTreeMap<String, (String, String)> = BTreeMap::new();
        if let Some(latest) = &latest {
            let previous = sqlx::query(
                "SELECT item_id, cursor, run_id FROM cursor_partitions WHERE partition = ?",
            )
            .bind(latest)
            .fetch_all(&mut *tx)
            .await?;
            for row in &previous {
                merged.insert(
                    row.try_get("item_id")?,
                    (row.try_get("cursor")?, row.try_get("run_id")?),
                );
            }
        }
        let carried = merged.len();

        let staged = sqlx::query("SELECT item_id, cursor FROM cursor_staging WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await?;
        for row in &staged {
            let cursor = cursor_from_row(row)?;
            merged.insert(cursor.item_id, (cursor.cursor, run_id.to_string()));
        }

        sqlx::query("DELETE FROM cursor_partitions WHERE partition = ?")
            .bind(&partition_key)
            .execute(&mut *tx)
            .await?;

        let committed_at = Utc::now().to_rfc3339();
        for (item_id, (cursor, source_run)) in &merged {
            sqlx::query(
                r#"
                INSERT INTO cursor_partitions (partition, item_id, cursor, run_id, committed_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&partition_key)
            .bind(item_id)
            .bind(cursor)
            .bind(source_run)
            .bind(&committed_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM cursor_staging WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            run_id,
            staged = staged.len(),
            previous = carried,
            items = merged.len(),
            "Committed cursor partition"
        );
        Ok(merged
            .into_iter()
            .map(|(item_id, (cursor, _))| ItemCursor { item_id, cursor })
            .collect())
    }

    async fn discard_run(&self, run_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM cursor_staging WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn records(&self) -> Result<Vec<LedgerRecord>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, item_id, transaction_id, kind, payload, recorded_at
            FROM transactions ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                let payload: String = row.try_get("payload")?;
                let recorded_at: String = row.try_get("recorded_at")?;
                Ok(LedgerRecord {
                    run_id: row.try_get("run_id")?,
                    item_id: row.try_get("item_id")?,
                    kind: RecordKind::parse(&kind)
                        .ok_or_else(|| SyncError::Corrupt(format!("record kind {:?}", kind)))?,
                    record: TransactionRecord {
                        transaction_id: row.try_get("transaction_id")?,
                        payload: serde_json::from_str(&payload)?,
                    },
                    recorded_at: parse_time(&recorded_at)?,
                })
            })
            .collect()
    }

    async fn removals(&self) -> Result<Vec<RemovalRecord>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, item_id, transaction_id, removed_at
            FROM removed_transactions ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let removed_at: String = row.try_get("removed_at")?;
                Ok(RemovalRecord {
                    run_id: row.try_get("run_id")?,
                    item_id: row.try_get("item_id")?,
                    transaction_id: row.try_get("transaction_id")?,
                    removed_at: parse_time(&removed_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    async fn store(dir: &TempDir) -> SqliteSyncStore {
        SqliteSyncStore::open(dir.path().join("sync.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let first = store(&dir).await;
        drop(first);
        let second = store(&dir).await;
        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(second.pool())
            .await
            .unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_commit_carries_forward_untouched_items() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.stage_cursor("run1", "I1", "a1").await.unwrap();
        store.stage_cursor("run1", "I2", "b1").await.unwrap();
        store.commit_run("run1", day(1)).await.unwrap();

        store.stage_cursor("run2", "I1", "a2").await.unwrap();
        let committed = store.commit_run("run2", day(2)).await.unwrap();

        assert_eq!(
            committed,
            vec![ItemCursor::new("I1", "a2"), ItemCursor::new("I2", "b1")]
        );
        assert_eq!(store.latest_cursors().await.unwrap(), committed);
        assert_eq!(store.latest_partition().await.unwrap(), Some(day(2)));
        assert!(store.staged_cursors("run2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_day_commit_replaces_partition() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.stage_cursor("run1", "I1", "a1").await.unwrap();
        store.commit_run("run1", day(1)).await.unwrap();
        store.stage_cursor("run2", "I2", "b1").await.unwrap();
        store.commit_run("run2", day(1)).await.unwrap();

        assert_eq!(
            store.latest_cursors().await.unwrap(),
            vec![ItemCursor::new("I1", "a1"), ItemCursor::new("I2", "b1")]
        );
    }

    #[tokio::test]
    async fn test_uncommitted_run_leaves_cursors_intact() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.stage_cursor("run1", "I1", "a1").await.unwrap();
        store.commit_run("run1", day(1)).await.unwrap();

        store.stage_cursor("run2", "I1", "a2").await.unwrap();
        store.discard_run("run2").await.unwrap();

        assert_eq!(
            store.latest_cursors().await.unwrap(),
            vec![ItemCursor::new("I1", "a1")]
        );
    }

    #[tokio::test]
    async fn test_partition_regression_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.stage_cursor("run1", "I1", "a1").await.unwrap();
        store.commit_run("run1", day(5)).await.unwrap();
        store.stage_cursor("run2", "I1", "a2").await.unwrap();

        let err = store.commit_run("run2", day(4)).await.unwrap_err();
        assert!(matches!(err, SyncError::PartitionRegression { .. }));
        assert_eq!(
            store.latest_cursors().await.unwrap(),
            vec![ItemCursor::new("I1", "a1")]
        );
        assert_eq!(store.staged_cursors("run2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledgers_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let now = Utc::now();
        let record = TransactionRecord {
            transaction_id: "t1".into(),
            payload: serde_json::json!({"transaction_id": "t1", "amount": 4.2}),
        };

        store
            .append_records("run1", "I1", RecordKind::Added, &[record.clone()], now)
            .await
            .unwrap();
        store
            .record_removals("run1", "I1", &["t0".to_string()], now)
            .await
            .unwrap();

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record, record);
        assert_eq!(records[0].kind, RecordKind::Added);

        let removals = store.removals().await.unwrap();
        assert_eq!(removals[0].transaction_id, "t0");
        assert_eq!(removals[0].removed_at.timestamp(), now.timestamp());
    }
}
