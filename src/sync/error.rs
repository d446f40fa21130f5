//! Error types for transaction sync

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The source changed while an item was being paged; the item must be
    /// paged again from its run-start cursor
    #[error("transactions changed during pagination for item {item_id}")]
    MutationDuringPagination { item_id: String },

    /// Pagination kept restarting past the configured limit
    #[error("gave up on item {item_id} after {attempts} pagination restarts")]
    TooManyRestarts { item_id: String, attempts: usize },

    /// Error body returned by the transactions source
    #[error("source error for item {item_id}: {code}: {message}")]
    Source {
        item_id: String,
        code: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cursor store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A commit targeted a partition older than the latest committed one
    #[error("partition {partition} is older than the latest committed partition {latest}")]
    PartitionRegression { partition: String, latest: String },

    #[error("invalid value in cursor store: {0}")]
    Corrupt(String),
}
