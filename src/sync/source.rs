//! Paginated "changes since cursor" sources of transactions.

use super::SyncError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};

/// One transaction as returned by the source. `payload` is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub payload: serde_json::Value,
}

impl TransactionRecord {
    /// Wrap a raw source object, reading its `transaction_id` field.
    pub fn from_value(payload: serde_json::Value) -> Option<Self> {
        let transaction_id = payload.get("transaction_id")?.as_str()?.to_string();
        Some(Self {
            transaction_id,
            payload,
        })
    }
}

/// One page of changes since a cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPage {
    pub added: Vec<TransactionRecord>,
    /// Changed content under an existing id; stored again as an upsert
    pub modified: Vec<TransactionRecord>,
    pub removed: Vec<String>,
    pub has_more: bool,
    pub next_cursor: String,
}

/// A connected data source and the credential used to page it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    pub item_id: String,
    pub access_token: String,
}

impl SyncItem {
    pub fn new(item_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl Debug for SyncItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncItem")
            .field("item_id", &self.item_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait TransactionSource: Debug + Send + Sync {
    /// Fetch the page of changes after `cursor` (`""` starts from the
    /// beginning).
    async fn sync_page(&self, item: &SyncItem, cursor: &str) -> Result<SyncPage, SyncError>;
}
