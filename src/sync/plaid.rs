//! Plaid `/transactions/sync` client.

use super::source::{SyncItem, SyncPage, TransactionRecord, TransactionSource};
use super::SyncError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://production.plaid.com";
pub const DEFAULT_PAGE_SIZE: u32 = 500;
const MUTATION_DURING_PAGINATION: &str = "TRANSACTIONS_SYNC_MUTATION_DURING_PAGINATION";

pub struct PlaidClient {
    base_url: String,
    client_id: String,
    secret: String,
    page_size: u32,
    client: Client,
}

impl Debug for PlaidClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaidClient")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn is_empty(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Serialize)]
struct SyncRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    cursor: &'a str,
    count: u32,
}

#[derive(Deserialize)]
struct SyncResponse {
    #[serde(default)]
    added: Vec<serde_json::Value>,
    #[serde(default)]
    modified: Vec<serde_json::Value>,
    #[serde(default)]
    removed: Vec<RemovedTransaction>,
    next_cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct RemovedTransaction {
    transaction_id: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error_code: String,
    #[serde(default)]
    error_message: String,
}

fn records(item_id: &str, values: Vec<serde_json::Value>) -> Result<Vec<TransactionRecord>, SyncError> {
    values
        .into_iter()
        .map(|v| {
            TransactionRecord::from_value(v).ok_or_else(|| SyncError::Source {
                item_id: item_id.to_string(),
                code: "INVALID_RESPONSE".to_string(),
                message: "transaction without transaction_id".to_string(),
            })
        })
        .collect()
}

impl PlaidClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
        page_size: u32,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            secret: secret.into(),
            page_size: page_size.clamp(1, 500),
            client,
        })
    }
}

#[async_trait]
impl TransactionSource for PlaidClient {
    #[tracing::instrument(name = "plaid_sync_page", skip(self, item), fields(item_id = %item.item_id))]
    async fn sync_page(&self, item: &SyncItem, cursor: &str) -> Result<SyncPage, SyncError> {
        let url = format!("{}/transactions/sync", self.base_url);
        let request = SyncRequest {
            client_id: &self.client_id,
            secret: &self.secret,
            access_token: &item.access_token,
            cursor,
            count: self.page_size,
        };
        let response = self.client.post(url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            let error: ErrorResponse = serde_json::from_str(&body).unwrap_or(ErrorResponse {
                error_code: format!("HTTP_{}", status.as_u16()),
                error_message: body,
            });
            if error.error_code == MUTATION_DURING_PAGINATION {
                return Err(SyncError::MutationDuringPagination {
                    item_id: item.item_id.clone(),
                });
            }
            return Err(SyncError::Source {
                item_id: item.item_id.clone(),
                code: error.error_code,
                message: error.error_message,
            });
        }

        let body: SyncResponse = response.json().await?;
        debug!(
            added = body.added.len(),
            modified = body.modified.len(),
            removed = body.removed.len(),
            has_more = body.has_more,
            "Fetched transactions page"
        );
        Ok(SyncPage {
            added: records(&item.item_id, body.added)?,
            modified: records(&item.item_id, body.modified)?,
            removed: body.removed.into_iter().map(|r| r.transaction_id).collect(),
            has_more: body.has_more,
            next_cursor: body.next_cursor,
        })
    }
}
