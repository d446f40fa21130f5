//! Error types for cache backends

use super::CacheKey;
use crate::warehouse::WarehouseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// No valid entry is stored under the key
    #[error("no cached result for key {0}")]
    CacheMiss(CacheKey),

    /// The entry references a warehouse job that no longer exists
    #[error("cached result {key} references job {job_id}, which no longer exists")]
    StaleCacheEntry { key: CacheKey, job_id: String },

    /// Backend is missing a required setting (e.g. the remote dataset)
    #[error("cache backend is not configured: {0}")]
    CacheNotConfigured(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded
    #[error("cache payload error: {0}")]
    Parquet(String),

    /// A blocking cache task panicked or was cancelled
    #[error("cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    /// A warehouse job run by the backend itself finished with errors
    #[error("cache job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
}

impl CacheError {
    /// True for errors the query path treats as a plain cache miss.
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            CacheError::CacheMiss(_) | CacheError::StaleCacheEntry { .. }
        )
    }
}

impl From<datafusion::parquet::errors::ParquetError> for CacheError {
    fn from(e: datafusion::parquet::errors::ParquetError) -> Self {
        CacheError::Parquet(e.to_string())
    }
}

impl From<datafusion::arrow::error::ArrowError> for CacheError {
    fn from(e: datafusion::arrow::error::ArrowError) -> Self {
        CacheError::Parquet(e.to_string())
    }
}
