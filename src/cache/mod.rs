//! Query result caching.
//!
//! A [`CacheBackend`] stores the result of a query under the [`CacheKey`] of
//! its normalized text. Three backends exist:
//!
//! - [`NullCache`] - never hits, stores nothing
//! - [`LocalDiskCache`] - Parquet payload plus JSON sidecar in a directory
//! - [`RemoteTableCache`] - one warehouse table per key in a cache dataset
//!
//! Entries expire by age only ([`Ttl`]); there is no size-bounded eviction.

mod error;
pub mod key;
mod local;
mod null;
mod parquet;
mod remote;

pub use error::CacheError;
pub use key::{normalize, resolve, CacheKey};
pub use local::LocalDiskCache;
pub use null::NullCache;
pub use parquet::{read_parquet, ParquetConfig, StreamingParquetWriter};
pub use remote::RemoteTableCache;

use crate::warehouse::{JobHandle, JobStatus, ResultSet, TableRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Mutex;

/// Lifetime of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ttl {
    Never,
    Seconds(u64),
}

impl Ttl {
    /// `-1` (or any negative value) means entries never expire.
    pub fn from_seconds(seconds: i64) -> Self {
        u64::try_from(seconds).map_or(Ttl::Never, Ttl::Seconds)
    }

    /// An entry expires once strictly more than the TTL has elapsed.
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Ttl::Never => false,
            Ttl::Seconds(ttl) => {
                let ttl = i64::try_from(*ttl).unwrap_or(i64::MAX);
                (now - created_at).num_seconds() > ttl
            }
        }
    }
}

/// Source of the current time for TTL checks.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sidecar describing how a cached payload was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub job_id: String,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub destination: Option<TableRef>,
}

impl CacheMetadata {
    pub fn from_status(status: &JobStatus, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id: status.handle.job_id.clone(),
            location: status.handle.location.clone(),
            created_at,
            destination: status.destination.clone(),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.job_id.clone(),
            location: self.location.clone(),
        }
    }
}

/// A stored result with its metadata.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub key: CacheKey,
    pub payload: ResultSet,
    pub metadata: CacheMetadata,
    /// Status of the job that produced or read back the payload.
    pub job: Option<JobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    None,
    Local,
    Remote,
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CacheKind::None => "none",
            CacheKind::Local => "local",
            CacheKind::Remote => "remote",
        })
    }
}

/// Storage for query results keyed by [`CacheKey`].
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync {
    fn kind(&self) -> CacheKind;

    /// True when a valid, unexpired entry exists.
    async fn hit(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Load an entry. Fails with `CacheMiss` when nothing valid is stored and
    /// with `StaleCacheEntry` when the producing job is gone.
    async fn fetch(&self, key: &CacheKey) -> Result<CachedResult, CacheError>;

    /// Store a payload, replacing any previous entry.
    async fn store(
        &self,
        key: &CacheKey,
        payload: &ResultSet,
        metadata: &CacheMetadata,
    ) -> Result<(), CacheError>;

    /// Remove one entry. Returns whether anything was removed.
    async fn clear(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Remove every entry this backend owns. Returns how many were removed.
    async fn clear_all(&self) -> Result<usize, CacheError>;

    /// Delete expired entries now. Returns how many were removed.
    async fn sweep(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    /// Fails with `CacheNotConfigured` when the backend lacks a required
    /// setting and cannot serve or store anything.
    fn ensure_configured(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// Table a query job should write to directly so that storing becomes a
    /// no-op.
    fn job_destination(&self, _key: &CacheKey) -> Option<TableRef> {
        None
    }
}
