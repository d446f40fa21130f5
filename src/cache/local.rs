//! Cache entries stored as files in a local directory.
//!
//! Each key owns two files: `bqt_<hex>.parquet` with the payload and
//! `bqt_<hex>.dat` with the JSON [`CacheMetadata`]. The payload is written
//! first and the sidecar last, each through a temporary file and a rename, so
//! an entry only becomes visible once both files are complete.

use super::key::KEY_PREFIX;
use super::parquet::{read_parquet, write_parquet};
use super::{
    CacheBackend, CacheError, CacheKey, CacheKind, CacheMetadata, CachedResult, Clock,
    SystemClock, Ttl,
};
use crate::warehouse::{ResultSet, Warehouse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const PAYLOAD_EXT: &str = "parquet";
const METADATA_EXT: &str = "dat";
const DEFAULT_SWEEP_PROBABILITY: f64 = 0.1;
const DEFAULT_SWEEP_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// File layout of a cache directory. Everything here is blocking I/O and
/// runs on the blocking thread pool.
#[derive(Debug, Clone)]
struct Layout {
    dir: PathBuf,
}

impl Layout {
    fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.file_stem(), PAYLOAD_EXT))
    }

    fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.file_stem(), METADATA_EXT))
    }

    fn read_metadata(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, CacheError> {
        let meta_path = self.metadata_path(key);
        if !meta_path.exists() || !self.payload_path(key).exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&meta_path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write_entry(
        &self,
        key: &CacheKey,
        payload: &ResultSet,
        metadata: &CacheMetadata,
    ) -> Result<usize, CacheError> {
        let rows = write_parquet(&self.payload_path(key), payload)?;
        let path = self.metadata_path(key);
        let tmp = path.with_extension(format!("{}.tmp-{}", METADATA_EXT, nanoid::nanoid!(8)));
        std::fs::write(&tmp, serde_json::to_vec(metadata)?)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(rows)
    }

    fn remove_entry(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut removed = false;
        for path in [self.metadata_path(key), self.payload_path(key)] {
            match std::fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn sweep(&self, now: DateTime<Utc>, max_age: Duration) -> Result<usize, CacheError> {
        let max_age_chrono = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(KEY_PREFIX) {
                continue;
            }

            if name.ends_with(&format!(".{}", METADATA_EXT)) {
                let created_at = std::fs::read(&path)
                    .ok()
                    .and_then(|b| serde_json::from_slice::<CacheMetadata>(&b).ok())
                    .map(|m| m.created_at);
                let expired = match created_at {
                    Some(created_at) => now - created_at > max_age_chrono,
                    None => file_older_than(&path, max_age),
                };
                if expired {
                    let _ = std::fs::remove_file(path.with_extension(PAYLOAD_EXT));
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            } else if !name.ends_with(&format!(".{}", PAYLOAD_EXT))
                || !path.with_extension(METADATA_EXT).exists()
            {
                // Orphaned payload or abandoned temporary file
                if file_older_than(&path, max_age) {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Ok(removed)
    }

    fn clear_all(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(KEY_PREFIX));
            if !owned {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some(METADATA_EXT) {
                removed += 1;
            }
            std::fs::remove_file(&path)?;
        }
        Ok(removed)
    }
}

fn file_older_than(path: &Path, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

/// Run blocking cache I/O off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[derive(Debug)]
pub struct LocalDiskCache {
    layout: Layout,
    ttl: Ttl,
    warehouse: Arc<dyn Warehouse>,
    clock: Arc<dyn Clock>,
    sweep_probability: f64,
    sweep_max_age: Duration,
}

impl LocalDiskCache {
    /// Open (creating if needed) a cache directory. Entries never expire
    /// until [`with_ttl`](Self::with_ttl) says otherwise.
    pub fn new(dir: impl Into<PathBuf>, warehouse: Arc<dyn Warehouse>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            layout: Layout { dir },
            ttl: Ttl::Never,
            warehouse,
            clock: Arc::new(SystemClock),
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            sweep_max_age: DEFAULT_SWEEP_MAX_AGE,
        })
    }

    /// Set the TTL. A finite TTL also becomes the sweep age.
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        if let Ttl::Seconds(secs) = ttl {
            self.sweep_max_age = Duration::from_secs(secs);
        }
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Probability in `[0, 1]` that a `store` triggers a sweep, and the age
    /// past which the sweep deletes entries. A non-finite probability
    /// disables sweeping on store.
    pub fn with_sweep(mut self, probability: f64, max_age: Duration) -> Self {
        self.sweep_probability = if probability.is_finite() {
            probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.sweep_max_age = max_age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.layout.dir
    }

    pub fn sweep_probability(&self) -> f64 {
        self.sweep_probability
    }

    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.layout.payload_path(key)
    }

    pub fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        self.layout.metadata_path(key)
    }

    async fn read_metadata(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, CacheError> {
        let layout = self.layout.clone();
        let key = key.clone();
        blocking(move || layout.read_metadata(&key)).await
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let layout = self.layout.clone();
        let key = key.clone();
        blocking(move || layout.remove_entry(&key)).await
    }

    /// Delete entries created more than `max_age` ago, plus leftover
    /// payload and temporary files of the same age. Returns entries removed.
    #[tracing::instrument(name = "cache_sweep", skip(self), fields(dir = %self.layout.dir.display()))]
    pub async fn sweep_older_than(&self, max_age: Duration) -> Result<usize, CacheError> {
        let layout = self.layout.clone();
        let now = self.clock.now();
        let removed = blocking(move || layout.sweep(now, max_age)).await?;
        if removed > 0 {
            info!(removed, "Swept expired cache entries");
        }
        Ok(removed)
    }

    /// Run [`sweep_older_than`](Self::sweep_older_than) with the configured probability.
    pub async fn maybe_sweep(&self) -> Option<usize> {
        if !rand::thread_rng().gen_bool(self.sweep_probability) {
            return None;
        }
        match self.sweep_older_than(self.sweep_max_age).await {
            Ok(removed) => Some(removed),
            Err(e) => {
                warn!(error = %e, "Cache sweep failed");
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for LocalDiskCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Local
    }

    async fn hit(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(match self.read_metadata(key).await? {
            Some(metadata) => !self.ttl.is_expired(metadata.created_at, self.clock.now()),
            None => false,
        })
    }

    #[tracing::instrument(name = "cache_fetch", skip(self), fields(backend = "local", key = %key))]
    async fn fetch(&self, key: &CacheKey) -> Result<CachedResult, CacheError> {
        let Some(metadata) = self.read_metadata(key).await? else {
            return Err(CacheError::CacheMiss(key.clone()));
        };
        if self.ttl.is_expired(metadata.created_at, self.clock.now()) {
            self.remove_entry(key).await?;
            return Err(CacheError::CacheMiss(key.clone()));
        }

        let job = match self.warehouse.job_status(&metadata.handle()).await {
            Ok(status) => Some(status),
            Err(e) if e.is_not_found() => {
                debug!(job_id = %metadata.job_id, "Cached job no longer exists, dropping entry");
                self.remove_entry(key).await?;
                return Err(CacheError::StaleCacheEntry {
                    key: key.clone(),
                    job_id: metadata.job_id,
                });
            }
            Err(e) => {
                warn!(job_id = %metadata.job_id, error = %e, "Could not check cached job");
                None
            }
        };

        let path = self.payload_path(key);
        let payload = blocking(move || read_parquet(&path)).await?;
        Ok(CachedResult {
            key: key.clone(),
            payload,
            metadata,
            job,
        })
    }

    #[tracing::instrument(name = "cache_store", skip(self, payload, metadata), fields(backend = "local", key = %key))]
    async fn store(
        &self,
        key: &CacheKey,
        payload: &ResultSet,
        metadata: &CacheMetadata,
    ) -> Result<(), CacheError> {
        let layout = self.layout.clone();
        let key = key.clone();
        let payload = payload.clone();
        let metadata = metadata.clone();
        let rows = blocking(move || layout.write_entry(&key, &payload, &metadata)).await?;
        debug!(rows, "Stored cache entry");
        self.maybe_sweep().await;
        Ok(())
    }

    async fn clear(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.remove_entry(key).await
    }

    async fn sweep(&self) -> Result<usize, CacheError> {
        self.sweep_older_than(self.sweep_max_age).await
    }

    async fn clear_all(&self) -> Result<usize, CacheError> {
        let layout = self.layout.clone();
        blocking(move || layout.clear_all()).await
    }
}
