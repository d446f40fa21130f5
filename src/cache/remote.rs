//! Cache entries stored as warehouse tables.
//!
//! The entry for a key is the table `<prefix><hex>` in the cache dataset. Its
//! existence and creation time are the hit test; no other metadata is kept.

use super::key::KEY_PREFIX;
use super::{
    CacheBackend, CacheError, CacheKey, CacheKind, CacheMetadata, CachedResult, Clock,
    SystemClock, Ttl,
};
use crate::warehouse::{
    poll_until_done, JobConfig, JobStatus, ResultSet, TableMeta, TableRef, Warehouse,
    WriteDisposition,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct RemoteTableCache {
    warehouse: Arc<dyn Warehouse>,
    dataset: Option<String>,
    prefix: String,
    ttl: Ttl,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl RemoteTableCache {
    /// `dataset` may be `None`; every operation then fails with
    /// `CacheNotConfigured`.
    pub fn new(warehouse: Arc<dyn Warehouse>, dataset: Option<String>) -> Self {
        Self {
            warehouse,
            dataset: dataset.filter(|d| !d.is_empty()),
            prefix: KEY_PREFIX.to_string(),
            ttl: Ttl::Never,
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn dataset(&self) -> Result<&str, CacheError> {
        self.dataset.as_deref().ok_or_else(|| {
            CacheError::CacheNotConfigured("remote cache requires a dataset".to_string())
        })
    }

    /// Cache table for a key.
    pub fn table_for(&self, key: &CacheKey) -> Result<TableRef, CacheError> {
        Ok(TableRef::new(
            self.dataset()?,
            format!("{}{}", self.prefix, key.as_str()),
        ))
    }

    async fn live_table(&self, key: &CacheKey) -> Result<Option<TableMeta>, CacheError> {
        let table = self.table_for(key)?;
        Ok(self
            .warehouse
            .get_table(&table)
            .await?
            .filter(|meta| !self.ttl.is_expired(meta.created_at, self.clock.now())))
    }

    /// Run a query to completion, failing if the job reports errors.
    async fn run(&self, sql: &str, config: &JobConfig) -> Result<JobStatus, CacheError> {
        let job = self.warehouse.submit_query(sql, config).await?;
        let status = poll_until_done(self.warehouse.as_ref(), &job, self.poll_interval).await?;
        if let Some(error) = status.errors.first() {
            return Err(CacheError::JobFailed {
                job_id: status.handle.job_id.clone(),
                message: error.to_string(),
            });
        }
        Ok(status)
    }
}

#[async_trait]
impl CacheBackend for RemoteTableCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Remote
    }

    fn ensure_configured(&self) -> Result<(), CacheError> {
        self.dataset().map(|_| ())
    }

    async fn hit(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.live_table(key).await?.is_some())
    }

    #[tracing::instrument(name = "cache_fetch", skip(self), fields(backend = "remote", key = %key))]
    async fn fetch(&self, key: &CacheKey) -> Result<CachedResult, CacheError> {
        let Some(meta) = self.live_table(key).await? else {
            return Err(CacheError::CacheMiss(key.clone()));
        };

        let status = self
            .run(
                &format!("SELECT * FROM {}", meta.table.quoted()),
                &JobConfig::default(),
            )
            .await?;
        let payload = self.warehouse.fetch_results(&status.handle).await?;

        Ok(CachedResult {
            key: key.clone(),
            payload,
            metadata: CacheMetadata {
                job_id: status.handle.job_id.clone(),
                location: status.handle.location.clone(),
                created_at: meta.created_at,
                destination: Some(meta.table),
            },
            job: Some(status),
        })
    }

    #[tracing::instrument(name = "cache_store", skip(self, payload, metadata), fields(backend = "remote", key = %key))]
    async fn store(
        &self,
        key: &CacheKey,
        payload: &ResultSet,
        metadata: &CacheMetadata,
    ) -> Result<(), CacheError> {
        let table = self.table_for(key)?;
        match &metadata.destination {
            // The job already wrote its output into the cache table.
            Some(source) if *source == table => {}
            Some(source) => {
                let config = JobConfig {
                    destination: Some(table.clone()),
                    write_disposition: WriteDisposition::Truncate,
                    ..Default::default()
                };
                self.run(&format!("SELECT * FROM {}", source.quoted()), &config)
                    .await?;
            }
            None => self.warehouse.load_table(&table, payload).await?,
        }
        debug!(table = %table, "Stored cache entry");
        Ok(())
    }

    async fn clear(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let table = self.table_for(key)?;
        match self.warehouse.delete_table(&table).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_all(&self) -> Result<usize, CacheError> {
        let dataset = self.dataset()?;
        let mut removed = 0;
        for table in self.warehouse.list_tables(dataset).await? {
            if !table.table.starts_with(&self.prefix) {
                continue;
            }
            match self.warehouse.delete_table(&table).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn sweep(&self) -> Result<usize, CacheError> {
        if self.ttl == Ttl::Never {
            return Ok(0);
        }
        let dataset = self.dataset()?;
        let now = self.clock.now();
        let mut removed = 0;
        for table in self.warehouse.list_tables(dataset).await? {
            if !table.table.starts_with(&self.prefix) {
                continue;
            }
            let Some(meta) = self.warehouse.get_table(&table).await? else {
                continue;
            };
            if !self.ttl.is_expired(meta.created_at, now) {
                continue;
            }
            match self.warehouse.delete_table(&table).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(removed, dataset, "Swept expired cache tables");
        Ok(removed)
    }

    fn job_destination(&self, key: &CacheKey) -> Option<TableRef> {
        self.table_for(key).ok()
    }
}
