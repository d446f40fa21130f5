//! The `Bqt` facade: cached query submission over a bounded job pool.

use crate::cache::{
    resolve, CacheBackend, CacheError, CacheKey, CacheMetadata, CachedResult, Clock,
    LocalDiskCache, NullCache, RemoteTableCache, SystemClock, Ttl,
};
use crate::config::AppConfig;
use crate::job::{
    Confirm, JobError, JobPool, JobPoolError, JobResult, QueryOutput, ResultCallback,
    ResultFormat, WaitOutcome, WaitSettings,
};
use crate::partition::PartitionSelection;
use crate::warehouse::{
    BigQueryWarehouse, JobConfig, MemoryWarehouse, ResultSet, TableRef, Warehouse,
    WriteDisposition,
};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a query interacts with the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve from the cache when possible, store fresh results.
    #[default]
    Use,
    /// Always run the query and overwrite the cached entry.
    Renew,
    /// Neither read nor write the cache.
    Bypass,
}

impl CacheMode {
    fn reads(&self) -> bool {
        matches!(self, CacheMode::Use)
    }

    fn writes(&self) -> bool {
        !matches!(self, CacheMode::Bypass)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub cache: CacheMode,
    pub format: ResultFormat,
    /// Explicit destination table. Without one, the remote cache table is
    /// used when the cache is written.
    pub destination: Option<TableRef>,
    pub write_disposition: Option<WriteDisposition>,
    pub use_legacy_sql: bool,
}

impl QueryOptions {
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_format(mut self, format: ResultFormat) -> Self {
        self.format = format;
        self
    }
}

/// Outcome of [`Bqt::submit`].
#[derive(Debug, Clone)]
pub enum QuerySubmission {
    /// Served from the cache without running a job.
    Cached(CachedResult),
    /// A job was submitted and is tracked by the pool.
    Job(JobResult),
}

impl QuerySubmission {
    pub fn is_cached(&self) -> bool {
        matches!(self, QuerySubmission::Cached(_))
    }

    pub fn job(&self) -> Option<&JobResult> {
        match self {
            QuerySubmission::Job(job) => Some(job),
            QuerySubmission::Cached(_) => None,
        }
    }

    /// Materialize the rows. `Ok(None)` when the wait was interrupted.
    pub async fn results(
        &self,
        format: ResultFormat,
        cancel: &CancellationToken,
    ) -> Result<Option<QueryOutput>, JobError> {
        match self {
            QuerySubmission::Cached(cached) => QueryOutput::render(&cached.payload, format).map(Some),
            QuerySubmission::Job(job) => job.results(format, cancel).await,
        }
    }
}

pub struct Bqt {
    warehouse: Arc<dyn Warehouse>,
    cache: Arc<dyn CacheBackend>,
    pool: Arc<JobPool>,
    wait_settings: WaitSettings,
    clock: Arc<dyn Clock>,
    job_timeout: Option<Duration>,
}

impl std::fmt::Debug for Bqt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bqt")
            .field("warehouse", &self.warehouse.name())
            .field("cache", &self.cache.kind())
            .field("concurrency", &self.pool.concurrency())
            .finish()
    }
}

impl Bqt {
    pub fn builder(warehouse: Arc<dyn Warehouse>) -> BqtBuilder {
        BqtBuilder::new(warehouse)
    }

    /// Build a client from application configuration. `local` swaps the
    /// configured warehouse for an in-process one.
    pub async fn from_config(
        config: &AppConfig,
        local: bool,
        confirm: Arc<dyn Confirm>,
    ) -> Result<Self> {
        let warehouse: Arc<dyn Warehouse> = if local || config.warehouse.kind == "memory" {
            Arc::new(MemoryWarehouse::new())
        } else {
            let project_id = config
                .warehouse
                .project_id
                .as_deref()
                .context("BigQuery warehouse requires 'project_id'")?;
            Arc::new(
                BigQueryWarehouse::connect(
                    config.warehouse.credentials_path.as_deref(),
                    project_id,
                    config.warehouse.location.clone(),
                )
                .await
                .context("Failed to connect to BigQuery")?,
            )
        };

        let ttl = Ttl::from_seconds(config.cache.ttl_seconds);
        let cache: Arc<dyn CacheBackend> = match config.cache.backend.as_str() {
            "local" => {
                let dir = config.cache.resolved_dir();
                let mut cache = LocalDiskCache::new(&dir, warehouse.clone())
                    .with_context(|| format!("Failed to open cache directory {}", dir.display()))?
                    .with_ttl(ttl);
                if let Some(max_age) = config.cache.sweep_max_age_seconds {
                    cache = cache.with_sweep(
                        config.cache.sweep_probability,
                        Duration::from_secs(max_age),
                    );
                } else if let Ttl::Seconds(secs) = ttl {
                    cache = cache
                        .with_sweep(config.cache.sweep_probability, Duration::from_secs(secs));
                }
                Arc::new(cache)
            }
            "remote" => {
                let mut cache = RemoteTableCache::new(warehouse.clone(), config.cache.dataset.clone())
                    .with_ttl(ttl);
                if let Some(prefix) = &config.cache.table_prefix {
                    cache = cache.with_prefix(prefix.clone());
                }
                Arc::new(cache)
            }
            _ => Arc::new(NullCache),
        };

        Ok(BqtBuilder::new(warehouse)
            .cache(cache)
            .concurrency(config.jobs.concurrency)
            .poll_interval(Duration::from_millis(config.jobs.poll_interval_ms))
            .pool_poll_interval(Duration::from_millis(config.jobs.pool_poll_interval_ms))
            .confirm(confirm)
            .job_timeout(Duration::from_millis(config.warehouse.job_timeout_ms))
            .build())
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<JobPool> {
        &self.pool
    }

    /// Serve `sql` from the cache, or submit it as a pool-tracked job.
    ///
    /// Waits for a free pool slot before submitting. Fails up front with
    /// `CacheNotConfigured` unless the cache is bypassed. Missing and stale
    /// cache entries fall through to a new job; other cache failures are
    /// logged and also fall through.
    #[tracing::instrument(
        name = "bqt_submit",
        skip(self, sql, options, cancel),
        fields(
            bqt.sql = tracing::field::Empty,
            bqt.cache_key = tracing::field::Empty,
            bqt.cache_hit = tracing::field::Empty,
            bqt.job_id = tracing::field::Empty,
        )
    )]
    pub async fn submit(
        &self,
        sql: &str,
        options: &QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<QuerySubmission> {
        if crate::telemetry::include_sql_in_traces() {
            tracing::Span::current().record("bqt.sql", sql);
        }
        let key = resolve(sql);
        tracing::Span::current().record("bqt.cache_key", key.as_str());

        if options.cache != CacheMode::Bypass {
            self.cache.ensure_configured()?;
        }
        if options.cache.reads() {
            if let Some(cached) = self.lookup(&key).await? {
                tracing::Span::current().record("bqt.cache_hit", true);
                info!(key = %key, job_id = %cached.metadata.job_id, "Serving query from cache");
                return Ok(QuerySubmission::Cached(cached));
            }
        }
        tracing::Span::current().record("bqt.cache_hit", false);

        let reservation = self
            .pool
            .reserve_slot(cancel)
            .await
            .context("No job pool slot available")?;

        let job_config = self.job_config(&key, options);
        let handle = self.warehouse.submit_query(sql, &job_config).await?;
        tracing::Span::current().record("bqt.job_id", handle.job_id.as_str());
        info!(job_id = %handle.job_id, "Submitted query job");

        let job = JobResult::with_query(
            self.warehouse.clone(),
            handle,
            self.wait_settings.clone(),
            sql,
        );
        if options.cache.writes() {
            job.register_on_results_callback(self.store_callback(key));
        }
        Ok(QuerySubmission::Job(self.pool.queue_reserved(job, reservation)))
    }

    /// Submit `sql` and wait for its rows. `Ok(None)` when interrupted.
    pub async fn query(
        &self,
        sql: &str,
        options: &QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<QueryOutput>> {
        let submission = self.submit(sql, options, cancel).await?;
        Ok(submission.results(options.format, cancel).await?)
    }

    /// Misses and stale entries are `Ok(None)`. `CacheNotConfigured` is
    /// returned; other backend failures are logged and treated as a miss.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        match self.cache.hit(key).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e @ CacheError::CacheNotConfigured(_)) => return Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache hit test failed");
                return Ok(None);
            }
        }
        match self.cache.fetch(key).await {
            Ok(cached) => Ok(Some(cached)),
            Err(CacheError::CacheMiss(_)) => Ok(None),
            Err(CacheError::StaleCacheEntry { job_id, .. }) => {
                debug!(key = %key, job_id = %job_id, "Stale cache entry, running query again");
                Ok(None)
            }
            Err(e @ CacheError::CacheNotConfigured(_)) => Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache fetch failed, running query again");
                Ok(None)
            }
        }
    }

    fn job_config(&self, key: &CacheKey, options: &QueryOptions) -> JobConfig {
        let cache_destination = if options.cache.writes() {
            self.cache.job_destination(key)
        } else {
            None
        };
        let (destination, default_disposition) = match (&options.destination, cache_destination) {
            (Some(destination), _) => (Some(destination.clone()), WriteDisposition::default()),
            (None, Some(cache_table)) => (Some(cache_table), WriteDisposition::Truncate),
            (None, None) => (None, WriteDisposition::default()),
        };
        JobConfig {
            destination,
            write_disposition: options.write_disposition.unwrap_or(default_disposition),
            use_legacy_sql: options.use_legacy_sql,
            job_timeout: self.job_timeout,
        }
    }

    fn store_callback(&self, key: CacheKey) -> ResultCallback {
        let cache = self.cache.clone();
        let clock = self.clock.clone();
        Arc::new(move |rows: ResultSet, job: JobResult| -> BoxFuture<'static, ()> {
            let cache = cache.clone();
            let key = key.clone();
            let created_at = clock.now();
            async move {
                let metadata = match job.last_status() {
                    Some(status) => CacheMetadata::from_status(&status, created_at),
                    None => CacheMetadata {
                        job_id: job.job_id().to_string(),
                        location: job.handle().location.clone(),
                        created_at,
                        destination: None,
                    },
                };
                match cache.store(&key, &rows, &metadata).await {
                    Ok(()) => debug!(key = %key, job_id = %metadata.job_id, "Stored query result in cache"),
                    Err(e) => warn!(key = %key, error = %e, "Failed to store query result in cache"),
                }
            }
            .boxed()
        })
    }

    /// Remove the cached entry for `sql`. Returns whether one existed.
    pub async fn clear_cache(&self, sql: &str) -> Result<bool, CacheError> {
        self.cache.clear(&resolve(sql)).await
    }

    pub async fn clear_all_cache(&self) -> Result<usize, CacheError> {
        self.cache.clear_all().await
    }

    pub async fn sweep_cache(&self) -> Result<usize, CacheError> {
        self.cache.sweep().await
    }

    pub async fn wait_for_jobs(
        &self,
        min_free_slots: Option<usize>,
        halt_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, JobPoolError> {
        self.pool
            .wait_for_jobs(min_free_slots, halt_on_error, cancel)
            .await
    }

    pub async fn wait_for_job(
        &self,
        job: &JobResult,
        halt_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, JobPoolError> {
        self.pool.wait_for_job(job, halt_on_error, cancel).await
    }

    /// Delete the tables `selection` picks after one confirmation covering
    /// all of them. Returns the deleted tables; empty when declined.
    #[tracing::instrument(name = "delete_tables", skip(self, confirm), fields(dataset = %selection.dataset, base = %selection.base))]
    pub async fn delete_tables(
        &self,
        selection: &PartitionSelection,
        confirm: &dyn Confirm,
    ) -> Result<Vec<TableRef>> {
        let tables = self
            .warehouse
            .list_tables(&selection.dataset)
            .await
            .with_context(|| format!("Failed to list tables of {}", selection.dataset))?;
        let selected = selection.select(&tables);
        if selected.is_empty() {
            info!("No matching tables");
            return Ok(Vec::new());
        }

        let names: Vec<String> = selected.iter().map(|t| t.to_string()).collect();
        let prompt = format!("Delete {} table(s): {}?", selected.len(), names.join(", "));
        if !confirm.confirm(&prompt) {
            info!("Deletion declined, nothing deleted");
            return Ok(Vec::new());
        }

        let mut deleted = Vec::with_capacity(selected.len());
        for table in selected {
            match self.warehouse.delete_table(&table).await {
                Ok(()) => {
                    info!(table = %table, "Deleted table");
                    deleted.push(table);
                }
                Err(e) if e.is_not_found() => {
                    debug!(table = %table, "Table already gone");
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to delete {}", table)))
                }
            }
        }
        Ok(deleted)
    }
}

/// Builder for [`Bqt`].
pub struct BqtBuilder {
    warehouse: Arc<dyn Warehouse>,
    cache: Option<Arc<dyn CacheBackend>>,
    pool: Option<Arc<JobPool>>,
    concurrency: usize,
    pool_poll_interval: Option<Duration>,
    wait_settings: WaitSettings,
    clock: Arc<dyn Clock>,
    job_timeout: Option<Duration>,
}

impl BqtBuilder {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            cache: None,
            pool: None,
            concurrency: crate::job::DEFAULT_CONCURRENCY,
            pool_poll_interval: None,
            wait_settings: WaitSettings::default(),
            clock: Arc::new(SystemClock),
            job_timeout: None,
        }
    }

    /// Defaults to [`NullCache`].
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share an existing pool. Overrides `concurrency` and
    /// `pool_poll_interval`.
    pub fn pool(mut self, pool: Arc<JobPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Interval between polls of a single job.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.wait_settings.poll_interval = interval;
        self
    }

    pub fn pool_poll_interval(mut self, interval: Duration) -> Self {
        self.pool_poll_interval = Some(interval);
        self
    }

    /// Asked whether to cancel remote jobs when a wait is interrupted.
    pub fn confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.wait_settings.confirm = confirm;
        self
    }

    pub fn max_result_bytes(mut self, bytes: u64) -> Self {
        self.wait_settings.max_result_bytes = Some(bytes);
        self
    }

    /// Clock stamped on cache metadata.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Bqt {
        let pool = self.pool.unwrap_or_else(|| {
            let mut pool = JobPool::new(self.concurrency)
                .with_confirm(self.wait_settings.confirm.clone());
            if let Some(interval) = self.pool_poll_interval {
                pool = pool.with_poll_interval(interval);
            }
            Arc::new(pool)
        });
        Bqt {
            warehouse: self.warehouse,
            cache: self.cache.unwrap_or_else(|| Arc::new(NullCache)),
            pool,
            wait_settings: self.wait_settings,
            clock: self.clock,
            job_timeout: self.job_timeout,
        }
    }
}
