use crate::sync::SyncItem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarehouseConfig {
    /// "bigquery" or "memory"
    #[serde(default = "default_warehouse_kind")]
    pub kind: String,
    pub project_id: Option<String>,
    pub location: Option<String>,
    /// Service account key file. Application default credentials are used
    /// when unset.
    pub credentials_path: Option<PathBuf>,
    /// Passed to the warehouse with every job.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            kind: default_warehouse_kind(),
            project_id: None,
            location: None,
            credentials_path: None,
            job_timeout_ms: default_job_timeout_ms(),
        }
    }
}

fn default_warehouse_kind() -> String {
    "bigquery".to_string()
}

fn default_job_timeout_ms() -> u64 {
    540_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// "none", "local" or "remote"
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    /// Seconds an entry stays valid; -1 never expires.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    /// Directory for the local backend. Defaults to ~/.bqt/cache
    pub dir: Option<PathBuf>,
    /// Dataset for the remote backend.
    pub dataset: Option<String>,
    pub table_prefix: Option<String>,
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,
    pub sweep_max_age_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            ttl_seconds: default_ttl_seconds(),
            dir: None,
            dataset: None,
            table_prefix: None,
            sweep_probability: default_sweep_probability(),
            sweep_max_age_seconds: None,
        }
    }
}

fn default_cache_backend() -> String {
    "none".to_string()
}

fn default_ttl_seconds() -> i64 {
    -1
}

fn default_sweep_probability() -> f64 {
    0.1
}

impl CacheConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| default_base_dir().join("cache"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Single-job wait polling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pool-wide polling interval.
    #[serde(default = "default_pool_poll_interval_ms")]
    pub pool_poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            pool_poll_interval_ms: default_pool_poll_interval_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    crate::job::DEFAULT_CONCURRENCY
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_pool_poll_interval_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Cursor store path. Defaults to ~/.bqt/sync.db
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_plaid_base_url")]
    pub plaid_base_url: String,
    pub client_id: Option<String>,
    pub secret: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub items: Vec<SyncItem>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            plaid_base_url: default_plaid_base_url(),
            client_id: None,
            secret: None,
            page_size: default_page_size(),
            items: Vec::new(),
        }
    }
}

fn default_plaid_base_url() -> String {
    crate::sync::DEFAULT_BASE_URL.to_string()
}

fn default_page_size() -> u32 {
    crate::sync::DEFAULT_PAGE_SIZE
}

impl SyncConfig {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| default_base_dir().join("sync.db"))
    }
}

fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bqt")
}

impl AppConfig {
    /// Load configuration from an optional TOML file and environment
    /// variables.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Example: BQT_CACHE__TTL_SECONDS=3600
        builder = builder.add_source(
            config::Environment::with_prefix("BQT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate cross-field requirements
    pub fn validate(&self) -> Result<()> {
        match self.warehouse.kind.as_str() {
            "bigquery" => {
                if self.warehouse.project_id.is_none() {
                    anyhow::bail!("BigQuery warehouse requires 'project_id'");
                }
            }
            "memory" => {}
            other => anyhow::bail!("Invalid warehouse kind: {}", other),
        }

        match self.cache.backend.as_str() {
            "remote" => {
                if self.cache.dataset.as_deref().map_or(true, str::is_empty) {
                    anyhow::bail!("Remote cache requires 'dataset'");
                }
            }
            "none" | "local" => {}
            other => anyhow::bail!("Invalid cache backend: {}", other),
        }

        if self.cache.ttl_seconds < -1 {
            anyhow::bail!(
                "cache ttl_seconds must be -1 (never expire) or non-negative, got {}",
                self.cache.ttl_seconds
            );
        }
        if !(0.0..=1.0).contains(&self.cache.sweep_probability) {
            anyhow::bail!(
                "cache sweep_probability must be within [0, 1], got {}",
                self.cache.sweep_probability
            );
        }
        if self.jobs.concurrency == 0 {
            anyhow::bail!("jobs concurrency must be at least 1");
        }

        Ok(())
    }

    /// Checks needed only by the `sync` command.
    pub fn validate_sync(&self) -> Result<()> {
        if self.sync.client_id.is_none() || self.sync.secret.is_none() {
            anyhow::bail!("Sync requires 'client_id' and 'secret'");
        }
        if self.sync.items.is_empty() {
            anyhow::bail!("Sync requires at least one entry in 'items'");
        }
        Ok(())
    }
}
