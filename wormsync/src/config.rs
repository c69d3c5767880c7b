//! Configuration management for wormsync.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Command-line flags are applied on top by the binary.

use crate::utils::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket holding the backed-up objects
    #[serde(default)]
    pub bucket: String,

    /// Custom S3 endpoint (MinIO, R2, Ceph...). AWS when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Static credentials. The AWS environment chain is used when unset.
    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    /// Operator-supplied prefix prepended to every object key
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Host name used in object keys (defaults to this machine's hostname)
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Files larger than this many bytes go through multipart upload
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Multipart part size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Attempts per store call (1 = no retry)
    #[serde(default = "default_store_attempts")]
    pub store_attempts: u32,

    /// Attempts per whole-file transfer (1 = no retry)
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,

    /// First backoff delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Terminate the run when one file exhausts its upload attempts
    #[serde(default = "default_true")]
    pub abort_on_persistent_failure: bool,

    /// Write a `-listdir.json` manifest for every batch directory
    #[serde(default = "default_true")]
    pub index: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub upload_workers: usize,

    #[serde(default = "default_workers")]
    pub download_workers: usize,

    /// Seconds between "workers still active" reports
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    /// Seconds between watch-path rescans
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colour escapes in log lines; turn off when stderr goes to a journal
    #[serde(default = "default_true")]
    pub ansi: bool,
}

// Default values
fn default_multipart_threshold() -> u64 {
    5120 * MIB
}

fn default_chunk_size() -> u64 {
    256 * MIB
}

fn default_store_attempts() -> u32 {
    5
}

fn default_upload_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_report_interval_secs() -> u64 {
    30
}

fn default_scan_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            chunk_size: default_chunk_size(),
            store_attempts: default_store_attempts(),
            upload_attempts: default_upload_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            abort_on_persistent_failure: true,
            index: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload_workers: default_workers(),
            download_workers: default_workers(),
            report_interval_secs: default_report_interval_secs(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Apply `WORMSYNC_*` and AWS credential environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bucket) = lookup("WORMSYNC_BUCKET") {
            self.store.bucket = bucket;
        }
        if let Some(endpoint) = lookup("WORMSYNC_ENDPOINT") {
            self.store.endpoint = Some(endpoint);
        }
        if let Some(region) = lookup("WORMSYNC_REGION") {
            self.store.region = Some(region);
        }
        if let Some(prefix) = lookup("WORMSYNC_KEY_PREFIX") {
            self.store.key_prefix = Some(prefix);
        }
        if let Some(key) = lookup("AWS_ACCESS_KEY_ID") {
            self.store.access_key = Some(key);
        }
        if let Some(secret) = lookup("AWS_SECRET_ACCESS_KEY") {
            self.store.secret_key = Some(secret);
        }
    }

    /// Host name used in object keys
    pub fn host_name(&self) -> String {
        self.store.host.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.bucket.is_empty() {
            return Err(SyncError::Config("store.bucket is required".into()));
        }
        if self.workers.upload_workers == 0 || self.workers.download_workers == 0 {
            return Err(SyncError::Config("worker counts must be at least 1".into()));
        }
        if self.transfer.store_attempts == 0 || self.transfer.upload_attempts == 0 {
            return Err(SyncError::Config("attempt counts must be at least 1".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(SyncError::Config("transfer.chunk_size must be positive".into()));
        }
        Ok(())
    }
}
