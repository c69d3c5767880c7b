//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wormsync::config::Config;
use wormsync::executor::{run_backup, run_restore, BackupRequest, RestoreRequest};
use wormsync::store::memory::MemoryStore;
use wormsync::store::{
    Body, CompletedPart, ObjectMetadata, RemoteObject, RemoteStore, StoreConnector,
};
use wormsync::transfer::progress::StatsSnapshot;
use wormsync::{Result, SyncError};

pub const HOST: &str = "node1";

/// Fast retries, small pools, fixed host name.
pub fn config() -> Config {
    let mut config = Config::default();
    config.store.bucket = "test-bucket".into();
    config.store.host = Some(HOST.into());
    config.transfer.retry_delay_ms = 1;
    config.transfer.retry_max_delay_ms = 5;
    config.workers.upload_workers = 2;
    config.workers.download_workers = 2;
    config.workers.report_interval_secs = 1;
    config.workers.scan_interval_secs = 0;
    config
}

pub fn multipart_config(threshold: u64, chunk_size: u64) -> Config {
    let mut config = config();
    config.transfer.multipart_threshold = threshold;
    config.transfer.chunk_size = chunk_size;
    config
}

/// Deterministic, non-repeating-per-part content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 7) as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

pub fn object_key(path: &Path) -> String {
    format!("{HOST}:{}", path.display())
}

/// Manifest written when uploading `path`.
pub fn manifest_key(path: &Path) -> String {
    format!("{}-listdir.json", object_key(path))
}

/// Restore of the batch directory `batch` into `target`.
pub fn restore_request(batch: &Path, target: &Path) -> RestoreRequest {
    RestoreRequest {
        origin: batch.to_string_lossy().into_owned(),
        target: target.to_path_buf(),
        ..RestoreRequest::default()
    }
}

pub async fn backup_once(
    config: &Config,
    connector: Arc<dyn StoreConnector>,
    root: &Path,
) -> Result<StatsSnapshot> {
    let request = BackupRequest {
        paths: vec![root.to_path_buf()],
        once: true,
        memory_probe: Arc::new(|| None::<u64>),
    };
    run_backup(config, connector, request, CancellationToken::new()).await
}

pub async fn restore(
    config: &Config,
    store: &MemoryStore,
    request: RestoreRequest,
) -> Result<StatsSnapshot> {
    run_restore(
        config,
        Arc::new(store.clone()),
        request,
        CancellationToken::new(),
    )
    .await
}

/// Call of the wrapped store that fails.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Upload of this part number
    Part(i32),
    /// Every `HEAD`
    Head,
}

/// `MemoryStore` that fails the calls picked by `fault` with a transient
/// error while `failures` is above zero, one failure per call.
#[derive(Clone)]
pub struct FailingStore {
    pub inner: MemoryStore,
    fault: Fault,
    failures: Arc<AtomicUsize>,
}

impl FailingStore {
    pub fn new(inner: MemoryStore, fault: Fault, failures: usize) -> Self {
        Self {
            inner,
            fault,
            failures: Arc::new(AtomicUsize::new(failures)),
        }
    }

    pub fn failures_left(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteStore for FailingStore {
    async fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
        if matches!(self.fault, Fault::Head) && self.take_failure() {
            return Err(SyncError::TransientStore(format!(
                "connection reset during HEAD {key}"
            )));
        }
        self.inner.head(key).await
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<RemoteObject> {
        self.inner.get_to_file(key, dest).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        self.inner.get_bytes(key).await
    }

    async fn put(&self, key: &str, body: Body, metadata: ObjectMetadata) -> Result<()> {
        self.inner.put(key, body, metadata).await
    }

    async fn update_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<()> {
        self.inner.update_metadata(key, metadata).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.inner.list(prefix).await
    }

    async fn create_multipart(&self, key: &str, metadata: ObjectMetadata) -> Result<String> {
        self.inner.create_multipart(key, metadata).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        if matches!(self.fault, Fault::Part(part) if part == number) && self.take_failure() {
            return Err(SyncError::TransientStore(format!(
                "connection reset while sending part {number}"
            )));
        }
        self.inner.upload_part(key, upload_id, number, data).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner.abort_multipart(key, upload_id).await
    }
}

#[async_trait]
impl StoreConnector for FailingStore {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}
