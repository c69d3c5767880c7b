//! Download worker for restore.

use crate::executor::pool::Worker;
use crate::fs::metadata::{apply_mode, FileMetadata, Ownership};
use crate::store::keys::KeyLayout;
use crate::store::session::StoreSession;
use crate::transfer::progress::{format_bytes, RunStats};
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Settings shared by the download workers of one restore.
pub struct DownloadContext {
    pub layout: KeyLayout,
    /// Batch directory the fileset was uploaded from
    pub origin: String,
    pub target: PathBuf,
    pub ownership: Ownership,
    /// Apply each object's stored mode
    pub preserve: bool,
    /// Download even when the local size already matches
    pub force: bool,
    pub stats: Arc<RunStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded(u64),
    Skipped,
}

pub struct Downloader {
    ctx: Arc<DownloadContext>,
    session: StoreSession,
}

impl Downloader {
    pub fn new(ctx: Arc<DownloadContext>, session: StoreSession) -> Self {
        Self { ctx, session }
    }

    pub async fn download(&mut self, name: &str) -> Result<DownloadOutcome> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(SyncError::Config(format!(
                "refusing manifest entry {name:?}: not a plain file name"
            )));
        }

        let key = self.ctx.layout.file_key(&self.ctx.origin, name);
        let dest = self.ctx.target.join(name);

        if !self.ctx.force {
            if let Ok(local) = tokio::fs::metadata(&dest).await {
                let remote = self
                    .session
                    .head(&key)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(key.clone()))?;
                if local.len() == remote.size {
                    debug!("{} already present with matching size", dest.display());
                    return Ok(DownloadOutcome::Skipped);
                }
                info!(
                    "{} size differs ({} local, {} remote), downloading again",
                    dest.display(),
                    local.len(),
                    remote.size
                );
            }
        }

        let partial = self.ctx.target.join(format!(".{name}.partial"));
        match self.fetch(&key, &partial, &dest).await {
            Ok(size) => {
                info!("restored {} ({})", dest.display(), format_bytes(size));
                Ok(DownloadOutcome::Downloaded(size))
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("could not remove {}: {}", partial.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn fetch(&mut self, key: &str, partial: &Path, dest: &Path) -> Result<u64> {
        let object = self.session.get_to_file(key, partial).await?;

        let written = tokio::fs::metadata(partial).await?.len();
        if written != object.size {
            return Err(SyncError::IntegrityMismatch {
                key: key.to_string(),
                detail: format!("received {} of {} bytes", written, object.size),
            });
        }

        self.ctx.ownership.apply(partial)?;
        if self.ctx.preserve {
            match FileMetadata::from_object(&object.metadata) {
                Some(stat) => apply_mode(partial, stat.permissions())?,
                None => debug!("{} has no stat metadata, keeping default mode", key),
            }
        }

        tokio::fs::rename(partial, dest).await?;
        Ok(written)
    }
}

#[async_trait]
impl Worker for Downloader {
    type Item = String;

    async fn process(&mut self, name: String) -> Result<()> {
        let stats = Arc::clone(&self.ctx.stats);
        match self.download(&name).await {
            Ok(DownloadOutcome::Downloaded(bytes)) => stats.record_transfer(bytes),
            Ok(DownloadOutcome::Skipped) => stats.record_skip(),
            // one bad file does not stop the rest of the partition
            Err(e) => {
                stats.record_failure();
                error!("download of {} failed: {}", name, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::retry::RetryConfig;
    use crate::store::{Body, ObjectMetadata, RemoteStore, METADATA_STAT};
    use bytes::Bytes;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    async fn downloader(
        store: &MemoryStore,
        target: &Path,
        preserve: bool,
        force: bool,
    ) -> Downloader {
        let ctx = Arc::new(DownloadContext {
            layout: KeyLayout::new(None, "node1"),
            origin: "/data/run1".into(),
            target: target.to_path_buf(),
            ownership: Ownership::default(),
            preserve,
            force,
            stats: Arc::new(RunStats::new()),
        });
        let session = StoreSession::open(Arc::new(store.clone()), RetryConfig::no_delay(1))
            .await
            .unwrap();
        Downloader::new(ctx, session)
    }

    async fn put(store: &MemoryStore, name: &str, body: &'static [u8], mode: u32) {
        let stat = FileMetadata {
            uid: 0,
            gid: 0,
            mode,
            user: None,
            group: None,
        };
        let mut metadata = ObjectMetadata::new();
        metadata.insert(METADATA_STAT.into(), stat.to_json().unwrap());
        store
            .put(
                &format!("node1:/data/run1/{name}"),
                Body::Bytes(Bytes::from_static(body)),
                metadata,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_download_applies_mode_and_leaves_no_partial() {
        let store = MemoryStore::new();
        put(&store, "a.dat", b"hello", 0o100600).await;
        let target = TempDir::new().unwrap();

        let mut downloader = downloader(&store, target.path(), true, false).await;
        assert_eq!(
            downloader.download("a.dat").await.unwrap(),
            DownloadOutcome::Downloaded(5)
        );

        let dest = target.path().join("a.dat");
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o600);
        assert!(!target.path().join(".a.dat.partial").exists());
    }

    #[tokio::test]
    async fn test_matching_size_skips_unless_forced() {
        let store = MemoryStore::new();
        put(&store, "a.dat", b"hello", 0o100644).await;
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("a.dat"), b"HELLO").unwrap();

        let mut lazy = downloader(&store, target.path(), false, false).await;
        assert_eq!(lazy.download("a.dat").await.unwrap(), DownloadOutcome::Skipped);
        assert_eq!(fs::read(target.path().join("a.dat")).unwrap(), b"HELLO");

        let mut forced = downloader(&store, target.path(), false, true).await;
        assert_eq!(
            forced.download("a.dat").await.unwrap(),
            DownloadOutcome::Downloaded(5)
        );
        assert_eq!(fs::read(target.path().join("a.dat")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_size_mismatch_downloads_again() {
        let store = MemoryStore::new();
        put(&store, "a.dat", b"hello", 0o100644).await;
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("a.dat"), b"hel").unwrap();

        let mut downloader = downloader(&store, target.path(), false, false).await;
        assert_eq!(
            downloader.download("a.dat").await.unwrap(),
            DownloadOutcome::Downloaded(5)
        );
        assert_eq!(fs::read(target.path().join("a.dat")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_missing_object_fails_cleanly() {
        let store = MemoryStore::new();
        let target = TempDir::new().unwrap();

        let mut downloader = downloader(&store, target.path(), false, false).await;
        assert!(matches!(
            downloader.download("gone.dat").await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
        assert!(downloader.download("../escape").await.is_err());
    }
}
