//! Upload pipeline: one local path in, at most one remote object out.
//!
//! stat -> dedup -> digest -> manifest -> monolithic or multipart transfer.
//! A failed transfer aborts any open multipart upload and the whole transfer
//! is retried with a fresh connection until the attempt budget is spent. Any
//! other failure that survives the per-call store retries also counts as a
//! persistent failure of the file, so it is never dropped silently.

use crate::executor::manifest::Manifest;
use crate::executor::pool::Worker;
use crate::fs::metadata::FileMetadata;
use crate::fs::walker::list_batch_dir;
use crate::fs::watcher::RescanHandle;
use crate::store::keys::{is_temporary, KeyLayout};
use crate::store::retry::RetryConfig;
use crate::store::session::StoreSession;
use crate::store::{Body, ObjectMetadata, METADATA_DIGEST, METADATA_STAT};
use crate::sync::dedup::{local_digest, ContentDedupChecker, DedupOutcome};
use crate::transfer::chunk::ChunkPlanner;
use crate::transfer::progress::{format_bytes, RunStats};
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a path produced no upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Gone, or not a regular file
    Missing,
    Temporary,
    Identical,
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: u64, parts: usize },
    Skipped(SkipReason),
}

/// Settings and shared state common to every upload worker of a run.
pub struct UploadContext {
    pub layout: KeyLayout,
    pub planner: ChunkPlanner,
    pub transfer_retry: RetryConfig,
    /// Write a manifest of the batch directory with every upload
    pub index: bool,
    /// Where failed paths go to be picked up again; `None` for single passes
    pub rescan: Option<RescanHandle>,
    pub stats: Arc<RunStats>,
}

pub struct UploadPipeline {
    ctx: Arc<UploadContext>,
    session: StoreSession,
    checker: ContentDedupChecker,
}

impl UploadPipeline {
    pub fn new(ctx: Arc<UploadContext>, session: StoreSession) -> Self {
        Self {
            ctx,
            session,
            checker: ContentDedupChecker::new(),
        }
    }

    /// Upload `path`. Every error is fatal for the file: either a
    /// `PersistentUploadFailure` or a `Permission` error.
    pub async fn upload(&mut self, path: &Path) -> Result<UploadOutcome> {
        match self.try_upload(path).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.escalate(path, e)),
        }
    }

    fn escalate(&self, path: &Path, err: SyncError) -> SyncError {
        if err.is_fatal() {
            return err;
        }
        // a store error was already retried by the session
        let attempts = if err.is_transient() {
            self.session.attempts()
        } else {
            1
        };
        SyncError::PersistentUploadFailure {
            path: path.to_path_buf(),
            attempts,
            last_error: err.to_string(),
        }
    }

    async fn try_upload(&mut self, path: &Path) -> Result<UploadOutcome> {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Ok(UploadOutcome::Skipped(SkipReason::Missing)),
        };
        if is_temporary(&name) {
            return Ok(UploadOutcome::Skipped(SkipReason::Temporary));
        }

        let path = std::path::absolute(path)?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(UploadOutcome::Skipped(SkipReason::Missing)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} vanished before upload", path.display());
                return Ok(UploadOutcome::Skipped(SkipReason::Missing));
            }
            Err(e) => return Err(e.into()),
        };
        let key = self.ctx.layout.object_key(&path);

        let verdict = match self.checker.check(&mut self.session, &key, &path, size).await {
            Ok(verdict) => verdict,
            Err(SyncError::LocalFileRace(_)) => {
                return Ok(UploadOutcome::Skipped(SkipReason::Missing));
            }
            Err(e) => return Err(e),
        };
        match verdict.outcome {
            DedupOutcome::SkipIdentical => {
                debug!("{} already stored", key);
                return Ok(UploadOutcome::Skipped(SkipReason::Identical));
            }
            DedupOutcome::SkipCorrupt => return Ok(UploadOutcome::Skipped(SkipReason::Corrupt)),
            DedupOutcome::UploadNeeded => {}
        }

        let digest = match verdict.local_digest {
            Some(digest) => digest,
            None => match local_digest(&path).await {
                Ok(digest) => digest,
                Err(SyncError::LocalFileRace(_)) => {
                    return Ok(UploadOutcome::Skipped(SkipReason::Missing));
                }
                Err(e) => return Err(e),
            },
        };
        let metadata = match object_metadata(&path, &digest) {
            Ok(metadata) => metadata,
            Err(SyncError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(UploadOutcome::Skipped(SkipReason::Missing));
            }
            Err(e) => return Err(e),
        };

        if self.ctx.index {
            if let Some(dir) = path.parent() {
                match self.write_manifest(&path, dir, &name).await {
                    Ok(()) => {}
                    Err(SyncError::LocalFileRace(_)) => {
                        debug!("{} vanished while listing {}", path.display(), dir.display());
                        return Ok(UploadOutcome::Skipped(SkipReason::Missing));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.transfer_with_retry(&path, &key, size, metadata).await
    }

    /// Store the manifest of `dir` that goes with uploading `path`. Manifests
    /// are immutable: one left by an earlier, interrupted attempt is kept.
    async fn write_manifest(&mut self, path: &Path, dir: &Path, name: &str) -> Result<()> {
        let key = self.ctx.layout.manifest_key(path);
        if self.session.head(&key).await?.is_some() {
            debug!("manifest {} already stored", key);
            return Ok(());
        }

        let listing = match list_batch_dir(dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::LocalFileRace(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = Manifest::new(self.ctx.layout.host(), dir, name, listing);
        if !manifest.contains(name) {
            return Err(SyncError::LocalFileRace(path.to_path_buf()));
        }

        self.session
            .put(&key, Body::Bytes(manifest.to_bytes()?), ObjectMetadata::new())
            .await?;
        info!("wrote manifest {} ({} files)", key, manifest.files.len());
        Ok(())
    }

    async fn transfer_with_retry(
        &mut self,
        path: &Path,
        key: &str,
        size: u64,
        metadata: ObjectMetadata,
    ) -> Result<UploadOutcome> {
        let retry = self.ctx.transfer_retry;
        let mut backoff = retry.backoff();
        let mut attempt = 1;

        loop {
            match self.transfer(path, key, size, metadata.clone()).await {
                Ok(parts) => {
                    info!("uploaded {} ({})", key, format_bytes(size));
                    return Ok(UploadOutcome::Uploaded { bytes: size, parts });
                }
                Err(SyncError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} vanished during upload", path.display());
                    return Ok(UploadOutcome::Skipped(SkipReason::Missing));
                }
                Err(e) if attempt < retry.attempts => {
                    warn!(
                        "upload of {} failed (attempt {}/{}), retrying: {}",
                        key, attempt, retry.attempts, e
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                    self.session.reconnect().await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SyncError::PersistentUploadFailure {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    /// One transfer attempt. Returns the number of parts (1 for a plain put).
    async fn transfer(
        &mut self,
        path: &Path,
        key: &str,
        size: u64,
        metadata: ObjectMetadata,
    ) -> Result<usize> {
        if !self.ctx.planner.is_multipart(size) {
            self.session
                .put_once(key, Body::File(path.to_path_buf()), metadata)
                .await?;
            return Ok(1);
        }

        let plan = self.ctx.planner.plan(size);
        debug!(
            "multipart upload of {}: {} parts of {}",
            key,
            plan.part_count(),
            format_bytes(plan.chunk_size)
        );
        let file = tokio::fs::File::open(path).await?;
        let mut upload = self.session.begin_multipart(key, metadata).await?;

        let result: Result<usize> = async {
            let mut reader = plan.reader(file);
            while let Some((number, data)) = reader.next_part().await? {
                upload.put_part(number, data).await?;
            }
            upload.complete().await
        }
        .await;

        match result {
            Ok(parts) => Ok(parts),
            Err(e) => {
                debug!(
                    "aborting multipart upload {} of {} after {} parts",
                    upload.upload_id(),
                    key,
                    upload.parts_uploaded()
                );
                if let Err(abort) = self.session.abort_multipart(upload).await {
                    warn!("could not abort multipart upload of {}: {}", key, abort);
                }
                Err(e)
            }
        }
    }
}

fn object_metadata(path: &Path, digest: &str) -> Result<ObjectMetadata> {
    let stat = FileMetadata::capture(path)?;
    let mut metadata = ObjectMetadata::new();
    metadata.insert(METADATA_STAT.to_string(), stat.to_json()?);
    metadata.insert(METADATA_DIGEST.to_string(), digest.to_string());
    Ok(metadata)
}

#[async_trait]
impl Worker for UploadPipeline {
    type Item = PathBuf;

    async fn process(&mut self, path: PathBuf) -> Result<()> {
        let stats = Arc::clone(&self.ctx.stats);
        match self.upload(&path).await {
            Ok(UploadOutcome::Uploaded { bytes, .. }) => stats.record_transfer(bytes),
            Ok(UploadOutcome::Skipped(SkipReason::Corrupt)) => stats.record_corrupt(),
            Ok(UploadOutcome::Skipped(_)) => stats.record_skip(),
            Err(e) => {
                stats.record_failure();
                if let Some(rescan) = &self.ctx.rescan {
                    rescan.rescan(path);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}
