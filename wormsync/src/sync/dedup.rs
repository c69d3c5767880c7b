//! Content-addressed dedup check.
//!
//! Files are write-once, so a remote object with the local file's size and
//! digest is the same file and the transfer can be skipped. A remote object
//! that disagrees with the local file is never overwritten: the remote copy is
//! authoritative and the mismatch is reported for an operator to look at.

use crate::store::session::StoreSession;
use crate::store::{IntegrityTag, RemoteObject, METADATA_DIGEST};
use crate::sync::digest::sha256_file_async;
use crate::utils::{Result, SyncError};
use std::io;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    UploadNeeded,
    SkipIdentical,
    SkipCorrupt,
}

/// Outcome plus the local digest, when the check had to compute it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupVerdict {
    pub outcome: DedupOutcome,
    pub local_digest: Option<String>,
}

impl DedupVerdict {
    fn new(outcome: DedupOutcome, local_digest: Option<String>) -> Self {
        Self {
            outcome,
            local_digest,
        }
    }
}

/// Digest of a local file. A file that vanished is a race, not a failure.
pub async fn local_digest(path: &Path) -> Result<String> {
    sha256_file_async(path.to_path_buf())
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SyncError::LocalFileRace(path.to_path_buf()),
            _ => SyncError::Io(e),
        })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentDedupChecker;

impl ContentDedupChecker {
    pub fn new() -> Self {
        Self
    }

    /// Compare `path` (of `local_size` bytes) with the object stored at `key`.
    pub async fn check(
        &self,
        session: &mut StoreSession,
        key: &str,
        path: &Path,
        local_size: u64,
    ) -> Result<DedupVerdict> {
        let Some(remote) = session.head(key).await? else {
            return Ok(DedupVerdict::new(DedupOutcome::UploadNeeded, None));
        };

        if remote.size != local_size {
            let err = SyncError::IntegrityMismatch {
                key: key.to_string(),
                detail: format!("remote size {} != local size {}", remote.size, local_size),
            };
            warn!("{}; keeping remote copy of {}", err, path.display());
            return Ok(DedupVerdict::new(DedupOutcome::SkipCorrupt, None));
        }

        let digest = local_digest(path).await?;
        let outcome = self.compare(session, key, path, &remote, &digest).await;
        Ok(DedupVerdict::new(outcome, Some(digest)))
    }

    async fn compare(
        &self,
        session: &mut StoreSession,
        key: &str,
        path: &Path,
        remote: &RemoteObject,
        digest: &str,
    ) -> DedupOutcome {
        if let Some(stored) = remote.stored_digest() {
            return digest_outcome(key, path, stored, digest);
        }

        match &remote.integrity {
            Some(IntegrityTag::Sha256(tag)) => {
                let outcome = digest_outcome(key, path, tag, digest);
                if outcome == DedupOutcome::SkipIdentical {
                    self.persist_digest(session, key, remote, digest).await;
                }
                outcome
            }
            other => {
                warn!(
                    "{} has no comparable digest ({}); assuming it matches {} by size only",
                    key,
                    match other {
                        Some(IntegrityTag::Composite(_)) => "multipart tag",
                        Some(_) => "opaque tag",
                        None => "no tag",
                    },
                    path.display()
                );
                DedupOutcome::SkipIdentical
            }
        }
    }

    /// Record the verified digest so later runs can skip the tag comparison.
    async fn persist_digest(
        &self,
        session: &mut StoreSession,
        key: &str,
        remote: &RemoteObject,
        digest: &str,
    ) {
        let mut metadata = remote.metadata.clone();
        metadata.insert(METADATA_DIGEST.to_string(), digest.to_string());
        match session.update_metadata(key, metadata).await {
            Ok(()) => debug!("stored digest for {}", key),
            Err(e) => warn!("could not store digest for {}: {}", key, e),
        }
    }
}

fn digest_outcome(key: &str, path: &Path, remote: &str, local: &str) -> DedupOutcome {
    if remote.eq_ignore_ascii_case(local) {
        DedupOutcome::SkipIdentical
    } else {
        let err = SyncError::IntegrityMismatch {
            key: key.to_string(),
            detail: format!("remote digest {remote} != local digest {local}"),
        };
        warn!("{}; keeping remote copy of {}", err, path.display());
        DedupOutcome::SkipCorrupt
    }
}
