//! Error kinds for the sync engine.
//!
//! Callers branch on the variant rather than on message text: transient store
//! failures are retried, integrity and race conditions are absorbed per file,
//! persistent upload failures and permission errors end the run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network or auth blip talking to the object store.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Size or digest disagreement on a write-once object.
    #[error("Integrity mismatch for {key}: {detail}")]
    IntegrityMismatch { key: String, detail: String },

    /// The local file disappeared between enqueue and processing.
    #[error("Local file vanished: {}", .0.display())]
    LocalFileRace(PathBuf),

    #[error("Upload of {} failed after {attempts} attempts: {last_error}", path.display())]
    PersistentUploadFailure {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("Permission denied: {0}")]
    Permission(String),
}

impl SyncError {
    /// Whether the failure is worth another attempt with a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientStore(_))
    }

    /// Whether the failure must end the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::PersistentUploadFailure { .. } | SyncError::Permission(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
