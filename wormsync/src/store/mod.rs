//! Remote object store abstraction.
//!
//! [`RemoteStore`] is the narrow interface the engine needs from an object
//! store. Workers never hold a store directly; they go through a
//! [`session::StoreSession`] built from a [`StoreConnector`], which owns the
//! retry and reconnect policy.

pub mod keys;
pub mod memory;
pub mod retry;
pub mod s3;
pub mod session;

use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata field holding the JSON-encoded [`crate::fs::metadata::FileMetadata`].
pub const METADATA_STAT: &str = "stat";

/// Metadata field holding the lowercase hex SHA-256 of the object body.
pub const METADATA_DIGEST: &str = "sha256";

pub type ObjectMetadata = HashMap<String, String>;

/// Integrity tag reported by the store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityTag {
    /// Plain SHA-256 of the whole body, lowercase hex.
    Sha256(String),
    /// Tag assembled from per-part digests (`<digest>-<parts>`). Never equal
    /// to a content digest.
    Composite(String),
    /// Some other tag (an MD5 ETag, for example).
    Opaque(String),
}

impl IntegrityTag {
    /// Classify an ETag-like string. Multipart tags carry a `-<parts>` suffix.
    pub fn classify(raw: &str) -> Self {
        let tag = raw.trim_matches('"');
        if tag.contains('-') {
            IntegrityTag::Composite(tag.to_string())
        } else {
            IntegrityTag::Opaque(tag.to_string())
        }
    }
}

/// A stored object as seen by `head`/`list`.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub integrity: Option<IntegrityTag>,
    pub metadata: ObjectMetadata,
    pub last_modified: Option<DateTime<Utc>>,
}

impl RemoteObject {
    /// Digest persisted in the object's metadata, if any.
    pub fn stored_digest(&self) -> Option<&str> {
        self.metadata.get(METADATA_DIGEST).map(String::as_str)
    }
}

/// Body of a monolithic put.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Bytes),
    File(PathBuf),
}

/// A part accepted by the store during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub number: i32,
    pub etag: String,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Object attributes, `None` when the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<RemoteObject>>;

    /// Stream the object body into `dest`.
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<RemoteObject>;

    async fn get_bytes(&self, key: &str) -> Result<Bytes>;

    async fn put(&self, key: &str, body: Body, metadata: ObjectMetadata) -> Result<()>;

    /// Replace the metadata of an existing object, keeping its body.
    async fn update_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<()>;

    /// Every object whose key starts with `prefix`. Metadata is not populated.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Start a multipart upload, returning its upload id.
    async fn create_multipart(&self, key: &str, metadata: ObjectMetadata) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Builds fresh store clients. Called once per worker and again on every
/// reconnect.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>>;
}
