//! Batch manifests.
//!
//! Every indexed upload stores a manifest beside the file as
//! `<file key>-listdir.json`. It records the listing of the batch directory
//! taken just before the file was sent, names the fileset after that file and
//! is never rewritten. Restore picks one of them to learn which files belong
//! together.

use crate::utils::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Manifest document, serialized as `<file key>-listdir.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub host: String,
    /// Absolute path of the batch directory
    pub origin: String,
    /// Name of the file whose upload wrote this manifest
    pub fileset: String,
    /// Names of the regular files in `origin`, relative to it
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(host: &str, origin: &Path, fileset: &str, files: Vec<String>) -> Self {
        Self {
            host: host.to_string(),
            origin: origin.to_string_lossy().into_owned(),
            fileset: fileset.to_string(),
            files,
            created_at: Utc::now(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
