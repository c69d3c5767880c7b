//! In-process object store.
//!
//! Behaves like a bucket for the operations the engine uses and counts the
//! calls it receives, which lets tests assert "no transfer happened". Clones
//! share the same contents, so a `MemoryStore` is also its own connector.

use super::{
    Body, CompletedPart, IntegrityTag, ObjectMetadata, RemoteObject, RemoteStore,
    StoreConnector,
};
use crate::sync::digest::{sha256_bytes, sha256_hex};
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: ObjectMetadata,
    integrity: IntegrityTag,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<i32, Bytes>,
}

/// Call counters, cumulative since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub heads: usize,
    pub gets: usize,
    pub puts: usize,
    pub metadata_updates: usize,
    pub lists: usize,
    pub multipart_created: usize,
    pub parts_uploaded: usize,
    pub multipart_completed: usize,
    pub multipart_aborted: usize,
}

impl MemoryStats {
    /// Calls that move object bodies towards the store.
    pub fn transfers(&self) -> usize {
        self.puts + self.multipart_created + self.parts_uploaded
    }
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    clock: Option<DateTime<Utc>>,
    stats: MemoryStats,
}

impl State {
    /// Strictly increasing modification times, even within one clock tick.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn describe(key: &str, object: &StoredObject) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            size: object.data.len() as u64,
            integrity: Some(object.integrity.clone()),
            metadata: object.metadata.clone(),
            last_modified: Some(object.last_modified),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> MemoryStats {
        self.state().stats
    }

    /// Body of an object, bypassing the counters.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Multipart uploads that were started but neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Override the modification time reported for an object.
    pub fn set_last_modified(&self, key: &str, when: DateTime<Utc>) -> bool {
        match self.state().objects.get_mut(key) {
            Some(object) => {
                object.last_modified = when;
                true
            }
            None => false,
        }
    }

    fn store_object(&self, key: &str, data: Bytes, metadata: ObjectMetadata, integrity: IntegrityTag) {
        let mut state = self.state();
        let last_modified = state.tick();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata,
                integrity,
                last_modified,
            },
        );
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
        let mut state = self.state();
        state.stats.heads += 1;
        Ok(state.objects.get(key).map(|o| State::describe(key, o)))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<RemoteObject> {
        let (object, data) = {
            let mut state = self.state();
            state.stats.gets += 1;
            let stored = state
                .objects
                .get(key)
                .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
            (State::describe(key, stored), stored.data.clone())
        };
        tokio::fs::write(dest, &data).await?;
        Ok(object)
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        let mut state = self.state();
        state.stats.gets += 1;
        state
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Body, metadata: ObjectMetadata) -> Result<()> {
        let data = match body {
            Body::Bytes(bytes) => bytes,
            Body::File(path) => Bytes::from(tokio::fs::read(&path).await?),
        };
        self.state().stats.puts += 1;
        let integrity = IntegrityTag::Sha256(sha256_hex(&data));
        self.store_object(key, data, metadata, integrity);
        Ok(())
    }

    async fn update_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<()> {
        let mut state = self.state();
        state.stats.metadata_updates += 1;
        let object = state
            .objects
            .get_mut(key)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
        object.metadata = metadata;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut state = self.state();
        state.stats.lists += 1;
        let mut objects: Vec<RemoteObject> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| RemoteObject {
                metadata: ObjectMetadata::new(),
                ..State::describe(key, o)
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn create_multipart(&self, key: &str, metadata: ObjectMetadata) -> Result<String> {
        let mut state = self.state();
        state.stats.multipart_created += 1;
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let mut state = self.state();
        state.stats.parts_uploaded += 1;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| SyncError::NotFound(format!("upload {upload_id} for {key}")))?;
        let etag = sha256_hex(&data);
        upload.parts.insert(number, data);
        Ok(CompletedPart { number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let upload = {
            let mut state = self.state();
            state.stats.multipart_completed += 1;
            match state.uploads.remove(upload_id) {
                Some(upload) if upload.key == key => upload,
                Some(other) => {
                    state.uploads.insert(upload_id.to_string(), other);
                    return Err(SyncError::NotFound(format!("upload {upload_id} for {key}")));
                }
                None => return Err(SyncError::NotFound(format!("upload {upload_id} for {key}"))),
            }
        };

        let mut body = BytesMut::new();
        let mut part_digests = Vec::with_capacity(parts.len());
        for part in &parts {
            let data = upload.parts.get(&part.number).ok_or_else(|| {
                SyncError::NotFound(format!("part {} of upload {upload_id}", part.number))
            })?;
            body.extend_from_slice(data);
            part_digests.extend_from_slice(&sha256_bytes(data));
        }

        let integrity =
            IntegrityTag::Composite(format!("{}-{}", sha256_hex(&part_digests), parts.len()));
        self.store_object(key, body.freeze(), upload.metadata, integrity);
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state();
        state.stats.multipart_aborted += 1;
        match state.uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                state.uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(SyncError::NotFound(format!("upload {upload_id} for {key}"))),
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}
