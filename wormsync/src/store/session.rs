//! Per-worker store session with retry and reconnect.
//!
//! A session owns one client. When a call fails transiently the session
//! sleeps, replaces the client with a fresh one from its connector and tries
//! again until the attempt budget is spent. Sessions are never shared between
//! workers.

use super::retry::RetryConfig;
use super::{
    Body, CompletedPart, ObjectMetadata, RemoteObject, RemoteStore, StoreConnector,
};
use crate::utils::{Result, SyncError};
use bytes::Bytes;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct StoreSession {
    connector: Arc<dyn StoreConnector>,
    store: Arc<dyn RemoteStore>,
    retry: RetryConfig,
}

impl StoreSession {
    /// Connect a new session, retrying the initial connection within the budget.
    pub async fn open(connector: Arc<dyn StoreConnector>, retry: RetryConfig) -> Result<Self> {
        let mut backoff = retry.backoff();
        let mut attempt = 1;
        let store = loop {
            match connector.connect().await {
                Ok(store) => break store,
                Err(e) if e.is_transient() && attempt < retry.attempts => {
                    warn!(
                        "connect: transient error (attempt {}/{}), retrying: {}",
                        attempt, retry.attempts, e
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        Ok(Self {
            connector,
            store,
            retry,
        })
    }

    /// Attempt budget applied to each call.
    pub fn attempts(&self) -> u32 {
        self.retry.attempts
    }

    /// Swap in a fresh client. A failed reconnect keeps the old client; the
    /// next call reports whatever is still wrong.
    pub async fn reconnect(&mut self) {
        match self.connector.connect().await {
            Ok(store) => {
                debug!("store client reconnected");
                self.store = store;
            }
            Err(e) => warn!("reconnect failed, keeping previous client: {}", e),
        }
    }

    /// Run `f` against the current client, retrying transient failures.
    pub async fn call<T, F, Fut>(&mut self, op: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.retry.backoff();
        let mut attempt = 1;

        loop {
            match f(Arc::clone(&self.store)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        "{}: transient error (attempt {}/{}), reconnecting: {}",
                        op, attempt, self.retry.attempts, e
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                    self.reconnect().await;
                    attempt += 1;
                }
                Err(SyncError::TransientStore(msg)) => {
                    return Err(SyncError::TransientStore(format!(
                        "{op} failed after {attempt} attempts: {msg}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn head(&mut self, key: &str) -> Result<Option<RemoteObject>> {
        self.call(&format!("HEAD {key}"), |store| async move {
            store.head(key).await
        })
        .await
    }

    pub async fn get_to_file(&mut self, key: &str, dest: &Path) -> Result<RemoteObject> {
        self.call(&format!("GET {key}"), |store| async move {
            store.get_to_file(key, dest).await
        })
        .await
    }

    pub async fn get_bytes(&mut self, key: &str) -> Result<Bytes> {
        self.call(&format!("GET {key}"), |store| async move {
            store.get_bytes(key).await
        })
        .await
    }

    pub async fn put(&mut self, key: &str, body: Body, metadata: ObjectMetadata) -> Result<()> {
        self.call(&format!("PUT {key}"), |store| {
            let body = body.clone();
            let metadata = metadata.clone();
            async move { store.put(key, body, metadata).await }
        })
        .await
    }

    /// Single put attempt. Transfers are retried as a whole by the caller.
    pub async fn put_once(&self, key: &str, body: Body, metadata: ObjectMetadata) -> Result<()> {
        self.store.put(key, body, metadata).await
    }

    pub async fn update_metadata(&mut self, key: &str, metadata: ObjectMetadata) -> Result<()> {
        self.call(&format!("UPDATE-METADATA {key}"), |store| {
            let metadata = metadata.clone();
            async move { store.update_metadata(key, metadata).await }
        })
        .await
    }

    pub async fn list(&mut self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.call(&format!("LIST {prefix}"), |store| async move {
            store.list(prefix).await
        })
        .await
    }

    pub async fn begin_multipart(
        &mut self,
        key: &str,
        metadata: ObjectMetadata,
    ) -> Result<MultipartSession> {
        let upload_id = self
            .call(&format!("CREATE-MULTIPART {key}"), |store| {
                let metadata = metadata.clone();
                async move { store.create_multipart(key, metadata).await }
            })
            .await?;

        Ok(MultipartSession {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
        })
    }

    /// Abort a multipart upload, retrying so no partial upload is left behind.
    pub async fn abort_multipart(&mut self, upload: MultipartSession) -> Result<()> {
        let MultipartSession { key, upload_id, .. } = upload;
        self.call(&format!("ABORT-MULTIPART {key}"), |store| {
            let key = key.clone();
            let upload_id = upload_id.clone();
            async move { store.abort_multipart(&key, &upload_id).await }
        })
        .await
    }
}

/// An open multipart upload. Parts must be added in order starting at 1.
pub struct MultipartSession {
    store: Arc<dyn RemoteStore>,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl MultipartSession {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn parts_uploaded(&self) -> usize {
        self.parts.len()
    }

    pub async fn put_part(&mut self, number: i32, data: Bytes) -> Result<()> {
        let expected = self.parts.len() as i32 + 1;
        if number != expected {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("part {number} out of order, expected {expected}"),
            )));
        }
        let part = self
            .store
            .upload_part(&self.key, &self.upload_id, number, data)
            .await?;
        self.parts.push(part);
        Ok(())
    }

    /// Assemble the uploaded parts into the final object. On failure the
    /// upload is still open and must be aborted.
    pub async fn complete(&self) -> Result<usize> {
        self.store
            .complete_multipart(&self.key, &self.upload_id, self.parts.clone())
            .await?;
        Ok(self.parts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out the shared memory store, failing the first `failures` heads.
    struct FlakyConnector {
        inner: MemoryStore,
        failures: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    struct FlakyStore {
        inner: MemoryStore,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StoreConnector for FlakyConnector {
        async fn connect(&self) -> Result<Arc<dyn RemoteStore>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakyStore {
                inner: self.inner.clone(),
                failures: Arc::clone(&self.failures),
            }))
        }
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SyncError::TransientStore("connection reset".into()));
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

    fn flaky(failures: usize) -> (Arc<FlakyConnector>, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(FlakyConnector {
            inner: MemoryStore::new(),
            failures: Arc::new(AtomicUsize::new(failures)),
            connects: Arc::clone(&connects),
        });
        (connector, connects)
    }

    #[tokio::test]
    async fn test_transient_failure_reconnects_and_retries() {
        let (connector, connects) = flaky(2);
        let mut session = StoreSession::open(connector, RetryConfig::no_delay(3))
            .await
            .unwrap();

        assert!(session.head("missing").await.unwrap().is_none());
        // initial connect plus one reconnect per failure
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_means_no_retry() {
        let (connector, connects) = flaky(1);
        let mut session = StoreSession::open(connector, RetryConfig::no_delay(1))
            .await
            .unwrap();

        let err = session.head("missing").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("after 1 attempts"));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let (connector, connects) = flaky(0);
        let mut session = StoreSession::open(connector, RetryConfig::no_delay(5))
            .await
            .unwrap();

        let err = session.get_bytes("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multipart_parts_must_be_contiguous() {
        let (connector, _) = flaky(0);
        let mut session = StoreSession::open(connector, RetryConfig::no_delay(1))
            .await
            .unwrap();

        let mut upload = session
            .begin_multipart("k", ObjectMetadata::new())
            .await
            .unwrap();
        upload.put_part(1, Bytes::from_static(b"ab")).await.unwrap();
        assert!(upload.put_part(3, Bytes::from_static(b"cd")).await.is_err());
        upload.put_part(2, Bytes::from_static(b"cd")).await.unwrap();
        assert_eq!(upload.complete().await.unwrap(), 2);

        assert_eq!(session.get_bytes("k").await.unwrap(), Bytes::from_static(b"abcd"));
    }
}
