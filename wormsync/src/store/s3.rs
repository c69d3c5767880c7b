//! S3-compatible object store over `aws-sdk-s3`.

use super::{
    Body, CompletedPart, IntegrityTag, ObjectMetadata, RemoteObject, RemoteStore,
    StoreConnector,
};
use crate::config::StoreConfig;
use crate::sync::digest::hex_from_base64;
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as SdkDateTime};
use aws_sdk_s3::types::{
    ChecksumAlgorithm, ChecksumMode, CompletedMultipartUpload, CompletedPart as S3Part,
    MetadataDirective,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Builds [`S3Store`] clients from one resolved SDK configuration.
pub struct S3Connector {
    config: aws_sdk_s3::Config,
    bucket: String,
}

impl S3Connector {
    pub async fn new(store: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &store.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &store.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let (Some(access_key), Some(secret_key)) = (&store.access_key, &store.secret_key) {
            let creds = Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "wormsync",
            );
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let sdk_config = loader.load().await;

        // path-style addressing for MinIO/Ceph/R2 endpoints
        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(store.endpoint.is_some())
            .build();

        Self {
            config,
            bucket: store.bucket.clone(),
        }
    }
}

#[async_trait]
impl StoreConnector for S3Connector {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>> {
        debug!("opening S3 client for bucket {}", self.bucket);
        Ok(Arc::new(S3Store {
            client: Client::from_conf(self.config.clone()),
            bucket: self.bucket.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

/// Map an SDK failure onto the engine's error kinds.
fn store_error<E>(op: &str, key: &str, err: SdkError<E, HttpResponse>) -> SyncError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let not_found = status == Some(404)
        || matches!(err.code(), Some("NoSuchKey" | "NotFound" | "NoSuchUpload"));
    if not_found {
        SyncError::NotFound(format!("{op} {key}"))
    } else {
        SyncError::TransientStore(format!("{op} {key}: {}", DisplayErrorContext(&err)))
    }
}

/// Integrity tag from the checksum and ETag headers.
fn integrity_tag(checksum_sha256: Option<&str>, etag: Option<&str>) -> Option<IntegrityTag> {
    if let Some(checksum) = checksum_sha256 {
        if checksum.contains('-') {
            return Some(IntegrityTag::Composite(checksum.to_string()));
        }
        if let Some(hex) = hex_from_base64(checksum) {
            return Some(IntegrityTag::Sha256(hex));
        }
    }
    etag.map(IntegrityTag::classify)
}

fn timestamp(value: Option<&SdkDateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

fn object_size(length: Option<i64>) -> u64 {
    length.and_then(|l| u64::try_from(l).ok()).unwrap_or(0)
}

/// `x-amz-copy-source` value: bucket and key, percent-encoded except for `/`.
fn copy_source(bucket: &str, key: &str) -> String {
    let mut out = String::with_capacity(bucket.len() + key.len() + 1);
    out.push_str(bucket);
    out.push('/');
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
        let output = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
        {
            Ok(output) => output,
            // HEAD responses carry no body, so a missing key only shows as a 404
            Err(err) => {
                return match store_error("HEAD", key, err) {
                    SyncError::NotFound(_) => Ok(None),
                    other => Err(other),
                };
            }
        };

        Ok(Some(RemoteObject {
            key: key.to_string(),
            size: object_size(output.content_length()),
            integrity: integrity_tag(output.checksum_sha256(), output.e_tag()),
            metadata: output.metadata().cloned().unwrap_or_default(),
            last_modified: timestamp(output.last_modified()),
        }))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<RemoteObject> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(|e| store_error("GET", key, e))?;

        let object = RemoteObject {
            key: key.to_string(),
            size: object_size(output.content_length()),
            integrity: integrity_tag(output.checksum_sha256(), output.e_tag()),
            metadata: output.metadata().cloned().unwrap_or_default(),
            last_modified: timestamp(output.last_modified()),
        };

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = output.body.into_async_read();
        tokio::io::copy(&mut body, &mut file).await.map_err(|e| {
            SyncError::TransientStore(format!("GET {key}: body interrupted: {e}"))
        })?;
        file.flush().await?;
        Ok(object)
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("GET", key, e))?;
        let body = output.body.collect().await.map_err(|e| {
            SyncError::TransientStore(format!("GET {key}: body interrupted: {e}"))
        })?;
        Ok(body.into_bytes())
    }

    async fn put(&self, key: &str, body: Body, metadata: ObjectMetadata) -> Result<()> {
        let stream = match body {
            Body::Bytes(bytes) => ByteStream::from(bytes),
            Body::File(path) => ByteStream::from_path(&path)
                .await
                .map_err(std::io::Error::other)?,
        };
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(stream)
            .set_metadata(Some(metadata))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|e| store_error("PUT", key, e))?;
        Ok(())
    }

    async fn update_metadata(&self, key: &str, metadata: ObjectMetadata) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(copy_source(&self.bucket, key))
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| store_error("COPY", key, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| store_error("LIST", prefix, e))?;
            for entry in page.contents() {
                let Some(key) = entry.key() else { continue };
                objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object_size(entry.size()),
                    integrity: entry.e_tag().map(IntegrityTag::classify),
                    metadata: HashMap::new(),
                    last_modified: timestamp(entry.last_modified()),
                });
            }
        }
        Ok(objects)
    }

    async fn create_multipart(&self, key: &str, metadata: ObjectMetadata) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| store_error("CREATE-MULTIPART", key, e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| SyncError::TransientStore(format!("no upload id returned for {key}")))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| store_error("UPLOAD-PART", key, e))?;
        Ok(CompletedPart {
            number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let parts = parts
            .into_iter()
            .map(|p| S3Part::builder().part_number(p.number).e_tag(p.etag).build())
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| store_error("COMPLETE-MULTIPART", key, e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| store_error("ABORT-MULTIPART", key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::digest::sha256_hex;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn test_integrity_prefers_sha256_checksum() {
        let checksum = STANDARD.encode(crate::sync::digest::sha256_bytes(b"hello"));
        assert_eq!(
            integrity_tag(Some(&checksum), Some("\"5d41402abc4b2a76b9719d911017c592\"")),
            Some(IntegrityTag::Sha256(sha256_hex(b"hello")))
        );
    }

    #[test]
    fn test_integrity_composite_checksum_and_etag() {
        assert!(matches!(
            integrity_tag(Some("abc=-40"), None),
            Some(IntegrityTag::Composite(_))
        ));
        assert!(matches!(
            integrity_tag(None, Some("\"d41d8cd98f00b204e9800998ecf8427e-3\"")),
            Some(IntegrityTag::Composite(_))
        ));
        assert!(matches!(
            integrity_tag(None, Some("\"d41d8cd98f00b204e9800998ecf8427e\"")),
            Some(IntegrityTag::Opaque(_))
        ));
        assert_eq!(integrity_tag(None, None), None);
    }

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(
            copy_source("archive", "node1:/data/run 7/a.dat"),
            "archive/node1%3A/data/run%207/a.dat"
        );
    }

    #[test]
    fn test_timestamp_conversion() {
        let t = SdkDateTime::from_secs(1_700_000_000);
        assert_eq!(timestamp(Some(&t)).map(|d| d.timestamp()), Some(1_700_000_000));
        assert_eq!(timestamp(None), None);
    }
}
