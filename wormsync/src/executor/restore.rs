//! Fileset resolution for restore.
//!
//! A fileset is the content of one manifest of a batch directory. It is
//! looked up by name, or the most recently written manifest of the directory
//! is taken.

use crate::executor::manifest::Manifest;
use crate::fs::metadata::FileMetadata;
use crate::store::keys::{fileset_name, KeyLayout, MANIFEST_SUFFIX};
use crate::store::session::StoreSession;
use crate::store::RemoteObject;
use crate::utils::{Result, SyncError};
use tracing::{info, warn};

/// The files of one resolved manifest.
#[derive(Debug, Clone)]
pub struct Fileset {
    pub name: String,
    pub manifest_key: String,
    /// Batch directory the files were uploaded from
    pub origin: String,
    pub files: Vec<String>,
}

pub struct RestoreResolver {
    layout: KeyLayout,
}

impl RestoreResolver {
    pub fn new(layout: KeyLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Load the fileset `name` of the batch directory `origin`, or the latest
    /// one when no name is given.
    pub async fn resolve(
        &self,
        session: &mut StoreSession,
        origin: &str,
        name: Option<&str>,
    ) -> Result<Fileset> {
        let manifest_key = match name {
            Some(name) => self.layout.fileset_manifest_key(origin, name),
            None => self.latest_manifest_key(session, origin).await?,
        };

        let data = match session.get_bytes(&manifest_key).await {
            Ok(data) => data,
            Err(SyncError::NotFound(_)) => {
                return Err(SyncError::NotFound(format!("manifest {manifest_key}")));
            }
            Err(e) => return Err(e),
        };
        let manifest = Manifest::from_slice(&data)?;

        let name = fileset_name(&manifest_key)
            .unwrap_or(&manifest.fileset)
            .to_string();
        info!(
            "resolved fileset {} ({} files) from {}",
            name,
            manifest.files.len(),
            manifest_key
        );

        Ok(Fileset {
            name,
            manifest_key,
            origin: manifest.origin,
            files: manifest.files,
        })
    }

    async fn latest_manifest_key(&self, session: &mut StoreSession, origin: &str) -> Result<String> {
        let prefix = self.layout.fileset_search_prefix(origin);
        let objects = session.list(&prefix).await?;
        select_latest(&prefix, &objects)
            .map(|object| object.key.clone())
            .ok_or_else(|| SyncError::NotFound(format!("no manifest under {prefix}")))
    }

    /// Stored metadata of the first file, the owner applied to the whole
    /// fileset. Missing or malformed metadata yields `None`.
    pub async fn fileset_owner(
        &self,
        session: &mut StoreSession,
        fileset: &Fileset,
    ) -> Option<FileMetadata> {
        let first = fileset.files.first()?;
        let key = self.layout.file_key(&fileset.origin, first);
        match session.head(&key).await {
            Ok(Some(object)) => FileMetadata::from_object(&object.metadata),
            Ok(None) => {
                warn!("first file {} of fileset is missing", key);
                None
            }
            Err(e) => {
                warn!("cannot read metadata of {}: {}", key, e);
                None
            }
        }
    }
}

/// Newest manifest directly under `prefix`, by store modification time.
pub fn select_latest<'a>(prefix: &str, objects: &'a [RemoteObject]) -> Option<&'a RemoteObject> {
    objects
        .iter()
        .filter(|object| {
            object
                .key
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(MANIFEST_SUFFIX))
                .is_some_and(|stem| !stem.is_empty() && !stem.contains('/'))
        })
        .max_by_key(|object| object.last_modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::retry::RetryConfig;
    use crate::store::{Body, ObjectMetadata, RemoteStore, METADATA_STAT};
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::Arc;

    fn object(key: &str, secs: i64) -> RemoteObject {
        RemoteObject {
            key: key.into(),
            size: 1,
            integrity: None,
            metadata: ObjectMetadata::new(),
            last_modified: Utc.timestamp_opt(secs, 0).single(),
        }
    }

    #[test]
    fn test_select_latest_ignores_data_and_nested_manifests() {
        let objects = vec![
            object("h:/data/run1/a.dat-listdir.json", 100),
            object("h:/data/run1/b.dat-listdir.json", 300),
            object("h:/data/run1/b.dat", 900),
            object("h:/data/run1/sub/c.dat-listdir.json", 800),
            object("h:/data/run1-listdir.json", 700),
        ];
        let latest = select_latest("h:/data/run1/", &objects).unwrap();
        assert_eq!(latest.key, "h:/data/run1/b.dat-listdir.json");
        assert!(select_latest("h:/other/", &objects).is_none());
    }

    async fn store_manifest(
        store: &MemoryStore,
        layout: &KeyLayout,
        dir: &str,
        fileset: &str,
        files: &[&str],
    ) {
        let manifest = Manifest::new(
            layout.host(),
            Path::new(dir),
            fileset,
            files.iter().map(|f| f.to_string()).collect(),
        );
        store
            .put(
                &layout.fileset_manifest_key(dir, fileset),
                Body::Bytes(manifest.to_bytes().unwrap()),
                ObjectMetadata::new(),
            )
            .await
            .unwrap();
    }

    async fn session(store: &MemoryStore) -> StoreSession {
        StoreSession::open(Arc::new(store.clone()), RetryConfig::no_delay(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_named_and_latest() {
        let store = MemoryStore::new();
        let layout = KeyLayout::new(None, "node1");
        store_manifest(&store, &layout, "/data/run1", "a", &["a"]).await;
        store_manifest(&store, &layout, "/data/run1", "c", &["a", "b", "c"]).await;
        store_manifest(&store, &layout, "/data/run2", "z", &["z"]).await;
        let c_key = layout.fileset_manifest_key("/data/run1", "c");
        assert!(store.set_last_modified(&c_key, Utc::now() + chrono::Duration::hours(1)));
        let mut session = session(&store).await;
        let resolver = RestoreResolver::new(layout);

        let named = resolver
            .resolve(&mut session, "/data/run1", Some("a"))
            .await
            .unwrap();
        assert_eq!(named.name, "a");
        assert_eq!(named.files, vec!["a"]);

        let latest = resolver
            .resolve(&mut session, "/data/run1/", None)
            .await
            .unwrap();
        assert_eq!(latest.name, "c");
        assert_eq!(latest.manifest_key, c_key);
        assert_eq!(latest.origin, "/data/run1");
        assert_eq!(latest.files, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_resolve_without_manifest_names_prefix() {
        let store = MemoryStore::new();
        let mut session = session(&store).await;
        let resolver = RestoreResolver::new(KeyLayout::new(Some("lab-"), "node1"));

        let err = resolver.resolve(&mut session, "/data", None).await.unwrap_err();
        match err {
            SyncError::NotFound(msg) => assert!(msg.contains("lab-node1:/data/")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            resolver.resolve(&mut session, "/data", Some("a.dat")).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fileset_owner_from_first_file() {
        let store = MemoryStore::new();
        let layout = KeyLayout::new(None, "node1");
        store_manifest(&store, &layout, "/data/run1", "b", &["a", "b"]).await;

        let stat = FileMetadata {
            uid: 1234,
            gid: 99,
            mode: 0o100640,
            user: None,
            group: None,
        };
        let mut metadata = ObjectMetadata::new();
        metadata.insert(METADATA_STAT.into(), stat.to_json().unwrap());
        store
            .put(
                &layout.file_key("/data/run1", "a"),
                Body::Bytes(Bytes::from_static(b"x")),
                metadata,
            )
            .await
            .unwrap();

        let mut session = session(&store).await;
        let resolver = RestoreResolver::new(layout);
        let fileset = resolver
            .resolve(&mut session, "/data/run1", Some("b"))
            .await
            .unwrap();
        assert_eq!(resolver.fileset_owner(&mut session, &fileset).await, Some(stat));
    }
}
