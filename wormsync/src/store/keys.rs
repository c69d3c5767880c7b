//! Object key layout.
//!
//! Data objects are stored as `[<prefix>]<host>:<absolute path>`. The batch of
//! a file is its containing directory. Uploading `/a/b/c.dat` with indexing on
//! also stores a manifest of `/a/b` at `[<prefix>]<host>:/a/b/c.dat-listdir.json`,
//! so every manifest of a batch sits directly under `[<prefix>]<host>:/a/b/`
//! and is named after the fileset `c.dat` it was written for.

use std::path::Path;

pub const MANIFEST_SUFFIX: &str = "-listdir.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    host: String,
}

impl KeyLayout {
    pub fn new(prefix: Option<&str>, host: impl Into<String>) -> Self {
        Self {
            prefix: prefix.unwrap_or_default().to_string(),
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `[<prefix>]<host>:` followed by the origin path with no trailing slash.
    pub fn origin_prefix(&self, origin: &str) -> String {
        let origin = origin.trim_end_matches('/');
        format!("{}{}:{}", self.prefix, self.host, origin)
    }

    /// Key of a local file.
    pub fn object_key(&self, path: &Path) -> String {
        self.origin_prefix(&path.to_string_lossy())
    }

    /// Key of a file listed in the manifest of `origin`.
    pub fn file_key(&self, origin: &str, name: &str) -> String {
        format!("{}/{}", self.origin_prefix(origin), name)
    }

    /// Key of the manifest written when uploading the local file `path`.
    pub fn manifest_key(&self, path: &Path) -> String {
        format!("{}{}", self.object_key(path), MANIFEST_SUFFIX)
    }

    /// Manifest key of fileset `name` of the batch directory `origin`.
    pub fn fileset_manifest_key(&self, origin: &str, name: &str) -> String {
        format!("{}{}", self.file_key(origin, name), MANIFEST_SUFFIX)
    }

    /// Prefix under which every fileset manifest of `origin` lives.
    pub fn fileset_search_prefix(&self, origin: &str) -> String {
        format!("{}/", self.origin_prefix(origin))
    }
}

/// Fileset name encoded in a manifest key, if the key is one.
pub fn fileset_name(manifest_key: &str) -> Option<&str> {
    let stem = manifest_key.strip_suffix(MANIFEST_SUFFIX)?;
    let name = stem.rsplit('/').next()?;
    (!name.is_empty()).then_some(name)
}

/// Whether a name marks a file that is still being written.
pub fn is_temporary(name: &str) -> bool {
    name.contains("-tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        let layout = KeyLayout::new(None, "node1");
        assert_eq!(
            layout.object_key(Path::new("/data/run7/a.dat")),
            "node1:/data/run7/a.dat"
        );

        let prefixed = KeyLayout::new(Some("lab-"), "node1");
        assert_eq!(
            prefixed.object_key(Path::new("/data/run7/a.dat")),
            "lab-node1:/data/run7/a.dat"
        );
    }

    #[test]
    fn test_manifest_keys_line_up() {
        let layout = KeyLayout::new(None, "node1");
        assert_eq!(
            layout.manifest_key(Path::new("/data/run7/a.dat")),
            "node1:/data/run7/a.dat-listdir.json"
        );
        assert_eq!(
            layout.fileset_manifest_key("/data/run7/", "a.dat"),
            layout.manifest_key(Path::new("/data/run7/a.dat"))
        );
        assert!(layout
            .manifest_key(Path::new("/data/run7/a.dat"))
            .starts_with(&layout.fileset_search_prefix("/data/run7")));
        assert_eq!(layout.fileset_search_prefix("/data/run7"), "node1:/data/run7/");
        assert_eq!(
            layout.file_key("/data/run7", "a.dat"),
            layout.object_key(Path::new("/data/run7/a.dat"))
        );
    }

    #[test]
    fn test_fileset_name() {
        assert_eq!(
            fileset_name("node1:/data/run7/a.dat-listdir.json"),
            Some("a.dat")
        );
        assert_eq!(fileset_name("node1:/data/run7/a.dat"), None);
    }

    #[test]
    fn test_is_temporary() {
        assert!(is_temporary("a.dat-tmp"));
        assert!(is_temporary("frame-tmp-0001.raw"));
        assert!(!is_temporary("a.dat"));
    }
}
