//! Directory traversal for the watcher and for batch manifests.

use crate::store::keys::is_temporary;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// A regular file found during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
}

impl FileInfo {
    /// Regular files only; symlinks are followed to a regular target.
    fn from_entry(entry: &DirEntry) -> Option<Self> {
        let metadata = if entry.path_is_symlink() {
            std::fs::metadata(entry.path()).ok()?
        } else {
            entry.metadata().ok()?
        };
        metadata.is_file().then(|| Self {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
        })
    }
}

fn is_temporary_entry(entry: &DirEntry) -> bool {
    is_temporary(&entry.file_name().to_string_lossy())
}

/// Every finished regular file below `root`. Unreadable subdirectories are
/// logged and skipped; a missing root is an error.
pub fn scan_files(root: &Path) -> io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("watch path {} does not exist", root.display()),
        ));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.file_type().is_dir() || is_temporary_entry(&entry) {
            continue;
        }
        if let Some(info) = FileInfo::from_entry(&entry) {
            files.push(info);
        }
    }

    Ok(files)
}

/// Names of the finished regular files directly inside `dir`, sorted.
pub fn list_batch_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() || is_temporary_entry(&entry) {
            continue;
        }
        if FileInfo::from_entry(&entry).is_some() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort();
    Ok(names)
}
