//! File ownership and permission metadata.
//!
//! Captured on upload and stored as JSON in the object's `stat` metadata
//! field, then consumed on restore to decide which owner, group and mode the
//! restored files get.

use crate::store::{ObjectMetadata, METADATA_STAT};
use crate::utils::{Result, SyncError};
use nix::unistd::{chown, Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, warn};

/// Ownership and mode of a backed-up file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub uid: u32,
    pub gid: u32,

    /// Unix mode bits, file type included
    pub mode: u32,

    /// Owner name on the source host, when it resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl FileMetadata {
    /// Stat a local file and resolve its owner names
    pub fn capture(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_fs(&metadata))
    }

    pub fn from_fs(metadata: &fs::Metadata) -> Self {
        let uid = metadata.uid();
        let gid = metadata.gid();
        Self {
            uid,
            gid,
            mode: metadata.mode(),
            user: User::from_uid(Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|u| u.name),
            group: Group::from_gid(Gid::from_raw(gid))
                .ok()
                .flatten()
                .map(|g| g.name),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the `stat` field of an object. Missing or malformed metadata
    /// yields `None`.
    pub fn from_object(metadata: &ObjectMetadata) -> Option<Self> {
        let raw = metadata.get(METADATA_STAT)?;
        match serde_json::from_str(raw) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("ignoring malformed stat metadata {:?}: {}", raw, e);
                None
            }
        }
    }

    /// Permission bits only
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Owner and group to apply to restored files. `None` leaves that id alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Ownership {
    pub fn is_unchanged(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }

    /// Ownership recorded on the source host. Names are looked up locally
    /// first so the restore follows the target host's id mapping; the stored
    /// numeric ids are used when a name is absent or unknown here.
    pub fn from_metadata(metadata: &FileMetadata) -> Self {
        let uid = metadata
            .user
            .as_deref()
            .and_then(|name| User::from_name(name).ok().flatten())
            .map(|u| u.uid.as_raw())
            .unwrap_or(metadata.uid);
        let gid = metadata
            .group
            .as_deref()
            .and_then(|name| Group::from_name(name).ok().flatten())
            .map(|g| g.gid.as_raw())
            .unwrap_or(metadata.gid);
        Self {
            uid: Some(uid),
            gid: Some(gid),
        }
    }

    /// Resolve operator-supplied names
    pub fn from_names(owner: Option<&str>, group: Option<&str>) -> Result<Self> {
        let uid = match owner {
            Some(name) => Some(
                User::from_name(name)
                    .map_err(|e| SyncError::Config(format!("looking up user {name}: {e}")))?
                    .ok_or_else(|| SyncError::Config(format!("unknown user {name}")))?
                    .uid
                    .as_raw(),
            ),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(|e| SyncError::Config(format!("looking up group {name}: {e}")))?
                    .ok_or_else(|| SyncError::Config(format!("unknown group {name}")))?
                    .gid
                    .as_raw(),
            ),
            None => None,
        };
        Ok(Self { uid, gid })
    }

    pub fn apply(&self, path: &Path) -> io::Result<()> {
        if self.is_unchanged() {
            return Ok(());
        }
        chown(
            path,
            self.uid.map(Uid::from_raw),
            self.gid.map(Gid::from_raw),
        )
        .map_err(io::Error::from)
    }
}

pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

/// Check that files can be created in `dir` and given `ownership`.
pub fn probe_target(dir: &Path, ownership: &Ownership) -> Result<()> {
    let probe = dir.join(format!(".wormsync-probe-{}", std::process::id()));

    fs::File::create(&probe).map_err(|e| {
        SyncError::Permission(format!("cannot create files in {}: {}", dir.display(), e))
    })?;
    let applied = ownership.apply(&probe);
    if let Err(e) = fs::remove_file(&probe) {
        debug!("could not remove probe file {}: {}", probe.display(), e);
    }
    applied.map_err(|e| {
        SyncError::Permission(format!(
            "cannot set owner {:?} group {:?} in {}: {}",
            ownership.uid,
            ownership.gid,
            dir.display(),
            e
        ))
    })
}
