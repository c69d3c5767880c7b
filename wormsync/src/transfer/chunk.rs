//! Multipart chunk planning.
//!
//! Files above the multipart threshold are cut into fixed-size parts. The part
//! size is taken from configuration but shrinks when the machine is short on
//! memory, since every in-flight part is held in a buffer.

use crate::config::TransferConfig;
use crate::transfer::progress::format_bytes;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Smallest part size S3 accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3 rejects uploads with more parts than this.
pub const MAX_PARTS: u64 = 10_000;

/// Reports currently available memory in bytes, `None` when unknown.
pub type MemoryProbe = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Probe reporting the kernel's `MemAvailable` estimate, which counts
/// reclaimable page cache. Falls back to free RAM from `sysinfo(2)` on
/// kernels without it.
pub fn system_memory_probe() -> MemoryProbe {
    Arc::new(available_memory)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn available_memory() -> Option<u64> {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(meminfo) => {
            if let Some(available) = parse_mem_available(&meminfo) {
                return Some(available);
            }
            debug!("no MemAvailable in /proc/meminfo, using free RAM");
        }
        Err(e) => debug!("cannot read /proc/meminfo: {}", e),
    }
    nix::sys::sysinfo::sysinfo().ok().map(|info| info.ram_unused())
}

/// Bytes from the `MemAvailable:` line of `/proc/meminfo` (reported in kB).
#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code)
)]
fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let mut fields = line.strip_prefix("MemAvailable:")?.split_whitespace();
        let value: u64 = fields.next()?.parse().ok()?;
        match fields.next() {
            Some("kB") | None => value.checked_mul(1024),
            Some(_) => None,
        }
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn available_memory() -> Option<u64> {
    None
}

#[derive(Clone)]
pub struct ChunkPlanner {
    threshold: u64,
    chunk_size: u64,
    probe: MemoryProbe,
}

impl ChunkPlanner {
    pub fn new(config: &TransferConfig, probe: MemoryProbe) -> Self {
        Self {
            threshold: config.multipart_threshold,
            chunk_size: config.chunk_size.max(1),
            probe,
        }
    }

    pub fn is_multipart(&self, file_size: u64) -> bool {
        file_size > self.threshold
    }

    /// Work out the part size for a file of `file_size` bytes.
    pub fn plan(&self, file_size: u64) -> ChunkPlan {
        let mut chunk_size = self.chunk_size;

        if let Some(available) = (self.probe)() {
            if available < chunk_size {
                let reduced = (available / 20).max(MIN_PART_SIZE);
                warn!(
                    "only {} of memory available, reducing part size from {} to {}",
                    format_bytes(available),
                    format_bytes(chunk_size),
                    format_bytes(reduced)
                );
                chunk_size = reduced;
            }
        }

        if file_size.div_ceil(chunk_size) > MAX_PARTS {
            let raised = file_size.div_ceil(MAX_PARTS);
            warn!(
                "{} needs more than {} parts of {}, raising part size to {}",
                format_bytes(file_size),
                MAX_PARTS,
                format_bytes(chunk_size),
                format_bytes(raised)
            );
            chunk_size = raised;
        }

        ChunkPlan {
            file_size,
            chunk_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
}

impl ChunkPlan {
    pub fn part_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Stream the parts of `file` in order. Consumes the file handle.
    pub fn reader(&self, file: tokio::fs::File) -> PartReader {
        PartReader {
            file,
            chunk_size: self.chunk_size,
            remaining: self.file_size,
            next_number: 1,
        }
    }
}

/// Reads a file as a sequence of numbered parts. Cannot be restarted; a
/// retried transfer opens the file again.
pub struct PartReader {
    file: tokio::fs::File,
    chunk_size: u64,
    /// Planned bytes not yet read
    remaining: u64,
    next_number: i32,
}

impl PartReader {
    /// Next part, `None` once the planned size is read or the file ends early.
    /// Never yields an empty part.
    pub async fn next_part(&mut self) -> io::Result<Option<(i32, Bytes)>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let want = self.chunk_size.min(self.remaining) as usize;
        let mut buf = BytesMut::zeroed(want);
        let mut filled = 0;
        while filled < want {
            let read = self.file.read(&mut buf[filled..]).await?;
            if read == 0 {
                self.remaining = 0;
                break;
            }
            filled += read;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        self.remaining = self.remaining.saturating_sub(filled as u64);

        let number = self.next_number;
        self.next_number += 1;
        Ok(Some((number, buf.freeze())))
    }
}
