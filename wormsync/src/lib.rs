//! wormsync
//!
//! Backup of write-once data files to an S3-compatible object store, with
//! content-based dedup, chunked multipart transfers and fileset restore.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod store;
pub mod sync;
pub mod transfer;
pub mod utils;

pub use config::Config;
pub use utils::errors::{Result, SyncError};
