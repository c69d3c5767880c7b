//! Local filesystem: traversal, change detection and ownership metadata.

pub mod metadata;
pub mod walker;
pub mod watcher;
