//! Content identity: digests and the dedup check built on them.

pub mod dedup;
pub mod digest;

pub use dedup::{ContentDedupChecker, DedupOutcome, DedupVerdict};
