//! Transfer planning and accounting.

pub mod chunk;
pub mod progress;

pub use chunk::{system_memory_probe, ChunkPlan, ChunkPlanner, MemoryProbe};
pub use progress::RunStats;
