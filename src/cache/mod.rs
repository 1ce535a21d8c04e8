//! Versioned partition cache for offline support.
//!
//! This module provides:
//! - Named partitions (static, runtime, API) whose names embed a version tag
//! - SQLite-backed storage that survives restarts
//! - Network-first and cache-first retrieval strategies with offline fallback

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{PartitionStore, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Partitions, RequestKey};
