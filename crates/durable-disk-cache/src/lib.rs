//! Journaled disk cache with crash recovery
//!
//! Stores one file per key under a directory, bounded by total size. An
//! append-only journal records every state change so the cache can be
//! rebuilt after a crash, and concurrent requests for the same missing key
//! share a single creation.

mod cache;
mod coordinator;
mod error;
mod fs;
mod index;
pub mod journal;
mod key;
mod pool;
mod recovery;
mod types;

pub use cache::DiskCache;
pub use coordinator::{CancelSignal, CreationOutcome, CreationTask};
pub use error::{DiskCacheError, Result};
pub use fs::{FileSink, FileSystem, LocalFileSystem};
pub use index::{EntryIndex, IndexEntry};
pub use key::{
    validate_key, CachedKeyTransform, KeyTransform, Sha256KeyTransform,
    DEFAULT_TRANSFORM_CACHE_SIZE,
};
pub use pool::{IoPool, DEFAULT_IO_WORKERS};
pub use recovery::RecoveryReport;
pub use types::{CacheStats, DiskCacheOptions, EvictionStrategy, DEFAULT_COMPACTION_THRESHOLD};
