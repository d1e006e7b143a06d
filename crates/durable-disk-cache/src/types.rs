//! Cache types

use crate::error::DiskCacheError;
use crate::fs::FileSystem;
use crate::key::KeyTransform;
use crate::pool::IoPool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Default number of redundant journal records tolerated before compaction
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 2000;

/// Order in which entries are chosen for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently used first
    #[default]
    Lru,
    /// Oldest insertion first
    Fifo,
    /// Most recently used first
    Mru,
    /// Newest insertion first
    Filo,
}

impl EvictionStrategy {
    /// Whether reads reorder entries
    pub fn is_access_ordered(self) -> bool {
        matches!(self, EvictionStrategy::Lru | EvictionStrategy::Mru)
    }

    /// Whether the victim is taken from the newest end of the order
    pub fn evicts_newest(self) -> bool {
        matches!(self, EvictionStrategy::Mru | EvictionStrategy::Filo)
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Fifo => "fifo",
            EvictionStrategy::Mru => "mru",
            EvictionStrategy::Filo => "filo",
        };
        f.write_str(name)
    }
}

impl FromStr for EvictionStrategy {
    type Err = DiskCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "fifo" => Ok(EvictionStrategy::Fifo),
            "mru" => Ok(EvictionStrategy::Mru),
            "filo" => Ok(EvictionStrategy::Filo),
            other => Err(DiskCacheError::Config(format!(
                "unknown eviction strategy: {}",
                other
            ))),
        }
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: i64,
    pub max_size: i64,
    pub hits: u64,
    pub misses: u64,
    pub in_flight: usize,
    pub redundant_records: u64,
}

/// Options accepted by [`crate::DiskCache::open`]
#[derive(Clone)]
pub struct DiskCacheOptions {
    /// Written into the journal header; a mismatch wipes the cache on open
    pub cache_version: Option<u32>,
    /// Applied to every key before it touches the index, journal or disk
    pub key_transform: Option<Arc<dyn KeyTransform>>,
    pub eviction_strategy: EvictionStrategy,
    /// Injected blocking-I/O pool; when absent the cache owns one
    pub io_pool: Option<IoPool>,
    /// Redundant journal records tolerated before the journal is compacted
    pub compaction_threshold: u64,
    /// Filesystem capability; defaults to the local filesystem
    pub file_system: Option<Arc<dyn FileSystem>>,
}

impl Default for DiskCacheOptions {
    fn default() -> Self {
        Self {
            cache_version: None,
            key_transform: None,
            eviction_strategy: EvictionStrategy::Lru,
            io_pool: None,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            file_system: None,
        }
    }
}

impl fmt::Debug for DiskCacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCacheOptions")
            .field("cache_version", &self.cache_version)
            .field("key_transform", &self.key_transform.is_some())
            .field("eviction_strategy", &self.eviction_strategy)
            .field("io_pool", &self.io_pool)
            .field("compaction_threshold", &self.compaction_threshold)
            .field("file_system", &self.file_system.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_default_options() {
        let options = DiskCacheOptions::default();
        assert_eq!(options.cache_version, None);
        assert_eq!(options.eviction_strategy, EvictionStrategy::Lru);
        assert_eq!(options.compaction_threshold, DEFAULT_COMPACTION_THRESHOLD);
        assert!(options.key_transform.is_none());
        assert!(options.io_pool.is_none());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("LRU".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lru);
        assert_eq!("fifo".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Fifo);
        assert_eq!("Mru".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Mru);
        assert_eq!("filo".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Filo);
        assert!("random".parse::<EvictionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_properties() {
        assert!(EvictionStrategy::Lru.is_access_ordered());
        assert!(EvictionStrategy::Mru.is_access_ordered());
        assert!(!EvictionStrategy::Fifo.is_access_ordered());
        assert!(EvictionStrategy::Filo.evicts_newest());
        assert!(!EvictionStrategy::Lru.evicts_newest());
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            entries: 3,
            total_size: 12345,
            max_size: 65536,
            hits: 7,
            misses: 2,
            in_flight: 1,
            redundant_records: 4,
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("12345"));

        let deserialized: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.entries, 3);
        assert_eq!(deserialized.max_size, 65536);
    }

    #[test]
    fn test_strategy_serializes_lowercase() {
        let json = serde_json::to_string(&EvictionStrategy::Filo).unwrap();
        assert_eq!(json, "\"filo\"");
    }
}
