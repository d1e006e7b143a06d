//! Core types for the cache server

use durable_disk_cache::{
    CacheStats, EvictionStrategy, DEFAULT_COMPACTION_THRESHOLD, DEFAULT_IO_WORKERS,
};
use serde::Serialize;
use std::path::PathBuf;

/// Configuration for the cache server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub max_cache_size: i64,
    pub cache_version: Option<u32>,
    pub eviction_strategy: EvictionStrategy,
    pub compaction_threshold: u64,
    pub io_workers: usize,
    /// Store entries under the SHA-256 of their key
    pub hash_keys: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            cache_dir: PathBuf::from("./cache/entries"),
            max_cache_size: 1024 * 1024 * 1024, // 1GB
            cache_version: None,
            eviction_strategy: EvictionStrategy::Lru,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            io_workers: DEFAULT_IO_WORKERS,
            hash_keys: true,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}
