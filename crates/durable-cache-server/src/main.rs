//! Durable cache server - HTTP front end for a journaled disk cache
//!
//! Stores request bodies on disk under a size limit and keeps them across
//! restarts and crashes.

mod error;
mod server;
mod types;

use crate::error::{Result, ServerError};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ServerConfig;
use durable_disk_cache::{
    CachedKeyTransform, DiskCache, DiskCacheOptions, EvictionStrategy, IoPool, KeyTransform,
    Sha256KeyTransform,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("durable_cache_server=info".parse()?)
        .add_directive("durable_disk_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting durable cache server...");

    let config = load_config()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.max_cache_size / (1024 * 1024)
    );
    info!("Eviction strategy: {}", config.eviction_strategy);

    let key_transform: Option<Arc<dyn KeyTransform>> = if config.hash_keys {
        Some(Arc::new(CachedKeyTransform::new(Sha256KeyTransform)))
    } else {
        None
    };
    let options = DiskCacheOptions {
        cache_version: config.cache_version,
        key_transform,
        eviction_strategy: config.eviction_strategy,
        io_pool: Some(IoPool::new(config.io_workers)),
        compaction_threshold: config.compaction_threshold,
        file_system: None,
    };
    let cache = DiskCache::open(&config.cache_dir, config.max_cache_size, options).await?;

    let state: SharedState = Arc::new(ServerState::new(cache.clone()));

    start_server(state, config.port, shutdown_signal()).await?;

    info!("Closing cache...");
    cache.close().await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}

fn load_config() -> Result<ServerConfig> {
    let defaults = ServerConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let cache_dir = std::env::var("CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_dir);

    let max_cache_size = std::env::var("MAX_CACHE_SIZE")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|size| *size >= 0)
        .unwrap_or(defaults.max_cache_size);

    let cache_version = std::env::var("CACHE_VERSION")
        .ok()
        .and_then(|s| s.parse::<u32>().ok());

    let eviction_strategy = match std::env::var("EVICTION_STRATEGY") {
        Ok(s) => EvictionStrategy::from_str(&s).map_err(ServerError::from)?,
        Err(_) => defaults.eviction_strategy,
    };

    let compaction_threshold = std::env::var("COMPACTION_THRESHOLD")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.compaction_threshold);

    let io_workers = std::env::var("IO_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|workers| *workers > 0)
        .unwrap_or(defaults.io_workers);

    let hash_keys = std::env::var("HASH_KEYS")
        .ok()
        .and_then(|s| s.parse::<bool>().ok())
        .unwrap_or(defaults.hash_keys);

    Ok(ServerConfig {
        port,
        cache_dir,
        max_cache_size,
        cache_version,
        eviction_strategy,
        compaction_threshold,
        io_workers,
        hash_keys,
    })
}
