//! Bounded worker pool for blocking file I/O

use crate::error::{DiskCacheError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default number of concurrent blocking I/O jobs per cache
pub const DEFAULT_IO_WORKERS: usize = 4;

/// Runs blocking closures on tokio's blocking threads, never more than
/// `workers` at a time. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct IoPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl IoPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run a blocking closure once a worker is free
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DiskCacheError::Closed)?;

        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await?;

        Ok(output)
    }

    /// Run a blocking I/O closure, folding its error into the cache error type
    pub async fn io<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.run(f).await??)
    }

    /// Reject all future work. Jobs already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

impl Default for IoPool {
    fn default() -> Self {
        Self::new(DEFAULT_IO_WORKERS)
    }
}
