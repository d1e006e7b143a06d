//! Journaled disk cache

use crate::coordinator::{launch, CancelSignal, CreationOutcome, CreationTask, TaskTable};
use crate::error::{DiskCacheError, Result};
use crate::fs::{FileSystem, LocalFileSystem};
use crate::index::EntryIndex;
use crate::journal::{compact_bytes, replace_journal, JournalPaths, JournalRecord, JournalWriter};
use crate::key::{content_path, staging_path, validate_key, KeyTransform};
use crate::pool::IoPool;
use crate::recovery::{recover, RecoveryConfig, RecoveryReport};
use crate::types::{CacheStats, DiskCacheOptions, EvictionStrategy};
use futures::future::FutureExt;
use std::fmt;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type SharedJournal = Arc<std::sync::Mutex<JournalWriter>>;

/// A capacity-bounded disk cache whose metadata survives crashes.
///
/// Cloning is cheap; clones share the same instance.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    max_size: i64,
    cache_version: Option<u32>,
    strategy: EvictionStrategy,
    compaction_threshold: u64,
    key_transform: Option<Arc<dyn KeyTransform>>,
    fs: Arc<dyn FileSystem>,
    pool: IoPool,
    owns_pool: bool,
    paths: JournalPaths,
    recovery: RecoveryReport,
    /// Index, journal and task table; every mutation happens under this lock
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheState {
    index: EntryIndex,
    /// `None` once the cache is closed
    journal: Option<SharedJournal>,
    tasks: TaskTable,
    /// Records in the journal file, including those written by recovery
    journal_records: u64,
}

impl CacheState {
    fn ensure_open(&self) -> Result<()> {
        if self.journal.is_some() {
            Ok(())
        } else {
            Err(DiskCacheError::Closed)
        }
    }

    fn redundant_count(&self) -> u64 {
        self.journal_records
            .saturating_sub(self.index.len() as u64)
    }
}

impl DiskCache {
    /// Open (or create) the cache in `dir`, recovering any previous state
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_size: i64,
        options: DiskCacheOptions,
    ) -> Result<Self> {
        let dir = dir.into();
        if max_size < 0 {
            return Err(DiskCacheError::Config(format!(
                "max size must not be negative, got {}",
                max_size
            )));
        }

        let owns_pool = options.io_pool.is_none();
        let pool = options.io_pool.unwrap_or_default();
        let fs: Arc<dyn FileSystem> = options
            .file_system
            .unwrap_or_else(|| Arc::new(LocalFileSystem));

        let config = RecoveryConfig {
            max_size,
            cache_version: options.cache_version,
            eviction_strategy: options.eviction_strategy,
            compaction_threshold: options.compaction_threshold,
        };
        let recovered = {
            let fs = fs.clone();
            let dir = dir.clone();
            pool.run(move || recover(fs.as_ref(), &dir, &config)).await??
        };

        let journal_records = recovered.redundant_count + recovered.index.len() as u64;
        let recovery = recovered.report;
        let state = CacheState {
            index: recovered.index,
            journal: Some(Arc::new(std::sync::Mutex::new(recovered.writer))),
            tasks: TaskTable::new(),
            journal_records,
        };

        info!(
            cache_dir = ?dir,
            max_size,
            strategy = %options.eviction_strategy,
            "Cache opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                paths: JournalPaths::new(&dir),
                recovery,
                dir,
                max_size,
                cache_version: options.cache_version,
                strategy: options.eviction_strategy,
                compaction_threshold: options.compaction_threshold,
                key_transform: options.key_transform,
                fs,
                pool,
                owns_pool,
                state: Mutex::new(state),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.inner.dir
    }

    pub fn max_size(&self) -> i64 {
        self.inner.max_size
    }

    /// What recovery found when this instance was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Return the committed path for `key`, waiting for an in-flight
    /// creation if there is one. Never starts a creation.
    pub async fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        let key = self.resolve_key(key)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        if let Some(path) = self.hit(&mut state, &key).await {
            return Ok(Some(path));
        }

        let pending = state.tasks.get(&key).map(|slot| slot.task().clone());
        if let Some(task) = pending {
            drop(state);
            debug!(key = %key, "Waiting for in-flight creation");
            return match task.await {
                Err(DiskCacheError::Cancelled) => Ok(None),
                outcome => outcome,
            };
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache miss");
        Ok(None)
    }

    /// Return the committed path for `key` only if it is already clean
    pub async fn get_if_available(&self, key: &str) -> Result<Option<PathBuf>> {
        let key = self.resolve_key(key)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        if let Some(path) = self.hit(&mut state, &key).await {
            return Ok(Some(path));
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Return the committed path for `key`, creating it with `create` on a
    /// miss. Concurrent callers for the same key share one creation.
    ///
    /// `create` receives the staging path to write and a [`CancelSignal`];
    /// returning `Ok(false)` abandons the creation and yields `Ok(None)`.
    /// Work the routine moves off its own future (blocking threads, spawned
    /// tasks) outlives cancellation and should poll the signal.
    pub async fn get_or_put<F, Fut, E>(&self, key: &str, create: F) -> Result<Option<PathBuf>>
    where
        F: FnOnce(PathBuf, CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = self.resolve_key(key)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        if let Some(path) = self.hit(&mut state, &key).await {
            return Ok(Some(path));
        }

        let pending = state.tasks.get(&key).map(|slot| slot.task().clone());
        let task = match pending {
            Some(task) => {
                debug!(key = %key, "Joining in-flight creation");
                task
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.start_creation(&mut state, key, create).await?
            }
        };
        drop(state);
        task.await
    }

    /// Replace whatever is stored for `key` with the output of `create`
    pub async fn put<F, Fut, E>(&self, key: &str, create: F) -> Result<Option<PathBuf>>
    where
        F: FnOnce(PathBuf, CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.put_async(key, create).await?.await
    }

    /// Like [`DiskCache::put`], but returns as soon as the creation has been
    /// staged. A later `put` or `remove` of the same key cancels it.
    pub async fn put_async<F, Fut, E>(&self, key: &str, create: F) -> Result<CreationTask>
    where
        F: FnOnce(PathBuf, CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = self.resolve_key(key)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        self.retire(&mut state, &key).await?;
        self.remove_clean(&mut state, &key).await?;
        self.start_creation(&mut state, key, create).await
    }

    /// Remove `key`, cancelling any in-flight creation. Returns whether
    /// anything was removed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = self.resolve_key(key)?;
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        let cancelled = self.retire(&mut state, &key).await?;
        let removed = self.remove_clean(&mut state, &key).await?;
        Ok(cancelled || removed)
    }

    /// Cancel every creation, delete every entry and reset the journal
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        let mut doomed = Vec::new();
        for (key, mut slot) in state.tasks.drain() {
            slot.cancel_and_wait().await;
            doomed.push(staging_path(&self.inner.dir, &key, slot.id()));
        }
        let entries = state.index.len();
        doomed.extend(
            state
                .index
                .keys()
                .map(|key| content_path(&self.inner.dir, key)),
        );
        state.index.clear();
        self.delete_files(doomed).await;

        self.rewrite_journal(&mut state).await?;
        info!(cache_dir = ?self.inner.dir, entries, "Cache cleared");
        Ok(())
    }

    /// Cancel pending creations and close the journal. Every later call on
    /// this instance (or its clones) fails with [`DiskCacheError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.journal.is_none() {
            return Ok(());
        }

        let mut records = Vec::new();
        let mut staged = Vec::new();
        for (key, mut slot) in state.tasks.drain() {
            slot.cancel_and_wait().await;
            staged.push(staging_path(&self.inner.dir, &key, slot.id()));
            records.push(JournalRecord::Cancel(key));
        }
        self.delete_files(staged).await;

        let result = match state.journal.take() {
            Some(journal) => {
                self.inner
                    .pool
                    .run(move || {
                        let mut writer = journal.lock().unwrap_or_else(|e| e.into_inner());
                        writer.append(&records, true)?;
                        writer.flush()
                    })
                    .await
            }
            None => Ok(Ok(())),
        };

        if self.inner.owns_pool {
            self.inner.pool.close();
        }
        info!(cache_dir = ?self.inner.dir, "Cache closed");
        result?
    }

    /// Rewrite the journal in its minimal form
    pub async fn compact(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        self.rewrite_journal(&mut state).await
    }

    /// Read the committed bytes for `key`
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.get(key).await? else {
            return Ok(None);
        };
        let fs = self.inner.fs.clone();
        let bytes = self
            .inner
            .pool
            .io(move || {
                let mut buf = Vec::new();
                match fs.open_read(&path) {
                    Ok(mut reader) => {
                        reader.read_to_end(&mut buf)?;
                        Ok(Some(buf))
                    }
                    // Evicted between lookup and read
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(bytes)
    }

    /// Get current cache statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().await;
        CacheStats {
            entries: state.index.len(),
            total_size: state.index.total_size(),
            max_size: self.inner.max_size,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            in_flight: state.tasks.len(),
            redundant_records: state.redundant_count(),
        }
    }

    fn resolve_key(&self, key: &str) -> Result<String> {
        let key = match &self.inner.key_transform {
            Some(transform) => transform.transform(key),
            None => key.to_string(),
        };
        validate_key(&key)?;
        Ok(key)
    }

    /// Serve a clean entry, recording the access
    async fn hit(&self, state: &mut CacheState, key: &str) -> Option<PathBuf> {
        state.index.touch(key)?;
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache hit");

        if self.inner.strategy.is_access_ordered() {
            let record = JournalRecord::Read(key.to_string());
            match self.append(state, vec![record], false).await {
                Ok(()) => self.maybe_compact(state).await,
                Err(e) => warn!(key = %key, error = %e, "Failed to journal read"),
            }
        }
        Some(content_path(&self.inner.dir, key))
    }

    /// Stage and spawn a creation for `key`. Any previous task must already
    /// be retired.
    async fn start_creation<F, Fut, E>(
        &self,
        state: &mut CacheState,
        key: String,
        create: F,
    ) -> Result<CreationTask>
    where
        F: FnOnce(PathBuf, CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let id = state.tasks.next_id();
        let staging = staging_path(&self.inner.dir, &key, id);

        // DIRTY is durable before the routine can write anything
        self.append(state, vec![JournalRecord::Dirty(key.clone())], true)
            .await?;

        let routine = move |cancel| async move {
            create(staging, cancel)
                .await
                .map_err(|e| DiskCacheError::Creation(e.to_string()))
        };
        let cache = self.clone();
        let finish_key = key.clone();
        let slot = launch(key.clone(), id, routine, move |result| {
            async move { cache.finish(finish_key, id, result).await }.boxed()
        });

        let task = slot.task().clone();
        state.tasks.insert(key.clone(), slot);
        debug!(key = %key, id, "Creation started");
        Ok(task)
    }

    /// Settle a creation once its routine has stopped
    async fn finish(self, key: String, id: u64, result: Option<Result<bool>>) -> CreationOutcome {
        // Cancelled routines were already cleaned up by whoever retired them
        let Some(result) = result else {
            return Err(DiskCacheError::Cancelled);
        };

        let mut state = self.inner.state.lock().await;
        if !state.tasks.is_current(&key, id) {
            return Err(DiskCacheError::Cancelled);
        }
        state.tasks.remove(&key);

        match result {
            Ok(true) => self.commit(&mut state, &key, id).await,
            Ok(false) => {
                debug!(key = %key, "Creation declined");
                self.abandon(&mut state, &key, id).await?;
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Creation failed");
                if let Err(cleanup) = self.abandon(&mut state, &key, id).await {
                    warn!(key = %key, error = %cleanup, "Failed to record cancellation");
                }
                Err(e)
            }
        }
    }

    /// Promote the staged file and make the entry clean
    async fn commit(&self, state: &mut CacheState, key: &str, id: u64) -> CreationOutcome {
        let staging = staging_path(&self.inner.dir, key, id);
        let content = content_path(&self.inner.dir, key);

        let promoted = {
            let fs = self.inner.fs.clone();
            let (staging, content) = (staging.clone(), content.clone());
            self.inner
                .pool
                .io(move || {
                    let size = fs.file_size(&staging)?;
                    fs.atomic_move(&staging, &content)?;
                    Ok(size)
                })
                .await
        };
        let size = match promoted {
            Ok(size) => size as i64,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to promote staged file");
                if let Err(cleanup) = self.abandon(state, key, id).await {
                    warn!(key = %key, error = %cleanup, "Failed to record cancellation");
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .append(state, vec![JournalRecord::Clean(key.to_string())], true)
            .await
        {
            self.delete_files(vec![content]).await;
            return Err(e);
        }
        state.index.upsert(key, size);
        debug!(key = %key, size, "Creation committed");

        self.evict(state).await;
        self.maybe_compact(state).await;

        if state.index.contains(key) {
            Ok(Some(content))
        } else {
            Ok(None)
        }
    }

    /// Discard the staged file and record the cancellation
    async fn abandon(&self, state: &mut CacheState, key: &str, id: u64) -> Result<()> {
        self.delete_files(vec![staging_path(&self.inner.dir, key, id)])
            .await;
        self.append(state, vec![JournalRecord::Cancel(key.to_string())], true)
            .await
    }

    /// Cancel the in-flight creation for `key`, if any, and clean up after
    /// it. Returns whether there was one.
    async fn retire(&self, state: &mut CacheState, key: &str) -> Result<bool> {
        let Some(mut slot) = state.tasks.remove(key) else {
            return Ok(false);
        };
        slot.cancel_and_wait().await;
        debug!(key = %key, id = slot.id(), "Creation cancelled");
        self.abandon(state, key, slot.id()).await?;
        Ok(true)
    }

    /// Delete the clean entry for `key`, if any
    async fn remove_clean(&self, state: &mut CacheState, key: &str) -> Result<bool> {
        if !state.index.contains(key) {
            return Ok(false);
        }
        {
            let fs = self.inner.fs.clone();
            let content = content_path(&self.inner.dir, key);
            self.inner.pool.io(move || fs.delete(&content)).await?;
        }
        state.index.remove(key);
        self.append(state, vec![JournalRecord::Remove(key.to_string())], true)
            .await?;
        self.maybe_compact(state).await;
        debug!(key = %key, "Entry removed");
        Ok(true)
    }

    /// Evict entries until the cache fits its limit
    async fn evict(&self, state: &mut CacheState) {
        let mut victims = Vec::new();
        state
            .index
            .evict_until(self.inner.max_size, |key, _| victims.push(key));
        if victims.is_empty() {
            return;
        }

        for key in &victims {
            debug!(key = %key, "Evicting entry");
        }
        let files = victims
            .iter()
            .map(|key| content_path(&self.inner.dir, key))
            .collect();
        self.delete_files(files).await;

        let records = victims.into_iter().map(JournalRecord::Remove).collect();
        if let Err(e) = self.append(state, records, true).await {
            warn!(error = %e, "Failed to journal evictions");
        }
    }

    /// Best-effort deletion; failures are logged
    async fn delete_files(&self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        let fs = self.inner.fs.clone();
        let result = self
            .inner
            .pool
            .run(move || {
                for path in &paths {
                    if let Err(e) = fs.delete(path) {
                        warn!(path = ?path, error = %e, "Failed to delete cache file");
                    }
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to schedule cache file deletion");
        }
    }

    /// Append records to the journal. On failure the journal is rewritten
    /// from memory so a partially written record cannot linger.
    async fn append(
        &self,
        state: &mut CacheState,
        records: Vec<JournalRecord>,
        durable: bool,
    ) -> Result<()> {
        let journal = state.journal.clone().ok_or(DiskCacheError::Closed)?;
        let count = records.len() as u64;
        let result = self
            .inner
            .pool
            .run(move || {
                let mut writer = journal.lock().unwrap_or_else(|e| e.into_inner());
                writer.append(&records, durable)
            })
            .await
            .and_then(|appended| appended);

        match result {
            Ok(()) => {
                state.journal_records += count;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Journal append failed, rewriting journal");
                if let Err(rewrite) = self.rewrite_journal(state).await {
                    error!(error = %rewrite, "Failed to rewrite journal");
                }
                Err(e)
            }
        }
    }

    async fn maybe_compact(&self, state: &mut CacheState) {
        let redundant = state.redundant_count();
        if redundant < self.inner.compaction_threshold || redundant < state.index.len() as u64 {
            return;
        }
        if let Err(e) = self.rewrite_journal(state).await {
            warn!(error = %e, redundant, "Journal compaction failed");
        }
    }

    /// Atomically replace the journal with the minimal equivalent of the
    /// current state and reopen the appender on it
    async fn rewrite_journal(&self, state: &mut CacheState) -> Result<()> {
        if state.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }

        let clean: Vec<String> = state.index.keys().map(str::to_string).collect();
        let dirty = state.tasks.keys();
        let content = compact_bytes(
            clean.iter().map(String::as_str),
            dirty.iter().map(String::as_str),
            self.inner.cache_version,
        )?;
        let before = state.redundant_count();

        {
            let fs = self.inner.fs.clone();
            let paths = self.inner.paths.clone();
            self.inner
                .pool
                .io(move || replace_journal(fs.as_ref(), &paths, &content))
                .await?;
        }

        let fs = self.inner.fs.clone();
        let main = self.inner.paths.main.clone();
        match self
            .inner
            .pool
            .io(move || JournalWriter::open(fs.as_ref(), &main))
            .await
        {
            Ok(writer) => {
                state.journal = Some(Arc::new(std::sync::Mutex::new(writer)));
                state.journal_records = (clean.len() + dirty.len()) as u64;
                info!(
                    cache_dir = ?self.inner.dir,
                    entries = clean.len(),
                    in_flight = dirty.len(),
                    dropped_records = before,
                    "Journal compacted"
                );
                Ok(())
            }
            Err(e) => {
                // The old appender points at a replaced file; stop serving
                error!(error = %e, "Failed to reopen journal, closing cache");
                state.journal = None;
                Err(e)
            }
        }
    }
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("dir", &self.inner.dir)
            .field("max_size", &self.inner.max_size)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}
