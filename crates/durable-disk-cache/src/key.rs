//! Key transforms and validation

use crate::error::{DiskCacheError, Result};
use crate::index::EntryIndex;
use crate::journal::{BACKUP_JOURNAL_FILE, JOURNAL_FILE, MAX_KEY_LEN, TEMP_JOURNAL_FILE};
use crate::types::EvictionStrategy;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Suffix of staging files; reserved so content names never collide with them
pub const STAGING_SUFFIX: &str = ".tmp";

/// Default number of memoized transforms kept by [`CachedKeyTransform`]
pub const DEFAULT_TRANSFORM_CACHE_SIZE: usize = 1024;

/// Maps a caller key to the name used on disk and in the journal
pub trait KeyTransform: Send + Sync {
    fn transform(&self, key: &str) -> String;
}

impl<F> KeyTransform for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn transform(&self, key: &str) -> String {
        self(key)
    }
}

/// Lowercase hex SHA-256 of the key
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyTransform;

impl KeyTransform for Sha256KeyTransform {
    fn transform(&self, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Memoizes another transform in a bounded LRU index
pub struct CachedKeyTransform<T> {
    inner: T,
    capacity: usize,
    memo: Mutex<EntryIndex<String>>,
}

impl<T: KeyTransform> CachedKeyTransform<T> {
    pub fn new(inner: T) -> Self {
        Self::with_capacity(inner, DEFAULT_TRANSFORM_CACHE_SIZE)
    }

    pub fn with_capacity(inner: T, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            memo: Mutex::new(EntryIndex::new(EvictionStrategy::Lru)),
        }
    }

    /// Number of memoized transforms
    pub fn cached(&self) -> usize {
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<T: KeyTransform> KeyTransform for CachedKeyTransform<T> {
    fn transform(&self, key: &str) -> String {
        {
            let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = memo.touch(key) {
                return entry.value.clone();
            }
        }

        // Computed outside the lock; a racing duplicate just overwrites
        let transformed = self.inner.transform(key);

        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.insert(key.to_string(), 1, transformed.clone());
        memo.evict_until(self.capacity as i64, |_, _| {});
        transformed
    }
}

/// Check that a (transformed) key is usable as a journal record and file name
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(DiskCacheError::KeyInvalid("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(DiskCacheError::KeyInvalid(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(DiskCacheError::KeyInvalid(format!(
            "key contains a path separator or NUL: {:?}",
            key
        )));
    }
    if key == "." || key == ".." {
        return Err(DiskCacheError::KeyInvalid(format!("reserved key: {}", key)));
    }
    if key == JOURNAL_FILE || key == TEMP_JOURNAL_FILE || key == BACKUP_JOURNAL_FILE {
        return Err(DiskCacheError::KeyInvalid(format!(
            "key collides with the journal: {}",
            key
        )));
    }
    if key.ends_with(STAGING_SUFFIX) {
        return Err(DiskCacheError::KeyInvalid(format!(
            "key ends with the staging suffix: {}",
            key
        )));
    }
    Ok(())
}

/// Where the committed content for `key` lives
pub fn content_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(key)
}

/// Where creation `id` for `key` is staged before promotion.
///
/// Task ids are unique, so each creation gets its own file and a retired
/// writer can never land bytes in a later creation's staging file. The key
/// part is shortened when the full name would not fit a file name.
pub fn staging_path(dir: &Path, key: &str, id: u64) -> PathBuf {
    let suffix = format!(".{}{}", id, STAGING_SUFFIX);
    let mut keep = key.len().min(MAX_KEY_LEN.saturating_sub(suffix.len()));
    while !key.is_char_boundary(keep) {
        keep -= 1;
    }
    dir.join(format!("{}{}", &key[..keep], suffix))
}
