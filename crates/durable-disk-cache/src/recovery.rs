//! Open-time recovery
//!
//! Reconciles the journal with the files actually present in the cache
//! directory and rebuilds the entry index. Runs once, blocking, on the I/O
//! pool before the cache serves any request.

use crate::error::Result;
use crate::fs::FileSystem;
use crate::index::EntryIndex;
use crate::journal::{
    compact_bytes, read_journal, replace_journal, resolve_crash_state, JournalPaths,
    JournalState, JournalWriter, BACKUP_JOURNAL_FILE, JOURNAL_FILE, TEMP_JOURNAL_FILE,
};
use crate::key::{content_path, validate_key, STAGING_SUFFIX};
use crate::types::EvictionStrategy;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Attempts at durably writing a fresh journal before open gives up
pub const JOURNAL_WRITE_ATTEMPTS: u32 = 3;

/// Inputs to [`recover`]
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_size: i64,
    pub cache_version: Option<u32>,
    pub eviction_strategy: EvictionStrategy,
    pub compaction_threshold: u64,
}

/// What recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    /// Clean entries whose backing file was missing or unreadable
    pub dropped: usize,
    /// Dirty entries discarded
    pub discarded: usize,
    /// Entries evicted because the recovered total exceeded the limit
    pub evicted: usize,
    /// Files deleted because no entry owned them: staging files, plus any
    /// content the replayed journal no longer references
    pub swept: usize,
    pub total_size: i64,
    /// Whether the journal was unusable and the directory wiped
    pub wiped: bool,
    /// Whether the journal was rewritten in compact form
    pub rewritten: bool,
}

/// Recovered state handed to the cache
pub struct Recovered {
    pub index: EntryIndex,
    pub writer: JournalWriter,
    pub redundant_count: u64,
    pub report: RecoveryReport,
}

/// Recover the cache in `dir`
pub fn recover(fs: &dyn FileSystem, dir: &Path, config: &RecoveryConfig) -> Result<Recovered> {
    fs.create_directories(dir)?;
    let paths = JournalPaths::new(dir);
    resolve_crash_state(fs, &paths)?;

    let mut report = RecoveryReport::default();
    let state = load_state(fs, dir, &paths, config, &mut report)?;
    let journal_found = state.is_some();
    let state = state.unwrap_or_default();

    let mut index = EntryIndex::new(config.eviction_strategy);

    let dirty: HashSet<String> = state.dirty_keys().into_iter().collect();
    for key in &dirty {
        if validate_key(key).is_err() {
            report.discarded += 1;
            continue;
        }
        debug!(key = %key, "Discarding unfinished entry");
        // A dirty key never has committed content; anything at its content
        // path was promoted without its CLEAN record reaching the journal.
        // Its staging files go with the directory sweep below.
        if let Err(e) = fs.delete(&content_path(dir, key)) {
            warn!(key = %key, error = %e, "Failed to delete unfinished file");
        }
        report.discarded += 1;
    }

    for key in state.clean_keys() {
        if validate_key(&key).is_err() {
            warn!(key = %key, "Dropping journal entry with unusable key");
            report.dropped += 1;
            continue;
        }
        if dirty.contains(&key) {
            report.dropped += 1;
            continue;
        }
        let path = content_path(dir, &key);
        match fs.file_size(&path) {
            Ok(size) => {
                index.upsert(key, size as i64);
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Dropping entry without backing file");
                report.dropped += 1;
            }
        }
    }

    let mut victims = Vec::new();
    index.evict_until(config.max_size, |key, _| victims.push(key));
    for key in &victims {
        if let Err(e) = fs.delete(&content_path(dir, key)) {
            warn!(key = %key, error = %e, "Failed to delete evicted file");
        }
    }
    report.evicted = victims.len();
    report.swept = sweep_directory(fs, dir, &index, journal_found);
    report.recovered = index.len();
    report.total_size = index.total_size();

    let needs_rewrite = !journal_found
        || state.is_torn()
        || report.discarded > 0
        || report.dropped > 0
        || report.evicted > 0
        || state.redundant_count() >= config.compaction_threshold;

    let redundant_count = if needs_rewrite {
        let content = compact_bytes(index.keys(), std::iter::empty(), config.cache_version)?;
        write_fresh_journal(fs, &paths, &content)?;
        report.rewritten = true;
        0
    } else {
        state.redundant_count()
    };

    let writer = JournalWriter::open(fs, &paths.main)?;

    info!(
        dir = ?dir,
        recovered = report.recovered,
        dropped = report.dropped,
        discarded = report.discarded,
        evicted = report.evicted,
        swept = report.swept,
        total_size = report.total_size,
        rewritten = report.rewritten,
        "Cache recovered"
    );

    Ok(Recovered {
        index,
        writer,
        redundant_count,
        report,
    })
}

/// Read the journal. `None` means there is nothing to replay; an unusable
/// journal wipes the directory first.
fn load_state(
    fs: &dyn FileSystem,
    dir: &Path,
    paths: &JournalPaths,
    config: &RecoveryConfig,
    report: &mut RecoveryReport,
) -> Result<Option<JournalState>> {
    if !fs.exists(&paths.main) {
        debug!(dir = ?dir, "No journal found, starting empty");
        return Ok(None);
    }

    let reader = fs.open_read(&paths.main)?;
    match read_journal(reader, config.cache_version) {
        Ok(state) => Ok(Some(state)),
        Err(e) if e.is_journal_invalid() => {
            warn!(dir = ?dir, error = %e, "Journal unusable, wiping cache directory");
            fs.delete_recursively(dir)?;
            fs.create_directories(dir)?;
            report.wiped = true;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Delete files no entry owns. Staging files are always orphans at open.
/// Other unindexed files are only removed when a journal was replayed:
/// they are content whose deletion failed after its REMOVE was journaled.
/// Without a journal there is no record of what the files are, so they
/// stay. Returns how many files were deleted.
fn sweep_directory(
    fs: &dyn FileSystem,
    dir: &Path,
    index: &EntryIndex,
    journal_replayed: bool,
) -> usize {
    let listed = match fs.list(dir) {
        Ok(listed) => listed,
        Err(e) => {
            warn!(dir = ?dir, error = %e, "Failed to list cache directory");
            return 0;
        }
    };

    let mut swept = 0;
    for path in listed {
        let name = path.file_name().and_then(|n| n.to_str());
        if matches!(name, Some(JOURNAL_FILE | TEMP_JOURNAL_FILE | BACKUP_JOURNAL_FILE)) {
            continue;
        }
        let staged = name.is_some_and(|n| n.ends_with(STAGING_SUFFIX));
        let unowned = journal_replayed && !name.is_some_and(|n| index.contains(n));
        if !staged && !unowned {
            continue;
        }

        debug!(path = ?path, staged, "Deleting unowned cache file");
        match fs.delete(&path) {
            Ok(()) => swept += 1,
            Err(e) => warn!(path = ?path, error = %e, "Failed to delete unowned file"),
        }
    }
    swept
}

fn write_fresh_journal(fs: &dyn FileSystem, paths: &JournalPaths, content: &[u8]) -> Result<()> {
    let mut attempt = 1;
    loop {
        match replace_journal(fs, paths, content) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < JOURNAL_WRITE_ATTEMPTS => {
                warn!(attempt, error = %e, "Failed to write journal, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
