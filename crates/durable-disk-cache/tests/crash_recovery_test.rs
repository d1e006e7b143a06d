use durable_disk_cache::journal::{encode_header, JournalRecord};
use durable_disk_cache::{
    DiskCache, DiskCacheError, DiskCacheOptions, FileSink, FileSystem, LocalFileSystem,
};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

/// Local filesystem that can be told to fail promoting the temp journal
#[derive(Default)]
struct FlakyFileSystem {
    fail_journal_promotion: AtomicBool,
}

impl FileSystem for FlakyFileSystem {
    fn exists(&self, path: &Path) -> bool {
        LocalFileSystem.exists(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.delete(path)
    }

    fn delete_recursively(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.delete_recursively(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        LocalFileSystem.list(dir)
    }

    fn atomic_move(&self, from: &Path, to: &Path) -> io::Result<()> {
        let promoting = from.file_name().is_some_and(|name| name == "journal.tmp");
        if promoting && self.fail_journal_promotion.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated crash"));
        }
        LocalFileSystem.atomic_move(from, to)
    }

    fn create_directories(&self, dir: &Path) -> io::Result<()> {
        LocalFileSystem.create_directories(dir)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        LocalFileSystem.file_size(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        LocalFileSystem.open_read(path)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn FileSink>> {
        LocalFileSystem.open_append(path)
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileSink>> {
        LocalFileSystem.open_write(path)
    }
}

async fn write_bytes(path: PathBuf, data: &'static [u8]) -> io::Result<bool> {
    tokio::fs::write(path, data).await?;
    Ok(true)
}

#[tokio::test]
async fn interrupted_compaction_recovers_from_backup() {
    let dir = tempdir().unwrap();
    let flaky = Arc::new(FlakyFileSystem::default());
    let options = DiskCacheOptions {
        file_system: Some(flaky.clone()),
        ..DiskCacheOptions::default()
    };

    let cache = DiskCache::open(dir.path(), 1024, options).await.unwrap();
    cache.put("a", |p, _| write_bytes(p, b"alpha")).await.unwrap();
    cache.put("b", |p, _| write_bytes(p, b"beta")).await.unwrap();

    flaky.fail_journal_promotion.store(true, Ordering::SeqCst);
    assert!(matches!(cache.compact().await, Err(DiskCacheError::Io(_))));
    drop(cache);

    // The old journal now only exists as the backup
    assert!(!dir.path().join("journal").exists());
    assert!(dir.path().join("journal.bkp").exists());

    let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
        .await
        .unwrap();
    assert_eq!(cache.stats().await.entries, 2);
    assert_eq!(cache.read("a").await.unwrap(), Some(b"alpha".to_vec()));
    assert_eq!(cache.read("b").await.unwrap(), Some(b"beta".to_vec()));
    assert!(!dir.path().join("journal.bkp").exists());
    assert!(!dir.path().join("journal.tmp").exists());
}

#[tokio::test]
async fn stale_backup_is_discarded() {
    let dir = tempdir().unwrap();
    {
        let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
            .await
            .unwrap();
        cache.put("a", |p, _| write_bytes(p, b"alpha")).await.unwrap();
        cache.close().await.unwrap();
    }

    // A backup next to a complete journal is left over from a finished swap
    let mut stale = encode_header(None);
    JournalRecord::Clean("ghost".to_string())
        .encode_into(&mut stale)
        .unwrap();
    std::fs::write(dir.path().join("journal.bkp"), stale).unwrap();
    std::fs::write(dir.path().join("journal.tmp"), b"half written").unwrap();

    let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
        .await
        .unwrap();
    assert_eq!(cache.stats().await.entries, 1);
    assert!(cache.get("ghost").await.unwrap().is_none());
    assert!(!dir.path().join("journal.bkp").exists());
}

#[tokio::test]
async fn crash_mid_creation_discards_partial_file() {
    let dir = tempdir().unwrap();
    let mut journal = encode_header(None);
    for record in [
        JournalRecord::Dirty("done".to_string()),
        JournalRecord::Clean("done".to_string()),
        JournalRecord::Dirty("partial".to_string()),
    ] {
        record.encode_into(&mut journal).unwrap();
    }
    // Torn trailing record
    journal.extend_from_slice(&[2, 9, b'u', b'n']);
    std::fs::write(dir.path().join("journal"), journal).unwrap();
    std::fs::write(dir.path().join("done"), b"12345").unwrap();
    std::fs::write(dir.path().join("partial.3.tmp"), b"12").unwrap();

    let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
        .await
        .unwrap();

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_size, 5);
    assert_eq!(stats.redundant_records, 0);
    assert!(!dir.path().join("partial.3.tmp").exists());
    let report = cache.recovery_report();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.swept, 1);
    assert!(report.rewritten);
    assert!(cache.get("partial").await.unwrap().is_none());
}

#[tokio::test]
async fn corrupt_journal_wipes_directory() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("journal"), b"not a journal at all").unwrap();
    std::fs::write(dir.path().join("orphan"), b"data").unwrap();

    let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
        .await
        .unwrap();

    assert_eq!(cache.stats().await.entries, 0);
    assert!(!dir.path().join("orphan").exists());
    assert!(cache.recovery_report().wiped);
    cache.put("fresh", |p, _| write_bytes(p, b"ok")).await.unwrap();
    assert_eq!(cache.read("fresh").await.unwrap(), Some(b"ok".to_vec()));
}

#[tokio::test]
async fn content_left_by_failed_delete_is_reclaimed() {
    let dir = tempdir().unwrap();
    {
        let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
            .await
            .unwrap();
        cache.put("a", |p, _| write_bytes(p, b"alpha")).await.unwrap();
        cache.put("b", |p, _| write_bytes(p, b"beta")).await.unwrap();
        cache.remove("b").await.unwrap();
        cache.close().await.unwrap();
    }
    // REMOVE reached the journal but the file stayed behind
    std::fs::write(dir.path().join("b"), b"beta").unwrap();

    let cache = DiskCache::open(dir.path(), 1024, DiskCacheOptions::default())
        .await
        .unwrap();

    assert_eq!(cache.recovery_report().swept, 1);
    assert!(!dir.path().join("b").exists());
    assert_eq!(cache.read("a").await.unwrap(), Some(b"alpha".to_vec()));
    assert_eq!(cache.stats().await.total_size, 5);
}
