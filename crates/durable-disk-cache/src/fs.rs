//! Filesystem capability
//!
//! The cache performs every file operation through [`FileSystem`] so the
//! journal protocol can be exercised against injected failures. All methods
//! are blocking and are only ever called from the cache's I/O pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// A writable file handle that can be made durable
pub trait FileSink: Write + Send {
    /// Flush file data to stable storage
    fn sync(&mut self) -> io::Result<()>;
}

impl FileSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Blocking filesystem operations consumed by the cache
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Delete a file; a missing file is not an error
    fn delete(&self, path: &Path) -> io::Result<()>;

    /// Delete a directory and everything below it; a missing directory is not an error
    fn delete_recursively(&self, path: &Path) -> io::Result<()>;

    /// List the entries of a directory
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Rename `from` to `to`, replacing `to` if it exists
    fn atomic_move(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn create_directories(&self, dir: &Path) -> io::Result<()>;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Open for appending, creating the file if needed
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn FileSink>>;

    /// Open for writing, truncating any existing content
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileSink>>;
}

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn delete_recursively(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            paths.push(entry?.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn atomic_move(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn create_directories(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        Ok(metadata.len())
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn FileSink>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileSink>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(file))
    }
}
