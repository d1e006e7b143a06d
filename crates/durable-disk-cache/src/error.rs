//! Error types for the durable disk cache

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum DiskCacheError {
    /// Filesystem failure; shared so a creation outcome can reach every waiter
    Io(Arc<std::io::Error>),
    HeaderInvalid(String),
    OpcodeInvalid(u8),
    JournalCorrupt(String),
    KeyInvalid(String),
    Creation(String),
    Cancelled,
    Closed,
    Task(String),
    Config(String),
}

impl DiskCacheError {
    /// Whether this error means the journal content cannot be replayed
    pub fn is_journal_invalid(&self) -> bool {
        matches!(
            self,
            DiskCacheError::HeaderInvalid(_)
                | DiskCacheError::OpcodeInvalid(_)
                | DiskCacheError::JournalCorrupt(_)
        )
    }
}

impl fmt::Display for DiskCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskCacheError::Io(err) => write!(f, "IO error: {}", err),
            DiskCacheError::HeaderInvalid(msg) => write!(f, "Invalid journal header: {}", msg),
            DiskCacheError::OpcodeInvalid(op) => write!(f, "Invalid journal opcode: {}", op),
            DiskCacheError::JournalCorrupt(msg) => write!(f, "Corrupt journal record: {}", msg),
            DiskCacheError::KeyInvalid(msg) => write!(f, "Invalid cache key: {}", msg),
            DiskCacheError::Creation(msg) => write!(f, "Creation failed: {}", msg),
            DiskCacheError::Cancelled => write!(f, "Creation cancelled"),
            DiskCacheError::Closed => write!(f, "Cache is closed"),
            DiskCacheError::Task(msg) => write!(f, "Task error: {}", msg),
            DiskCacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for DiskCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskCacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DiskCacheError {
    fn from(err: std::io::Error) -> Self {
        DiskCacheError::Io(Arc::new(err))
    }
}

impl From<tokio::task::JoinError> for DiskCacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        DiskCacheError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskCacheError>;
