//! Write-ahead journal
//!
//! # Format
//!
//! | Field | Size | Notes |
//! |---|---|---|
//! | magic | 8 | `DSKJRNL\0` |
//! | format version | 1 | `1` without a cache version, `2` with one |
//! | cache version | 4 | big-endian, present only under format `2` |
//! | records | ... | `opcode (1) | key length (1) | key bytes` |
//!
//! A stream that ends exactly on a record boundary ends cleanly. A stream that
//! ends inside a record is torn: everything before the torn record is
//! replayed and the rest is ignored.
//!
//! # Replacement
//!
//! The journal is only ever rewritten through [`replace_journal`], which goes
//! temp -> (main -> backup) -> main so that a complete journal exists on disk
//! at every instant. [`resolve_crash_state`] undoes a half-finished replace.

use crate::error::{DiskCacheError, Result};
use crate::fs::{FileSink, FileSystem};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "journal";
pub const TEMP_JOURNAL_FILE: &str = "journal.tmp";
pub const BACKUP_JOURNAL_FILE: &str = "journal.bkp";

pub const MAGIC: [u8; 8] = *b"DSKJRNL\0";
/// Format of a journal written without a cache version
pub const FORMAT_VERSION: u8 = 1;
/// Same record format, with a 4-byte cache version after the format byte
pub const FORMAT_VERSION_VERSIONED: u8 = 2;

/// Longest encodable key, in UTF-8 bytes
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

/// Journal opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Dirty = 1,
    Clean = 2,
    Cancel = 3,
    Remove = 4,
    Read = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = DiskCacheError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Opcode::Dirty),
            2 => Ok(Opcode::Clean),
            3 => Ok(Opcode::Cancel),
            4 => Ok(Opcode::Remove),
            5 => Ok(Opcode::Read),
            other => Err(DiskCacheError::OpcodeInvalid(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

/// One journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Dirty(String),
    Clean(String),
    Cancel(String),
    Remove(String),
    Read(String),
}

impl JournalRecord {
    pub fn new(op: Opcode, key: String) -> Self {
        match op {
            Opcode::Dirty => JournalRecord::Dirty(key),
            Opcode::Clean => JournalRecord::Clean(key),
            Opcode::Cancel => JournalRecord::Cancel(key),
            Opcode::Remove => JournalRecord::Remove(key),
            Opcode::Read => JournalRecord::Read(key),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            JournalRecord::Dirty(_) => Opcode::Dirty,
            JournalRecord::Clean(_) => Opcode::Clean,
            JournalRecord::Cancel(_) => Opcode::Cancel,
            JournalRecord::Remove(_) => Opcode::Remove,
            JournalRecord::Read(_) => Opcode::Read,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            JournalRecord::Dirty(key)
            | JournalRecord::Clean(key)
            | JournalRecord::Cancel(key)
            | JournalRecord::Remove(key)
            | JournalRecord::Read(key) => key,
        }
    }

    /// Append the encoded record to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let key = self.key().as_bytes();
        if key.len() > MAX_KEY_LEN {
            return Err(DiskCacheError::KeyInvalid(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        buf.push(self.opcode().into());
        buf.push(key.len() as u8);
        buf.extend_from_slice(key);
        Ok(())
    }
}

/// Encode the journal header
pub fn encode_header(cache_version: Option<u32>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAGIC.len() + 5);
    buf.extend_from_slice(&MAGIC);
    match cache_version {
        Some(version) => {
            buf.push(FORMAT_VERSION_VERSIONED);
            buf.extend_from_slice(&version.to_be_bytes());
        }
        None => buf.push(FORMAT_VERSION),
    }
    buf
}

/// Validate the journal header against the expected cache version
pub fn read_header<R: Read>(reader: &mut R, cache_version: Option<u32>) -> Result<()> {
    let mut magic = [0u8; 8];
    read_header_bytes(reader, &mut magic)?;
    if magic != MAGIC {
        return Err(DiskCacheError::HeaderInvalid(format!(
            "bad magic {:02x?}",
            magic
        )));
    }

    let mut format = [0u8; 1];
    read_header_bytes(reader, &mut format)?;
    let found = match format[0] {
        FORMAT_VERSION => None,
        FORMAT_VERSION_VERSIONED => {
            let mut version = [0u8; 4];
            read_header_bytes(reader, &mut version)?;
            Some(u32::from_be_bytes(version))
        }
        other => {
            return Err(DiskCacheError::HeaderInvalid(format!(
                "unsupported format version {}",
                other
            )));
        }
    };

    if found != cache_version {
        return Err(DiskCacheError::HeaderInvalid(format!(
            "cache version {:?} does not match {:?}",
            found, cache_version
        )));
    }
    Ok(())
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            DiskCacheError::HeaderInvalid("truncated header".to_string())
        } else {
            e.into()
        }
    })
}

/// Result of reading one record
#[derive(Debug, PartialEq, Eq)]
pub enum RecordRead {
    Record(JournalRecord),
    /// The stream ended on a record boundary
    End,
    /// The stream ended inside a record
    Torn,
}

/// Read the next record from the stream
pub fn read_record<R: Read>(reader: &mut R) -> Result<RecordRead> {
    let mut head = [0u8; 1];
    if !read_fully(reader, &mut head)? {
        return Ok(RecordRead::End);
    }
    let op = Opcode::try_from(head[0])?;

    let mut len = [0u8; 1];
    if !read_fully(reader, &mut len)? {
        return Ok(RecordRead::Torn);
    }

    let mut key = vec![0u8; len[0] as usize];
    if !read_fully(reader, &mut key)? {
        return Ok(RecordRead::Torn);
    }
    let key = String::from_utf8(key)
        .map_err(|e| DiskCacheError::JournalCorrupt(format!("key is not UTF-8: {}", e)))?;

    Ok(RecordRead::Record(JournalRecord::new(op, key)))
}

/// Fill `buf` completely. Returns false if the stream ended first.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// State derived by replaying a journal
#[derive(Debug, Default)]
pub struct JournalState {
    clean_order: BTreeMap<u64, String>,
    clean_seq: HashMap<String, u64>,
    dirty: BTreeSet<String>,
    next_seq: u64,
    records: u64,
    torn: bool,
}

impl JournalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record into the state
    pub fn apply(&mut self, record: JournalRecord) {
        self.records += 1;
        match record {
            JournalRecord::Dirty(key) => {
                self.dirty.insert(key);
            }
            JournalRecord::Clean(key) => {
                self.dirty.remove(&key);
                self.remove_clean(&key);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.clean_order.insert(seq, key.clone());
                self.clean_seq.insert(key, seq);
            }
            JournalRecord::Cancel(key) | JournalRecord::Remove(key) => {
                self.dirty.remove(&key);
                self.remove_clean(&key);
            }
            JournalRecord::Read(_) => {}
        }
    }

    fn remove_clean(&mut self, key: &str) {
        if let Some(seq) = self.clean_seq.remove(key) {
            self.clean_order.remove(&seq);
        }
    }

    /// Clean keys, oldest CLEAN first
    pub fn clean_keys(&self) -> Vec<String> {
        self.clean_order.values().cloned().collect()
    }

    pub fn dirty_keys(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    pub fn records_processed(&self) -> u64 {
        self.records
    }

    /// Records that do not correspond to a live clean entry
    pub fn redundant_count(&self) -> u64 {
        self.records - self.clean_seq.len() as u64
    }

    /// Whether replay stopped on a partially written record
    pub fn is_torn(&self) -> bool {
        self.torn
    }
}

/// Read and replay a complete journal stream
pub fn read_journal<R: Read>(reader: R, cache_version: Option<u32>) -> Result<JournalState> {
    let mut reader = io::BufReader::new(reader);
    read_header(&mut reader, cache_version)?;

    let mut state = JournalState::new();
    loop {
        match read_record(&mut reader)? {
            RecordRead::Record(record) => state.apply(record),
            RecordRead::End => break,
            RecordRead::Torn => {
                state.torn = true;
                break;
            }
        }
    }
    Ok(state)
}

/// Encode the minimal journal equivalent to the given state
pub fn compact_bytes<'a, C, D>(clean: C, dirty: D, cache_version: Option<u32>) -> Result<Vec<u8>>
where
    C: IntoIterator<Item = &'a str>,
    D: IntoIterator<Item = &'a str>,
{
    let mut buf = encode_header(cache_version);
    for key in clean {
        JournalRecord::Clean(key.to_string()).encode_into(&mut buf)?;
    }
    for key in dirty {
        JournalRecord::Dirty(key.to_string()).encode_into(&mut buf)?;
    }
    Ok(buf)
}

/// Locations of the journal files in a cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalPaths {
    pub main: PathBuf,
    pub temp: PathBuf,
    pub backup: PathBuf,
}

impl JournalPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            main: dir.join(JOURNAL_FILE),
            temp: dir.join(TEMP_JOURNAL_FILE),
            backup: dir.join(BACKUP_JOURNAL_FILE),
        }
    }
}

/// Settle whatever a crash during [`replace_journal`] left behind.
///
/// The temp journal is never trusted. A backup without a main journal is
/// promoted; a backup next to a main journal is stale.
pub fn resolve_crash_state(fs: &dyn FileSystem, paths: &JournalPaths) -> io::Result<()> {
    fs.delete(&paths.temp)?;
    if fs.exists(&paths.backup) {
        if fs.exists(&paths.main) {
            fs.delete(&paths.backup)?;
        } else {
            fs.atomic_move(&paths.backup, &paths.main)?;
        }
    }
    Ok(())
}

/// Atomically replace the journal with `content`
pub fn replace_journal(fs: &dyn FileSystem, paths: &JournalPaths, content: &[u8]) -> io::Result<()> {
    fs.delete(&paths.temp)?;

    {
        let mut sink = fs.open_write(&paths.temp)?;
        sink.write_all(content)?;
        sink.flush()?;
        sink.sync()?;
    }

    if fs.exists(&paths.main) {
        fs.atomic_move(&paths.main, &paths.backup)?;
    }
    fs.atomic_move(&paths.temp, &paths.main)?;
    fs.delete(&paths.backup)?;
    Ok(())
}

/// Buffered appender over the main journal
pub struct JournalWriter {
    sink: BufWriter<Box<dyn FileSink>>,
}

impl JournalWriter {
    pub fn open(fs: &dyn FileSystem, path: &Path) -> io::Result<Self> {
        Ok(Self {
            sink: BufWriter::new(fs.open_append(path)?),
        })
    }

    /// Append records; with `durable`, flush them to stable storage
    pub fn append(&mut self, records: &[JournalRecord], durable: bool) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            record.encode_into(&mut buf)?;
        }
        self.sink.write_all(&buf)?;
        self.sink.flush()?;
        if durable {
            self.sink.get_mut().sync()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        self.sink.get_mut().sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn sample_records() -> Vec<JournalRecord> {
        vec![
            JournalRecord::Dirty("a".to_string()),
            JournalRecord::Clean("a".to_string()),
            JournalRecord::Dirty("b".to_string()),
            JournalRecord::Remove("b".to_string()),
            JournalRecord::Clean("c".to_string()),
        ]
    }

    fn encode(records: &[JournalRecord], cache_version: Option<u32>) -> Vec<u8> {
        let mut buf = encode_header(cache_version);
        for record in records {
            record.encode_into(&mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_opcode_mapping_is_total() {
        for byte in 0u8..=255 {
            match Opcode::try_from(byte) {
                Ok(op) => assert_eq!(u8::from(op), byte),
                Err(e) => assert!(matches!(e, DiskCacheError::OpcodeInvalid(b) if b == byte)),
            }
        }
        assert_eq!(u8::from(Opcode::Dirty), 1);
        assert_eq!(u8::from(Opcode::Read), 5);
    }

    #[test]
    fn test_replay_folds_records() {
        let bytes = encode(&sample_records(), None);
        let state = read_journal(Cursor::new(bytes), None).unwrap();

        assert_eq!(state.clean_keys(), vec!["a", "c"]);
        assert!(state.dirty_keys().is_empty());
        assert_eq!(state.records_processed(), 5);
        assert_eq!(state.redundant_count(), 3);
        assert!(!state.is_torn());
    }

    #[test]
    fn test_clean_moves_key_to_end() {
        let records = vec![
            JournalRecord::Clean("a".to_string()),
            JournalRecord::Clean("b".to_string()),
            JournalRecord::Read("a".to_string()),
            JournalRecord::Clean("a".to_string()),
        ];
        let state = read_journal(Cursor::new(encode(&records, None)), None).unwrap();
        assert_eq!(state.clean_keys(), vec!["b", "a"]);
        assert_eq!(state.redundant_count(), 2);
    }

    #[test]
    fn test_cancel_clears_dirty() {
        let records = vec![
            JournalRecord::Dirty("x".to_string()),
            JournalRecord::Dirty("y".to_string()),
            JournalRecord::Cancel("x".to_string()),
        ];
        let state = read_journal(Cursor::new(encode(&records, None)), None).unwrap();
        assert_eq!(state.dirty_keys(), vec!["y"]);
        assert!(state.clean_keys().is_empty());
    }

    #[test]
    fn test_truncation_yields_parsed_prefix() {
        let records = sample_records();
        let full = encode(&records, Some(7));
        let header_len = encode_header(Some(7)).len();

        // Byte offset at which each record ends
        let mut boundaries = Vec::new();
        let mut offset = header_len;
        for record in &records {
            offset += 2 + record.key().len();
            boundaries.push(offset);
        }

        for cut in header_len..=full.len() {
            let state = read_journal(Cursor::new(full[..cut].to_vec()), Some(7)).unwrap();
            let complete = boundaries.iter().filter(|&&end| end <= cut).count();
            assert_eq!(state.records_processed(), complete as u64, "cut at {}", cut);
            let on_boundary = cut == header_len || boundaries.contains(&cut);
            assert_eq!(state.is_torn(), !on_boundary, "cut at {}", cut);
        }
    }

    #[test]
    fn test_bad_magic_is_header_invalid() {
        let bytes = b"NOTMAGIC\x01".to_vec();
        assert_eq!(bytes.len(), 9);
        let result = read_journal(Cursor::new(bytes), None);
        assert!(matches!(result, Err(DiskCacheError::HeaderInvalid(_))));
    }

    #[test]
    fn test_truncated_header_is_header_invalid() {
        let result = read_journal(Cursor::new(MAGIC[..5].to_vec()), None);
        assert!(matches!(result, Err(DiskCacheError::HeaderInvalid(_))));
    }

    #[test]
    fn test_format_version_mismatch() {
        let mut bytes = encode_header(None);
        bytes[8] = 0xff;
        let result = read_journal(Cursor::new(bytes), None);
        assert!(matches!(result, Err(DiskCacheError::HeaderInvalid(_))));
    }

    #[test]
    fn test_cache_version_mismatch() {
        let bytes = encode(&sample_records(), Some(1));
        let result = read_journal(Cursor::new(bytes), Some(2));
        assert!(matches!(result, Err(DiskCacheError::HeaderInvalid(_))));
    }

    #[test]
    fn test_versioned_journal_rejected_without_version() {
        // These version bytes also parse as two READ("") records
        let bytes = encode(&sample_records(), Some(0x0500_0500));
        assert_eq!(bytes[8], FORMAT_VERSION_VERSIONED);
        let result = read_journal(Cursor::new(bytes), None);
        assert!(matches!(result, Err(DiskCacheError::HeaderInvalid(_))));
    }

    #[test]
    fn test_unversioned_journal_rejected_with_version() {
        let bytes = encode(&sample_records(), None);
        let result = read_journal(Cursor::new(bytes), Some(0));
        assert!(matches!(result, Err(DiskCacheError::HeaderInvalid(_))));
    }

    #[test]
    fn test_zero_cache_version_round_trips() {
        let bytes = encode(&sample_records(), Some(0));
        let state = read_journal(Cursor::new(bytes), Some(0)).unwrap();
        assert_eq!(state.clean_keys(), vec!["a", "c"]);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut bytes = encode(&sample_records(), None);
        bytes.extend_from_slice(&[9, 1, b'z']);
        let result = read_journal(Cursor::new(bytes), None);
        assert!(matches!(result, Err(DiskCacheError::OpcodeInvalid(9))));
    }

    #[test]
    fn test_non_utf8_key_is_corrupt() {
        let mut bytes = encode_header(None);
        bytes.extend_from_slice(&[2, 2, 0xff, 0xfe]);
        let result = read_journal(Cursor::new(bytes), None);
        assert!(matches!(result, Err(DiskCacheError::JournalCorrupt(_))));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let mut buf = Vec::new();
        let record = JournalRecord::Clean("k".repeat(MAX_KEY_LEN + 1));
        assert!(matches!(
            record.encode_into(&mut buf),
            Err(DiskCacheError::KeyInvalid(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_compact_bytes_is_minimal() {
        let bytes = compact_bytes(["a", "c"], ["d"], None).unwrap();
        let state = read_journal(Cursor::new(bytes), None).unwrap();
        assert_eq!(state.clean_keys(), vec!["a", "c"]);
        assert_eq!(state.dirty_keys(), vec!["d"]);
        assert_eq!(state.redundant_count(), 1);
    }

    #[test]
    fn test_replace_journal_leaves_only_main() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        let paths = JournalPaths::new(dir.path());

        replace_journal(&fs, &paths, &encode(&sample_records(), None)).unwrap();
        let compacted = compact_bytes(["a", "c"], Vec::<&str>::new(), None).unwrap();
        replace_journal(&fs, &paths, &compacted).unwrap();

        assert!(paths.main.exists());
        assert!(!paths.temp.exists());
        assert!(!paths.backup.exists());
        assert_eq!(std::fs::read(&paths.main).unwrap(), compacted);
    }

    #[test]
    fn test_resolve_promotes_backup() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        let paths = JournalPaths::new(dir.path());
        let content = encode(&sample_records(), None);

        std::fs::write(&paths.backup, &content).unwrap();
        std::fs::write(&paths.temp, b"half written").unwrap();
        resolve_crash_state(&fs, &paths).unwrap();

        assert!(!paths.temp.exists());
        assert!(!paths.backup.exists());
        assert_eq!(std::fs::read(&paths.main).unwrap(), content);
    }

    #[test]
    fn test_resolve_discards_stale_backup() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        let paths = JournalPaths::new(dir.path());

        std::fs::write(&paths.main, b"main").unwrap();
        std::fs::write(&paths.backup, b"backup").unwrap();
        resolve_crash_state(&fs, &paths).unwrap();

        assert!(!paths.backup.exists());
        assert_eq!(std::fs::read(&paths.main).unwrap(), b"main");
    }

    #[test]
    fn test_writer_appends_after_header() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        let paths = JournalPaths::new(dir.path());
        replace_journal(&fs, &paths, &encode_header(Some(3))).unwrap();

        let mut writer = JournalWriter::open(&fs, &paths.main).unwrap();
        writer.append(&sample_records(), true).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let file = std::fs::File::open(&paths.main).unwrap();
        let state = read_journal(file, Some(3)).unwrap();
        assert_eq!(state.clean_keys(), vec!["a", "c"]);
    }
}
