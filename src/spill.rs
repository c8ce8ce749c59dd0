//! Append-only, content-addressed byte store for intermediate values.
//!
//! A [`SpillStore`] backs exactly one stage. Values are appended as
//! self-delimited records (`u32` little-endian length prefix + payload) so
//! that a reader can seek to any previously-returned offset and decode
//! exactly one value without consulting an index. The writer is owned by the
//! coordinator; readers (including ones used from worker threads) open their
//! own read-only file handle, so concurrent reads never contend with the
//! writer or each other.

use crate::digest::ContentDigest;
use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static SPILL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_spill_path(dir: &Path) -> PathBuf {
    let n = SPILL_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("mapresults-{}-{}.pkl", std::process::id(), n))
}

/// A byte offset into a [`SpillStore`]'s backing file.
pub type Offset = u64;

/// Append-only spill file for one stage's worth of intermediate values.
///
/// Created at the start of a non-terminal stage, unlinked once the next
/// stage has fully consumed it: at most two stores exist on disk at once.
pub struct SpillStore {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
    discarded: bool,
}

impl SpillStore {
    /// Creates a new, empty spill file inside `dir`.
    pub fn create_in(dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(dir).map_err(|source| EngineError::SpillIo {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = unique_spill_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| EngineError::SpillIo {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            len: 0,
            discarded: false,
        })
    }

    /// Appends a record, returning the offset it was written at.
    pub fn append(&mut self, bytes: &[u8]) -> EngineResult<Offset> {
        let offset = self.len;
        let prefix = (bytes.len() as u32).to_le_bytes();
        self.writer
            .write_all(&prefix)
            .and_then(|_| self.writer.write_all(bytes))
            .map_err(|source| EngineError::SpillIo {
                path: self.path.clone(),
                source,
            })?;
        self.len += 4 + bytes.len() as u64;
        Ok(offset)
    }

    /// Flushes buffered writes and hands back a handle readers can clone
    /// freely; each [`SpillReader`] opens its own file descriptor.
    pub fn reader(&mut self) -> EngineResult<SpillReader> {
        self.flush()?;
        Ok(SpillReader {
            path: Arc::new(self.path.clone()),
        })
    }

    /// Flushes and seals the store for writing. Idempotent.
    pub fn close(&mut self) -> EngineResult<()> {
        self.flush()
    }

    fn flush(&mut self) -> EngineResult<()> {
        self.writer.flush().map_err(|source| EngineError::SpillIo {
            path: self.path.clone(),
            source,
        })
    }

    /// Total bytes written so far (framing included).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncates the backing file to zero and unlinks it. Consumes the
    /// store so a discarded spill can't be appended to afterwards.
    pub fn discard(mut self) -> EngineResult<()> {
        self.discard_inner()
    }

    fn discard_inner(&mut self) -> EngineResult<()> {
        if self.discarded {
            return Ok(());
        }
        self.flush()?;
        self.writer
            .get_ref()
            .set_len(0)
            .map_err(|source| EngineError::SpillIo {
                path: self.path.clone(),
                source,
            })?;
        std::fs::remove_file(&self.path).map_err(|source| EngineError::SpillIo {
            path: self.path.clone(),
            source,
        })?;
        self.discarded = true;
        Ok(())
    }
}

impl Drop for SpillStore {
    fn drop(&mut self) {
        // Best-effort: a panic unwinding through a stage must not leak the
        // temp file. Errors here are not actionable from a destructor.
        let _ = self.discard_inner();
    }
}

/// A cheap, cloneable handle for reading a sealed or in-progress
/// [`SpillStore`] by offset. Safe to hand to worker threads.
#[derive(Clone)]
pub struct SpillReader {
    path: Arc<PathBuf>,
}

impl SpillReader {
    /// Reads the record written at `offset`, returning its raw bytes.
    pub fn read(&self, offset: Offset) -> EngineResult<Vec<u8>> {
        let mut file = File::open(&*self.path).map_err(|source| EngineError::SpillIo {
            path: (*self.path).clone(),
            source,
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| EngineError::SpillIo {
                path: (*self.path).clone(),
                source,
            })?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)
            .map_err(|source| EngineError::SpillIo {
                path: (*self.path).clone(),
                source,
            })?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|source| EngineError::SpillIo {
                path: (*self.path).clone(),
                source,
            })?;
        Ok(buf)
    }
}

/// Maps a content digest to the offset its payload was first written at,
/// scoped to a single stage: digests from earlier stages never leak in.
#[derive(Default)]
pub struct DedupTable {
    table: HashMap<ContentDigest, Offset>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn get(&self, digest: &ContentDigest) -> Option<Offset> {
        self.table.get(digest).copied()
    }

    pub fn insert(&mut self, digest: ContentDigest, offset: Offset) {
        self.table.insert(digest, offset);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillStore::create_in(dir.path()).unwrap();
        let o1 = store.append(b"hello").unwrap();
        let o2 = store.append(b"world!").unwrap();
        let reader = store.reader().unwrap();
        assert_eq!(reader.read(o1).unwrap(), b"hello");
        assert_eq!(reader.read(o2).unwrap(), b"world!");
    }

    #[test]
    fn offsets_never_move_once_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillStore::create_in(dir.path()).unwrap();
        let o1 = store.append(b"a").unwrap();
        let reader = store.reader().unwrap();
        let _ = store.append(b"bbbbb").unwrap();
        assert_eq!(reader.read(o1).unwrap(), b"a");
    }

    #[test]
    fn discard_unlinks_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillStore::create_in(dir.path()).unwrap();
        store.append(b"x").unwrap();
        let path = store.path().to_path_buf();
        store.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn dropping_without_discard_still_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut store = SpillStore::create_in(dir.path()).unwrap();
            store.append(b"x").unwrap();
            path = store.path().to_path_buf();
        }
        assert!(!path.exists());
    }

    #[test]
    fn dedup_table_shares_offset_for_equal_digests() {
        let mut table = DedupTable::new();
        let d = crate::digest::digest(b"payload");
        table.insert(d, 42);
        assert_eq!(table.get(&d), Some(42));
        assert_eq!(table.get(&crate::digest::digest(b"other")), None);
    }
}
