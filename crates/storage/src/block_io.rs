//! Read/write contiguous byte ranges of the backing file.
//!
//! [`FileStore`] is the single-file implementation; [`MultiFileStore`]
//! layers an append-only sequence of files on top of it, where only the
//! highest-numbered ("current") volume accepts writes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;

use crate::error::{Result, StorageError};

/// Counters for bytes and operations moved through a block store, exposed
/// for diagnostics and tests rather than anything the store itself
/// branches on.
#[derive(Debug, Default)]
pub struct IoCounters {
    pub read_bytes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub read_ops: AtomicU64,
    pub write_ops: AtomicU64,
}

impl IoCounters {
    fn record_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: u64) {
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }
}

/// An optional pass-through transform applied to every block read and
/// write. Implementations must preserve byte offsets and lengths exactly
/// so the rest of the store can treat the channel as if it held plaintext.
pub trait EncryptionTransformer: Send + Sync {
    fn encrypt(&self, pos: u64, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, pos: u64, ciphertext: &[u8]) -> Vec<u8>;
}

/// Single backing file, opened either read-write or read-only.
pub struct FileStore {
    file: Mutex<File>,
    path: PathBuf,
    read_only: bool,
    locked: bool,
    counters: IoCounters,
    encryption: Option<Box<dyn EncryptionTransformer>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            read_only,
            locked: false,
            counters: IoCounters::default(),
            encryption: None,
        })
    }

    pub fn with_encryption(mut self, transformer: Box<dyn EncryptionTransformer>) -> Self {
        self.encryption = Some(transformer);
        self
    }

    pub fn get_file_name(&self) -> &Path {
        &self.path
    }

    /// Advisory whole-file lock: shared for read-only stores, exclusive
    /// otherwise. `FileLocked` when another process already holds it.
    pub fn acquire_lock(&mut self) -> Result<()> {
        let file = self.file.lock();
        let result = if self.read_only {
            file.try_lock_shared()
        } else {
            file.try_lock_exclusive()
        };
        result.map_err(|_| StorageError::Locked)?;
        self.locked = true;
        Ok(())
    }

    pub fn release_lock(&mut self) -> Result<()> {
        if self.locked {
            let file = self.file.lock();
            FileExt::unlock(&*file)?;
            self.locked = false;
        }
        Ok(())
    }

    pub fn read_fully(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut buf)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => StorageError::Corrupt(format!(
                        "short read at position {pos}, wanted {len} bytes"
                    )),
                    _ => StorageError::Io(e),
                })?;
        }
        self.counters.record_read(len as u64);
        if let Some(enc) = &self.encryption {
            Ok(enc.decrypt(pos, &buf))
        } else {
            Ok(buf)
        }
    }

    pub fn write_fully(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let payload = if let Some(enc) = &self.encryption {
            enc.encrypt(pos, bytes)
        } else {
            bytes.to_vec()
        };
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&payload)?;
        }
        self.counters.record_write(payload.len() as u64);
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    pub fn counters(&self) -> &IoCounters {
        &self.counters
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.release_lock();
    }
}

/// Append-only sequence of files; only the current (last) volume accepts
/// writes, earlier volumes are opened read-only. A chunk's `volume_id`
/// selects which file its bytes live in.
pub struct MultiFileStore {
    volumes: Vec<FileStore>,
    max_file_count: usize,
    base_path: PathBuf,
}

impl MultiFileStore {
    pub fn open(base_path: impl AsRef<Path>, max_file_count: usize) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let mut volumes = Vec::new();
        let mut idx = 0;
        loop {
            let path = Self::volume_path(&base_path, idx);
            if !path.exists() {
                break;
            }
            let read_only = idx + 1 < Self::discover_count(&base_path);
            volumes.push(FileStore::open(&path, read_only)?);
            idx += 1;
        }
        if volumes.is_empty() {
            volumes.push(FileStore::open(Self::volume_path(&base_path, 0), false)?);
        }
        Ok(Self {
            volumes,
            max_file_count,
            base_path,
        })
    }

    fn discover_count(base_path: &Path) -> usize {
        let mut count = 0;
        while Self::volume_path(base_path, count).exists() {
            count += 1;
        }
        count
    }

    fn volume_path(base_path: &Path, volume_id: usize) -> PathBuf {
        base_path.with_extension(format!("{volume_id}.vol"))
    }

    pub fn current_volume_id(&self) -> u32 {
        (self.volumes.len() - 1) as u32
    }

    pub fn current(&self) -> &FileStore {
        self.volumes.last().expect("at least one volume")
    }

    pub fn volume(&self, volume_id: u32) -> Result<&FileStore> {
        self.volumes
            .get(volume_id as usize)
            .ok_or_else(|| StorageError::Corrupt(format!("no such volume {volume_id}")))
    }

    /// Rolls to a fresh writable volume once the current one grows past a
    /// caller-chosen threshold. The store keeps growing without bound: see
    /// the compaction decision recorded for append-only volumes in the
    /// design ledger.
    pub fn roll_volume(&mut self) -> Result<u32> {
        if self.volumes.len() >= self.max_file_count {
            return Err(StorageError::Internal(format!(
                "maxFileCount {} reached",
                self.max_file_count
            )));
        }
        let next_id = self.volumes.len();
        self.volumes
            .push(FileStore::open(Self::volume_path(&self.base_path, next_id), false)?);
        Ok(next_id as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.db"), false).unwrap();
        store.write_fully(0, b"hello block").unwrap();
        let read = store.read_fully(0, 11).unwrap();
        assert_eq!(&read, b"hello block");
        assert_eq!(store.size().unwrap(), 11);
    }

    #[test]
    fn write_extends_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.db"), false).unwrap();
        store.write_fully(100, b"tail").unwrap();
        assert_eq!(store.size().unwrap(), 104);
    }

    #[test]
    fn short_read_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.db"), false).unwrap();
        store.write_fully(0, b"short").unwrap();
        assert!(matches!(
            store.read_fully(0, 100),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        FileStore::open(&path, false).unwrap();
        let store = FileStore::open(&path, true).unwrap();
        assert!(matches!(
            store.write_fully(0, b"x"),
            Err(StorageError::ReadOnly)
        ));
    }
}
