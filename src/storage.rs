//! Secondary storage for paged-out blocks and message queues.
//!
//! [`ExternalStorage::put`] persists a buffer and returns a handle;
//! [`ExternalStorage::get`] reads it back and consumes the record, so a handle
//! is good for exactly one `get`. [`ExternalStorage::destroy`] discards a record
//! and is a no-op for handles that were already consumed.

use crate::block_error::BlockError;
use crate::serialization::MemoryBuffer;
use crate::types::StorageHandle;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Out-of-core backend shared by every block of a worker.
pub trait ExternalStorage: Send + Sync {
    /// Persist the contents of `buf`; on success `buf` is left empty.
    fn put(&self, buf: &mut MemoryBuffer) -> Result<StorageHandle, BlockError>;
    /// Replace the contents of `buf` with the record behind `handle` and drop the record.
    ///
    /// `extra` reserves additional capacity for appends that follow the load.
    fn get(
        &self,
        handle: StorageHandle,
        buf: &mut MemoryBuffer,
        extra: usize,
    ) -> Result<(), BlockError>;
    /// Discard a record without reading it.
    fn destroy(&self, handle: StorageHandle);
}

const RECORD_PREFIX: &str = "parablock.";

#[derive(Clone, Debug)]
struct FileRecord {
    path: PathBuf,
    size: usize,
}

/// One temporary file per record, spread over candidate directories.
#[derive(Debug)]
pub struct FileStorage {
    directories: Vec<PathBuf>,
    records: Mutex<HashMap<StorageHandle, FileRecord>>,
    next: AtomicU64,
    current_size: AtomicU64,
    max_size: AtomicU64,
    picker: Mutex<SmallRng>,
}

impl FileStorage {
    /// Store records under the system temporary directory.
    pub fn new() -> Self {
        Self::with_directories(vec![std::env::temp_dir()])
    }

    /// Store records in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::with_directories(vec![dir.as_ref().to_path_buf()])
    }

    /// Balance records across several directories (e.g. several local disks).
    pub fn with_directories(directories: Vec<PathBuf>) -> Self {
        let directories = if directories.is_empty() {
            vec![std::env::temp_dir()]
        } else {
            directories
        };
        Self {
            directories,
            records: Mutex::new(HashMap::new()),
            next: AtomicU64::new(0),
            current_size: AtomicU64::new(0),
            max_size: AtomicU64::new(0),
            picker: Mutex::new(SmallRng::seed_from_u64(0x5eed)),
        }
    }

    /// Reseed the directory picker for reproducible placement.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.picker.lock() = SmallRng::seed_from_u64(seed);
        self
    }

    /// Bytes currently held on disk.
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// High-water mark of [`current_size`](Self::current_size).
    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pick_directory(&self) -> &Path {
        let n = self.directories.len();
        let i = if n == 1 {
            0
        } else {
            self.picker.lock().gen_range(0..n)
        };
        &self.directories[i]
    }

    fn forget(&self, handle: StorageHandle) -> Option<FileRecord> {
        let record = self.records.lock().remove(&handle)?;
        self.current_size
            .fetch_sub(record.size as u64, Ordering::Relaxed);
        Some(record)
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalStorage for FileStorage {
    fn put(&self, buf: &mut MemoryBuffer) -> Result<StorageHandle, BlockError> {
        let dir = self.pick_directory();
        let file = tempfile::Builder::new()
            .prefix(RECORD_PREFIX)
            .tempfile_in(dir)?;
        let (mut file, path) = file.keep().map_err(|e| BlockError::Io(e.error))?;
        if let Err(e) = file.write_all(buf.as_slice()) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        let size = buf.size();
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.records
            .lock()
            .insert(handle, FileRecord { path, size });
        let now = self.current_size.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
        self.max_size.fetch_max(now, Ordering::Relaxed);
        log::trace!("paged out {size} bytes as handle {handle}");
        buf.clear();
        Ok(handle)
    }

    fn get(
        &self,
        handle: StorageHandle,
        buf: &mut MemoryBuffer,
        extra: usize,
    ) -> Result<(), BlockError> {
        let record = self
            .records
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(BlockError::UnknownHandle(handle))?;

        let mut bytes = Vec::with_capacity(record.size + extra);
        File::open(&record.path)?.read_to_end(&mut bytes)?;
        if bytes.len() != record.size {
            log::warn!(
                "storage record {handle} holds {} bytes, expected {}",
                bytes.len(),
                record.size
            );
        }
        *buf = MemoryBuffer::from_vec(bytes);

        self.forget(handle);
        if let Err(e) = fs::remove_file(&record.path) {
            log::warn!("could not remove {}: {e}", record.path.display());
        }
        Ok(())
    }

    fn destroy(&self, handle: StorageHandle) {
        if let Some(record) = self.forget(handle) {
            if let Err(e) = fs::remove_file(&record.path) {
                log::warn!("could not remove {}: {e}", record.path.display());
            }
        }
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        for (_, record) in self.records.get_mut().drain() {
            let _ = fs::remove_file(&record.path);
        }
    }
}
