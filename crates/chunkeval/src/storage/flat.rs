//! Memory-mapped flat file storage.
//!
//! Each dataset is one file of exactly `len * 8` bytes holding native-endian
//! doubles, named `{prefix}-{name}.bin` inside the storage directory.

use super::{check_access, lock_exclusive, unlock, DType, Dataset, Storage, StorageKind, SyncMode};
use crate::error::{ChunkError, Result};
use crate::plan::ChunkRange;
use memmap2::{MmapMut, MmapOptions};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default file name prefix.
pub const DEFAULT_PREFIX: &str = "flat.memmap";

const ITEM_SIZE: usize = std::mem::size_of::<f64>();

/// Storage writing each dataset to its own memory-mapped file.
#[derive(Debug)]
pub struct FlatFileStorage {
    dir: PathBuf,
    prefix: String,
    sync_mode: SyncMode,
    files: BTreeSet<PathBuf>,
}

impl FlatFileStorage {
    /// Creates a storage rooted at `dir`, which is created if missing.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| ChunkError::storage(&dir, e))?;
        Ok(Self {
            dir,
            prefix: DEFAULT_PREFIX.to_string(),
            sync_mode: SyncMode::default(),
            files: BTreeSet::new(),
        })
    }

    /// Sets the file name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets how data is flushed on close.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Path of the file backing dataset `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.bin", self.prefix, name))
    }

    /// Paths of every file this storage has created or opened.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    fn map(file: &File, path: &Path, len: usize) -> Result<Option<MmapMut>> {
        if len == 0 {
            return Ok(None);
        }
        // SAFETY: the file is exclusively locked by this handle for the
        // lifetime of the mapping, so no other handle resizes or writes it.
        let mmap = unsafe { MmapOptions::new().len(len * ITEM_SIZE).map_mut(file) }
            .map_err(|e| ChunkError::storage(path, format!("failed to map file: {e}")))?;
        Ok(Some(mmap))
    }
}

impl Storage for FlatFileStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::FlatFile
    }

    fn create(&mut self, name: &str, len: usize, _dtype: DType) -> Result<Box<dyn Dataset>> {
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ChunkError::storage(&path, e))?;

        // Lock before truncating so a live handle's data is never clobbered.
        lock_exclusive(&file, &path)?;

        let byte_len = (len * ITEM_SIZE) as u64;
        file.set_len(0)
            .and_then(|_| file.set_len(byte_len))
            .map_err(|e| ChunkError::storage(&path, e))?;

        let mmap = Self::map(&file, &path, len)?;
        debug!(path = %path.display(), len, "created flat dataset");
        self.files.insert(path.clone());

        Ok(Box::new(FlatDataset {
            name: name.to_string(),
            path,
            file,
            mmap,
            len,
            sync_mode: self.sync_mode,
            released: false,
        }))
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn Dataset>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(ChunkError::DatasetNotFound(name.to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ChunkError::storage(&path, e))?;
        lock_exclusive(&file, &path)?;

        let byte_len = file
            .metadata()
            .map_err(|e| ChunkError::storage(&path, e))?
            .len();
        if byte_len % ITEM_SIZE as u64 != 0 {
            return Err(ChunkError::storage(
                &path,
                format!("file size {byte_len} is not a multiple of {ITEM_SIZE}"),
            ));
        }
        let len = (byte_len / ITEM_SIZE as u64) as usize;
        let mmap = Self::map(&file, &path, len)?;
        debug!(path = %path.display(), len, "opened flat dataset");
        self.files.insert(path.clone());

        Ok(Box::new(FlatDataset {
            name: name.to_string(),
            path,
            file,
            mmap,
            len,
            sync_mode: self.sync_mode,
            released: false,
        }))
    }

    fn size_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for path in &self.files {
            total += fs::metadata(path)
                .map_err(|e| ChunkError::storage(path, e))?
                .len();
        }
        Ok(total)
    }
}

/// Handle to a memory-mapped flat file.
pub struct FlatDataset {
    name: String,
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    len: usize,
    sync_mode: SyncMode,
    released: bool,
}

impl FlatDataset {
    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes_mut(&mut self, range: ChunkRange) -> &mut [u8] {
        match self.mmap.as_mut() {
            Some(mmap) => &mut mmap[range.start * ITEM_SIZE..range.end * ITEM_SIZE],
            None => &mut [],
        }
    }

    fn bytes(&self, range: ChunkRange) -> &[u8] {
        match self.mmap.as_ref() {
            Some(mmap) => &mmap[range.start * ITEM_SIZE..range.end * ITEM_SIZE],
            None => &[],
        }
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let flushed = match (&self.mmap, self.sync_mode) {
            (Some(_), SyncMode::None) => Ok(()),
            (Some(mmap), _) => mmap.flush(),
            (None, _) => Ok(()),
        };
        self.mmap = None;
        let synced = flushed.and_then(|_| self.sync_mode.apply(&self.file));
        let unlocked = unlock(&self.file);

        synced
            .and(unlocked)
            .map_err(|e| ChunkError::storage(&self.path, e))
    }
}

impl Dataset for FlatDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.len
    }

    fn write_range(&mut self, range: ChunkRange, values: &[f64]) -> Result<()> {
        check_access(range, self.len, values.len())?;
        let dst = self.bytes_mut(range);
        for (slot, value) in dst.chunks_exact_mut(ITEM_SIZE).zip(values) {
            slot.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(())
    }

    fn read_range_into(&mut self, range: ChunkRange, out: &mut [f64]) -> Result<()> {
        check_access(range, self.len, out.len())?;
        let src = self.bytes(range);
        for (value, raw) in out.iter_mut().zip(src.chunks_exact(ITEM_SIZE)) {
            let mut buf = [0u8; ITEM_SIZE];
            buf.copy_from_slice(raw);
            *value = f64::from_ne_bytes(buf);
        }
        Ok(())
    }

    fn size_bytes(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| ChunkError::storage(&self.path, e))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release()
    }
}

impl Drop for FlatDataset {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "failed to release flat dataset");
        }
    }
}
