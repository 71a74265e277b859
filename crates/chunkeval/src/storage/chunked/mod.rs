//! Compressed chunked container storage.
//!
//! All datasets of a [`ChunkedStorage`] live in one container file (see
//! [`format`]). Every dataset is split into fixed-size chunks that are
//! compressed independently with the storage's [`Compression`].
//!
//! The first handle created on a storage recreates the file; later handles,
//! once the earlier ones are closed, reopen it in update mode. The directory
//! and footer are rewritten when the last open handle closes.
//!
//! A rewritten chunk reuses its old slot when the new encoding fits and is
//! appended otherwise. Live blocks are packed back together once dead bytes
//! outweigh live ones, and whenever the container closes with dead bytes.
//!
//! Each handle caches one decoded chunk. Writes that do not line up with
//! chunk boundaries go through that cache, so the backend accepts any
//! in-bounds range while holding at most one chunk per handle in memory.

pub mod format;

use super::{check_access, lock_exclusive, unlock, DType, Dataset, Storage, StorageKind, SyncMode};
use crate::codec::Compression;
use crate::error::{ChunkError, Result};
use crate::plan::ChunkRange;
use format::{
    ChunkEntry, ContainerFooter, ContainerHeader, DatasetMeta, Directory, FOOTER_SIZE, HEADER_SIZE,
};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Smallest chunk size picked by [`default_chunk_len`], in bytes.
const MIN_CHUNK_BYTES: usize = 16 * 1024;

/// Largest chunk size picked by [`default_chunk_len`], in bytes.
const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Picks a chunk length for a dataset of `len` doubles.
///
/// The chunk grows with the dataset, about 1/1024 of its size rounded to a
/// power of two, clamped to `[16 KiB, 1 MiB]`.
pub fn default_chunk_len(len: usize) -> usize {
    let item_size = DType::Float64.item_size();
    let target = (len.saturating_mul(item_size) / 1024)
        .next_power_of_two()
        .clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES);
    (target / item_size).min(len).max(1)
}

/// Options for a chunked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedOptions {
    /// Codec and level applied to every chunk.
    pub compression: Compression,
    /// Elements per chunk, or `None` for [`default_chunk_len`].
    pub chunk_len: Option<usize>,
    /// Byte-shuffle elements before general purpose codecs.
    pub shuffle: bool,
    /// How data is flushed when the container closes.
    pub sync_mode: SyncMode,
}

impl Default for ChunkedOptions {
    fn default() -> Self {
        Self {
            compression: Compression::none(),
            chunk_len: None,
            shuffle: true,
            sync_mode: SyncMode::default(),
        }
    }
}

impl ChunkedOptions {
    /// Creates options with the given compression and defaults otherwise.
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            ..Self::default()
        }
    }

    /// Sets a fixed chunk length.
    pub fn with_chunk_len(mut self, chunk_len: Option<usize>) -> Self {
        self.chunk_len = chunk_len;
        self
    }

    /// Enables or disables the shuffle filter.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// Open container file shared by the handles of one storage.
struct Container {
    path: PathBuf,
    file: File,
    directory: Directory,
    /// Offset where the next chunk block is appended.
    append_pos: u64,
    /// Bytes below `append_pos` that no directory entry refers to.
    dead_bytes: u64,
    open: HashSet<String>,
    sync_mode: SyncMode,
    finished: bool,
}

impl Container {
    /// Creates (or truncates) the container file.
    fn create(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let io = |e: io::Error| ChunkError::storage(path, e);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io)?;
        lock_exclusive(&file, path)?;
        file.set_len(0).map_err(io)?;

        let mut header = Vec::with_capacity(HEADER_SIZE);
        ContainerHeader::default().write_to(&mut header)?;
        write_at(&file, 0, &header).map_err(io)?;

        debug!(path = %path.display(), "created chunked container");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            directory: Directory::new(),
            append_pos: HEADER_SIZE as u64,
            dead_bytes: 0,
            open: HashSet::new(),
            sync_mode,
            finished: false,
        })
    }

    /// Reopens an existing container in update mode.
    fn open(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let io = |e: io::Error| ChunkError::storage(path, e);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io)?;
        lock_exclusive(&file, path)?;

        let file_len = file.metadata().map_err(io)?.len();
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(ChunkError::storage(path, "file too short for a container"));
        }

        let mut reader = &file;
        reader.seek(SeekFrom::Start(0)).map_err(io)?;
        ContainerHeader::read_from(&mut reader).map_err(|e| e.at_path(path))?;

        reader
            .seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))
            .map_err(io)?;
        let footer = ContainerFooter::read_from(&mut reader).map_err(|e| e.at_path(path))?;
        if footer.directory_offset < HEADER_SIZE as u64
            || footer.directory_offset + footer.directory_size + FOOTER_SIZE as u64 != file_len
        {
            return Err(ChunkError::storage(path, "footer does not match file size"));
        }

        let mut directory_bytes = vec![0u8; footer.directory_size as usize];
        read_at(&file, footer.directory_offset, &mut directory_bytes).map_err(io)?;
        let directory = Directory::from_bytes(&directory_bytes, &footer)?;
        let dead_bytes = (footer.directory_offset - HEADER_SIZE as u64)
            .saturating_sub(directory.stored_bytes());

        debug!(
            path = %path.display(),
            datasets = directory.len(),
            dead_bytes,
            "reopened chunked container"
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            directory,
            // New blocks overwrite the old directory; it is rewritten on close.
            append_pos: footer.directory_offset,
            dead_bytes,
            open: HashSet::new(),
            sync_mode,
            finished: false,
        })
    }

    /// Registers a new dataset record. Blocks of a record it replaces are dead.
    fn insert(&mut self, meta: DatasetMeta) {
        if let Some(old) = self.directory.insert(meta) {
            self.dead_bytes += old.stored_bytes();
        }
    }

    /// Stores the encoded bytes of chunk `index` of dataset `name`.
    ///
    /// The block is rewritten in place when it fits the slot of the block it
    /// replaces, and appended otherwise. The file is compacted once dead
    /// bytes outweigh live ones.
    fn replace_chunk(&mut self, name: &str, index: usize, bytes: &[u8]) -> Result<()> {
        let size = u32::try_from(bytes.len()).map_err(|_| {
            ChunkError::CompressionError(format!("chunk of {} bytes is too large", bytes.len()))
        })?;
        let previous = self
            .directory
            .get(name)
            .and_then(|meta| meta.chunks.get(index).copied())
            .ok_or_else(|| ChunkError::DatasetNotFound(name.to_string()))?;

        let in_place = previous.is_written() && size <= previous.size;
        let offset = if in_place {
            previous.offset
        } else {
            self.append_pos
        };
        write_at(&self.file, offset, bytes).map_err(|e| ChunkError::storage(&self.path, e))?;

        if in_place {
            self.dead_bytes += u64::from(previous.size - size);
        } else {
            if previous.is_written() {
                self.dead_bytes += u64::from(previous.size);
            }
            self.append_pos += u64::from(size);
        }

        let entry = ChunkEntry {
            offset,
            size,
            crc32: crc32fast::hash(bytes),
        };
        if let Some(slot) = self
            .directory
            .get_mut(name)
            .and_then(|meta| meta.chunks.get_mut(index))
        {
            *slot = entry;
        }

        if self.dead_bytes > self.directory.stored_bytes() {
            self.compact()?;
        }
        Ok(())
    }

    fn read_block(&self, entry: &ChunkEntry) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; entry.size as usize];
        read_at(&self.file, entry.offset, &mut bytes)
            .map_err(|e| ChunkError::storage(&self.path, e))?;

        let actual = crc32fast::hash(&bytes);
        if actual != entry.crc32 {
            return Err(ChunkError::ChecksumMismatch {
                expected: entry.crc32,
                actual,
            });
        }
        Ok(bytes)
    }

    /// Moves every live block down so the blocks sit back to back after the
    /// header, then appends continue from the end of the last one.
    fn compact(&mut self) -> Result<()> {
        let before = self.append_pos;
        let mut entries: Vec<&mut ChunkEntry> = self
            .directory
            .iter_mut()
            .flat_map(|meta| meta.chunks.iter_mut())
            .filter(|entry| entry.is_written())
            .collect();
        entries.sort_unstable_by_key(|entry| entry.offset);

        let mut cursor = HEADER_SIZE as u64;
        let mut buf = Vec::new();
        for entry in entries {
            if entry.offset != cursor {
                buf.resize(entry.size as usize, 0);
                read_at(&self.file, entry.offset, &mut buf)
                    .and_then(|_| write_at(&self.file, cursor, &buf))
                    .map_err(|e| ChunkError::storage(&self.path, e))?;
                entry.offset = cursor;
            }
            cursor += u64::from(entry.size);
        }

        self.append_pos = cursor;
        self.dead_bytes = 0;
        debug!(
            path = %self.path.display(),
            reclaimed = before - cursor,
            "compacted chunked container"
        );
        Ok(())
    }

    /// Writes the directory and footer, syncs and unlocks the file.
    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let written = self.write_tail();
        let unlocked = unlock(&self.file);

        let bytes = written?;
        debug!(path = %self.path.display(), bytes, "closed chunked container");
        unlocked.map_err(|e| ChunkError::storage(&self.path, e))
    }

    /// Packs the blocks and writes directory and footer after them.
    /// Returns the final file length.
    fn write_tail(&mut self) -> Result<u64> {
        if self.dead_bytes > 0 {
            self.compact()?;
        }

        let directory = self.directory.to_bytes()?;
        let footer = ContainerFooter::new(self.append_pos, &directory, self.directory.len() as u32);
        let mut tail = Vec::with_capacity(directory.len() + FOOTER_SIZE);
        tail.extend_from_slice(&directory);
        footer.write_to(&mut tail)?;

        let io = |e: io::Error| ChunkError::storage(&self.path, e);
        let file_len = self.append_pos + tail.len() as u64;
        write_at(&self.file, self.append_pos, &tail).map_err(io)?;
        self.file.set_len(file_len).map_err(io)?;
        self.sync_mode.apply(&self.file).map_err(io)?;
        Ok(file_len)
    }
}

fn write_at(mut file: &File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

fn read_at(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// Names the codec in storage errors of a compressed container.
fn tag_codec(compression: Compression, e: ChunkError) -> ChunkError {
    if compression.is_none() {
        e
    } else {
        e.with_codec(compression.codec().name())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), error = %e, "failed to finish container");
        }
    }
}

/// Storage keeping compressed chunked datasets in a single container file.
pub struct ChunkedStorage {
    path: PathBuf,
    options: ChunkedOptions,
    container: Weak<RefCell<Container>>,
    created: bool,
}

impl ChunkedStorage {
    /// Creates a storage for the container at `path`.
    ///
    /// Nothing touches the disk until the first dataset is created.
    pub fn new(path: impl AsRef<Path>, options: ChunkedOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            container: Weak::new(),
            created: false,
        }
    }

    /// Creates a storage over an existing container, reopening it in update mode.
    pub fn open_existing(path: impl AsRef<Path>, options: ChunkedOptions) -> Self {
        Self {
            created: true,
            ..Self::new(path, options)
        }
    }

    /// Path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Storage options.
    pub fn options(&self) -> &ChunkedOptions {
        &self.options
    }

    fn acquire(&mut self) -> Result<Rc<RefCell<Container>>> {
        if let Some(container) = self.container.upgrade() {
            return Ok(container);
        }
        let container = if self.created {
            Container::open(&self.path, self.options.sync_mode)?
        } else {
            let container = Container::create(&self.path, self.options.sync_mode)?;
            self.created = true;
            container
        };
        let container = Rc::new(RefCell::new(container));
        self.container = Rc::downgrade(&container);
        Ok(container)
    }

    fn handle(container: Rc<RefCell<Container>>, meta: &DatasetMeta) -> Box<dyn Dataset> {
        Box::new(ChunkedDataset {
            name: meta.name.clone(),
            len: meta.len as usize,
            chunk_len: meta.chunk_len as usize,
            compression: meta.compression,
            shuffle: meta.shuffle,
            container,
            cache: None,
            released: false,
        })
    }
}

impl Storage for ChunkedStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Chunked
    }

    fn create(&mut self, name: &str, len: usize, _dtype: DType) -> Result<Box<dyn Dataset>> {
        let compression = self.options.compression;
        if !compression.is_none() && !compression.codec().is_available() {
            return Err(tag_codec(
                compression,
                ChunkError::storage(&self.path, "codec is not available in this build"),
            ));
        }

        let container = self.acquire().map_err(|e| tag_codec(compression, e))?;
        let meta = {
            let mut inner = container.borrow_mut();
            if inner.open.contains(name) {
                return Err(ChunkError::DatasetBusy(name.to_string()));
            }
            let chunk_len = self
                .options
                .chunk_len
                .unwrap_or_else(|| default_chunk_len(len));
            let meta = DatasetMeta::new(name, len, chunk_len, compression, self.options.shuffle);
            inner.insert(meta.clone());
            inner.open.insert(name.to_string());
            meta
        };
        debug!(
            name,
            len,
            chunk_len = meta.chunk_len,
            compression = %compression,
            "created chunked dataset"
        );
        Ok(Self::handle(container, &meta))
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn Dataset>> {
        if !self.created {
            return Err(ChunkError::DatasetNotFound(name.to_string()));
        }
        let compression = self.options.compression;
        let container = self.acquire().map_err(|e| tag_codec(compression, e))?;
        let meta = {
            let mut inner = container.borrow_mut();
            if inner.open.contains(name) {
                return Err(ChunkError::DatasetBusy(name.to_string()));
            }
            let meta = inner
                .directory
                .get(name)
                .cloned()
                .ok_or_else(|| ChunkError::DatasetNotFound(name.to_string()))?;
            inner.open.insert(name.to_string());
            meta
        };
        Ok(Self::handle(container, &meta))
    }

    fn size_bytes(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(ChunkError::storage(&self.path, e)),
        }
    }

    fn compression(&self) -> Option<Compression> {
        Some(self.options.compression)
    }
}

/// One decoded chunk held by a handle.
struct ChunkCache {
    index: usize,
    values: Vec<f64>,
    dirty: bool,
}

/// Handle to one dataset inside a chunked container.
pub struct ChunkedDataset {
    name: String,
    len: usize,
    chunk_len: usize,
    compression: Compression,
    shuffle: bool,
    container: Rc<RefCell<Container>>,
    cache: Option<ChunkCache>,
    released: bool,
}

impl ChunkedDataset {
    /// Elements per chunk.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    fn chunk_bounds(&self, index: usize) -> (usize, usize) {
        let start = index * self.chunk_len;
        (start, (start + self.chunk_len).min(self.len))
    }

    /// Encodes and stores the cached chunk if it has unsaved changes.
    fn flush_cache(&mut self) -> Result<()> {
        let Some(cache) = self.cache.as_mut() else {
            return Ok(());
        };
        if !cache.dirty {
            return Ok(());
        }
        let bytes = self.compression.compress(&cache.values, self.shuffle)?;
        self.container
            .borrow_mut()
            .replace_chunk(&self.name, cache.index, &bytes)
            .map_err(|e| tag_codec(self.compression, e))?;
        cache.dirty = false;
        Ok(())
    }

    /// Makes chunk `index` the cached chunk.
    ///
    /// When `overwrite` is set the caller replaces every element, so the
    /// stored chunk is not decoded.
    fn load_chunk(&mut self, index: usize, overwrite: bool) -> Result<&mut ChunkCache> {
        if self.cache.as_ref().map(|c| c.index) != Some(index) {
            self.flush_cache()?;
            let (start, end) = self.chunk_bounds(index);
            let mut values = vec![0.0; end - start];
            if !overwrite {
                let container = self.container.borrow();
                let entry = container
                    .directory
                    .get(&self.name)
                    .and_then(|meta| meta.chunks.get(index).copied())
                    .unwrap_or_default();
                if entry.is_written() {
                    let bytes = container
                        .read_block(&entry)
                        .map_err(|e| tag_codec(self.compression, e))?;
                    self.compression
                        .decompress(&bytes, self.shuffle, &mut values)?;
                }
            }
            self.cache = Some(ChunkCache {
                index,
                values,
                dirty: false,
            });
        }
        self.cache
            .as_mut()
            .ok_or_else(|| ChunkError::DatasetNotFound(self.name.clone()))
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let flushed = self.flush_cache();
        self.cache = None;

        let mut container = self.container.borrow_mut();
        container.open.remove(&self.name);
        let finished = if container.open.is_empty() {
            container
                .finish()
                .map_err(|e| tag_codec(self.compression, e))
        } else {
            Ok(())
        };
        flushed.and(finished)
    }
}

impl Dataset for ChunkedDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.len
    }

    fn write_range(&mut self, range: ChunkRange, values: &[f64]) -> Result<()> {
        check_access(range, self.len, values.len())?;
        let first = range.start / self.chunk_len;
        let last = (range.end - 1) / self.chunk_len;

        for index in first..=last {
            let (chunk_start, chunk_end) = self.chunk_bounds(index);
            let start = range.start.max(chunk_start);
            let end = range.end.min(chunk_end);
            let overwrite = start == chunk_start && end == chunk_end;

            let cache = self.load_chunk(index, overwrite)?;
            cache.values[start - chunk_start..end - chunk_start]
                .copy_from_slice(&values[start - range.start..end - range.start]);
            cache.dirty = true;
        }
        Ok(())
    }

    fn read_range_into(&mut self, range: ChunkRange, out: &mut [f64]) -> Result<()> {
        check_access(range, self.len, out.len())?;
        let first = range.start / self.chunk_len;
        let last = (range.end - 1) / self.chunk_len;

        for index in first..=last {
            let (chunk_start, chunk_end) = self.chunk_bounds(index);
            let start = range.start.max(chunk_start);
            let end = range.end.min(chunk_end);

            let cache = self.load_chunk(index, false)?;
            out[start - range.start..end - range.start]
                .copy_from_slice(&cache.values[start - chunk_start..end - chunk_start]);
        }
        Ok(())
    }

    /// Encoded bytes of this dataset's chunks.
    fn size_bytes(&self) -> Result<u64> {
        let container = self.container.borrow();
        Ok(container
            .directory
            .get(&self.name)
            .map(DatasetMeta::stored_bytes)
            .unwrap_or(0))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release()
    }
}

impl Drop for ChunkedDataset {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(name = %self.name, error = %e, "failed to release chunked dataset");
        }
    }
}
