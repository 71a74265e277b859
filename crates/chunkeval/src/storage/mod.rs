//! Storage backends for one-dimensional float datasets.
//!
//! Three backends share the [`Storage`] / [`Dataset`] interface:
//!
//! - [`MemoryStorage`]: plain heap buffers
//! - [`FlatFileStorage`]: one raw file per dataset, memory mapped
//! - [`ChunkedStorage`]: one container file holding compressed, fixed-size chunks
//!
//! A [`Dataset`] handle owns its OS resources (file descriptors, mappings,
//! advisory locks). [`Dataset::close`] flushes and releases them; dropping a
//! handle without closing releases them on a best-effort basis.
//!
//! File-backed handles hold an exclusive advisory lock on their file, so a
//! second handle for the same path fails with [`ChunkError::Storage`] until the
//! first one is released.

pub mod chunked;
pub mod flat;
pub mod memory;

pub use chunked::{default_chunk_len, ChunkedOptions, ChunkedStorage};
pub use flat::FlatFileStorage;
pub use memory::MemoryStorage;

use crate::codec::Compression;
use crate::error::{ChunkError, Result};
use crate::plan::ChunkRange;
use fs2::FileExt;
use std::fmt;
use std::fs::File;
use std::path::Path;

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DType {
    /// IEEE 754 double precision.
    #[default]
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            DType::Float64 => std::mem::size_of::<f64>(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Float64 => f.write_str("f8"),
        }
    }
}

/// How data is forced to stable storage when a file-backed handle closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Flush data and metadata (default).
    #[default]
    Fsync,
    /// Flush data only, skipping the metadata update.
    Fdatasync,
    /// Leave flushing to the OS (fastest, for tests).
    None,
}

impl SyncMode {
    /// Applies the sync mode to an open file.
    pub fn apply(self, file: &File) -> std::io::Result<()> {
        match self {
            SyncMode::Fsync => file.sync_all(),
            SyncMode::Fdatasync => file.sync_data(),
            SyncMode::None => Ok(()),
        }
    }
}

/// Storage medium of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Heap buffers.
    Memory,
    /// Memory-mapped flat files.
    FlatFile,
    /// Compressed chunked container.
    Chunked,
}

impl StorageKind {
    /// Returns true if the backend writes to disk.
    pub fn is_file_backed(self) -> bool {
        !matches!(self, StorageKind::Memory)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Memory => "in-memory",
            StorageKind::FlatFile => "flat-file",
            StorageKind::Chunked => "chunked",
        })
    }
}

/// An open handle to a named, fixed-length dataset.
pub trait Dataset {
    /// Dataset name.
    fn name(&self) -> &str;

    /// Number of elements. Never changes after creation.
    fn len(&self) -> usize;

    /// Returns true if the dataset holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type.
    fn dtype(&self) -> DType {
        DType::Float64
    }

    /// Writes `values` at `range`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Range`] if `range` is empty or not within
    /// `[0, len)`, and [`ChunkError::LengthMismatch`] if `values` does not
    /// have `range.len()` elements.
    fn write_range(&mut self, range: ChunkRange, values: &[f64]) -> Result<()>;

    /// Reads the values at `range` into `out`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Dataset::write_range`].
    fn read_range_into(&mut self, range: ChunkRange, out: &mut [f64]) -> Result<()>;

    /// Reads the values at `range` into a new vector.
    fn read_range(&mut self, range: ChunkRange) -> Result<Vec<f64>> {
        let mut out = vec![0.0; range.len()];
        self.read_range_into(range, &mut out)?;
        Ok(out)
    }

    /// Bytes the backing medium holds for this dataset's values.
    ///
    /// Datasets sharing a container report their encoded chunks only. The
    /// container's own header and directory count toward
    /// [`Storage::size_bytes`].
    fn size_bytes(&self) -> Result<u64>;

    /// Flushes pending writes and releases every resource held by the handle.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A storage medium that creates and reopens datasets.
pub trait Storage {
    /// Storage medium.
    fn kind(&self) -> StorageKind;

    /// Allocates a new zero-filled dataset, replacing any previous one of the
    /// same name.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Storage`] if the medium cannot be allocated, is
    /// still held by an unreleased handle, or needs an unsupported codec.
    fn create(&mut self, name: &str, len: usize, dtype: DType) -> Result<Box<dyn Dataset>>;

    /// Reopens a dataset created earlier on this storage.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::DatasetNotFound`] if no such dataset exists.
    fn open(&mut self, name: &str) -> Result<Box<dyn Dataset>>;

    /// Total bytes consumed by every dataset of this storage.
    fn size_bytes(&self) -> Result<u64>;

    /// Compression applied to new datasets, if the medium compresses.
    fn compression(&self) -> Option<Compression> {
        None
    }
}

/// Validates a range and buffer length against a dataset length.
pub(crate) fn check_access(range: ChunkRange, len: usize, buf_len: usize) -> Result<()> {
    range.check_within(len)?;
    if range.len() != buf_len {
        return Err(ChunkError::LengthMismatch {
            expected: range.len(),
            actual: buf_len,
        });
    }
    Ok(())
}

/// Takes the exclusive advisory lock guarding `path`.
pub(crate) fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    FileExt::try_lock_exclusive(file).map_err(|e| {
        ChunkError::storage(
            path,
            format!("file is still held by an unreleased handle ({e})"),
        )
    })
}

/// Releases the advisory lock taken by [`lock_exclusive`].
pub(crate) fn unlock(file: &File) -> std::io::Result<()> {
    FileExt::unlock(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype() {
        assert_eq!(DType::Float64.item_size(), 8);
        assert_eq!(DType::default().to_string(), "f8");
    }

    #[test]
    fn test_check_access() {
        assert!(check_access(ChunkRange::new(0, 4), 4, 4).is_ok());
        assert!(matches!(
            check_access(ChunkRange::new(0, 5), 4, 5),
            Err(ChunkError::Range { .. })
        ));
        assert!(matches!(
            check_access(ChunkRange::new(0, 4), 4, 3),
            Err(ChunkError::LengthMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_storage_kind() {
        assert!(!StorageKind::Memory.is_file_backed());
        assert!(StorageKind::FlatFile.is_file_backed());
        assert_eq!(StorageKind::Chunked.to_string(), "chunked");
    }

    #[test]
    fn test_sync_mode_default() {
        assert_eq!(SyncMode::default(), SyncMode::Fsync);
    }
}
