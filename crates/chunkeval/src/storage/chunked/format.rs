//! Chunked container file format.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  File Header (16 bytes)                                      │
//! │  - Magic: "ACHK" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 10 bytes                                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Chunk Blocks (appended in write order)                      │
//! │  - Encoded chunk bytes, located through the directory        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Dataset Directory                                           │
//! │  - Per dataset: name, length, chunk length, codec, level,    │
//! │    shuffle flag, chunk table (offset, size, CRC32)           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Footer (32 bytes)                                           │
//! │  - Directory offset/size, directory CRC, reverse magic       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. A chunk table entry with offset 0 marks a
//! chunk that was never written; it reads back as zeros.

use crate::codec::{Codec, Compression};
use crate::error::{ChunkError, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Magic bytes for the container header: "ACHK"
pub const CHUNK_MAGIC: [u8; 4] = *b"ACHK";

/// Reverse magic bytes for the container footer: "KHCA"
pub const CHUNK_MAGIC_REVERSE: [u8; 4] = *b"KHCA";

/// Current container format version.
pub const CHUNK_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 32;

/// Container file header (16 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Magic bytes: "ACHK"
    pub magic: [u8; 4],
    /// File format version.
    pub version: u16,
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self {
            magic: CHUNK_MAGIC,
            version: CHUNK_VERSION,
        }
    }
}

impl ContainerHeader {
    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[0u8; 10])?;
        Ok(())
    }

    /// Reads a header from a reader.
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::InvalidMagic` if the magic bytes don't match.
    /// Returns `ChunkError::UnsupportedVersion` if the version is newer than supported.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != CHUNK_MAGIC {
            return Err(ChunkError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > CHUNK_VERSION {
            return Err(ChunkError::UnsupportedVersion(version));
        }

        Ok(Self { magic, version })
    }
}

/// Container file footer (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFooter {
    /// Offset of the dataset directory from file start.
    pub directory_offset: u64,
    /// Size of the dataset directory in bytes.
    pub directory_size: u64,
    /// CRC32 of the directory bytes.
    pub directory_crc32: u32,
    /// Number of datasets in the directory.
    pub dataset_count: u32,
    /// Reverse magic bytes: "KHCA"
    pub magic_reverse: [u8; 4],
}

impl ContainerFooter {
    /// Creates a footer for a directory written at `directory_offset`.
    pub fn new(directory_offset: u64, directory: &[u8], dataset_count: u32) -> Self {
        Self {
            directory_offset,
            directory_size: directory.len() as u64,
            directory_crc32: crc32fast::hash(directory),
            dataset_count,
            magic_reverse: CHUNK_MAGIC_REVERSE,
        }
    }

    /// Writes the footer to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.directory_offset.to_le_bytes())?;
        writer.write_all(&self.directory_size.to_le_bytes())?;
        writer.write_all(&self.directory_crc32.to_le_bytes())?;
        writer.write_all(&self.dataset_count.to_le_bytes())?;
        writer.write_all(&self.magic_reverse)?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads a footer from a reader.
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::InvalidMagic` if the reverse magic bytes don't match.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        let directory_offset = u64::from_le_bytes(take8(&buf[0..8]));
        let directory_size = u64::from_le_bytes(take8(&buf[8..16]));
        let directory_crc32 = u32::from_le_bytes(take4(&buf[16..20]));
        let dataset_count = u32::from_le_bytes(take4(&buf[20..24]));
        let magic_reverse = take4(&buf[24..28]);
        if magic_reverse != CHUNK_MAGIC_REVERSE {
            return Err(ChunkError::InvalidMagic(magic_reverse));
        }

        Ok(Self {
            directory_offset,
            directory_size,
            directory_crc32,
            dataset_count,
            magic_reverse,
        })
    }
}

fn take8(bytes: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    buf
}

fn take4(bytes: &[u8]) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    buf
}

/// Location and checksum of one stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkEntry {
    /// Offset of the chunk bytes from file start, 0 if never written.
    pub offset: u64,
    /// Stored (encoded) size in bytes.
    pub size: u32,
    /// CRC32 of the stored bytes.
    pub crc32: u32,
}

impl ChunkEntry {
    /// Serialized size in bytes.
    pub const SIZE: usize = 16;

    /// Returns true if the chunk has been written.
    pub fn is_written(&self) -> bool {
        self.offset != 0
    }
}

/// Directory record for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetMeta {
    /// Dataset name.
    pub name: String,
    /// Number of elements.
    pub len: u64,
    /// Elements per chunk.
    pub chunk_len: u32,
    /// Compression applied to every chunk.
    pub compression: Compression,
    /// Whether bytes are shuffled before compression.
    pub shuffle: bool,
    /// One entry per chunk, `ceil(len / chunk_len)` in total.
    pub chunks: Vec<ChunkEntry>,
}

impl DatasetMeta {
    /// Creates metadata for a dataset with no chunks written yet.
    pub fn new(
        name: impl Into<String>,
        len: usize,
        chunk_len: usize,
        compression: Compression,
        shuffle: bool,
    ) -> Self {
        let chunk_len = chunk_len.clamp(1, u32::MAX as usize);
        Self {
            name: name.into(),
            len: len as u64,
            chunk_len: chunk_len as u32,
            compression,
            shuffle,
            chunks: vec![ChunkEntry::default(); len.div_ceil(chunk_len)],
        }
    }

    /// Element range `[start, end)` covered by chunk `index`.
    pub fn chunk_bounds(&self, index: usize) -> (usize, usize) {
        let chunk_len = self.chunk_len as usize;
        let start = index * chunk_len;
        let end = (start + chunk_len).min(self.len as usize);
        (start, end)
    }

    /// Total stored bytes across written chunks.
    pub fn stored_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.size)).sum()
    }

    /// Writes the record to a writer.
    ///
    /// Format:
    /// - name_len: u16 + name: UTF-8
    /// - len: u64
    /// - chunk_len: u32
    /// - codec: u8, level: u8, shuffle: u8, reserved: u8
    /// - chunk_count: u32 + entries: [(offset: u64, size: u32, crc32: u32), ...]
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let name = self.name.as_bytes();
        writer.write_all(&(name.len() as u16).to_le_bytes())?;
        writer.write_all(name)?;
        writer.write_all(&self.len.to_le_bytes())?;
        writer.write_all(&self.chunk_len.to_le_bytes())?;
        writer.write_all(&[
            self.compression.codec() as u8,
            self.compression.level(),
            u8::from(self.shuffle),
            0,
        ])?;
        writer.write_all(&(self.chunks.len() as u32).to_le_bytes())?;
        for chunk in &self.chunks {
            writer.write_all(&chunk.offset.to_le_bytes())?;
            writer.write_all(&chunk.size.to_le_bytes())?;
            writer.write_all(&chunk.crc32.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a record from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf2 = [0u8; 2];
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        reader.read_exact(&mut buf2)?;
        let mut name = vec![0u8; u16::from_le_bytes(buf2) as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|e| {
            ChunkError::DecompressionError(format!("Invalid UTF-8 in dataset name: {}", e))
        })?;

        reader.read_exact(&mut buf8)?;
        let len = u64::from_le_bytes(buf8);

        reader.read_exact(&mut buf4)?;
        let chunk_len = u32::from_le_bytes(buf4);

        reader.read_exact(&mut buf4)?;
        let codec = Codec::from_u8(buf4[0]).ok_or_else(|| {
            ChunkError::DecompressionError(format!("Unknown codec tag {}", buf4[0]))
        })?;
        let compression = Compression::new(codec, buf4[1])?;
        let shuffle = buf4[2] != 0;

        reader.read_exact(&mut buf4)?;
        let chunk_count = u32::from_le_bytes(buf4) as usize;
        if chunk_len == 0 || (len as usize).div_ceil(chunk_len as usize) != chunk_count {
            return Err(ChunkError::DecompressionError(format!(
                "dataset '{name}' has {chunk_count} chunks for length {len} \
                 and chunk length {chunk_len}"
            )));
        }

        let mut chunks = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            reader.read_exact(&mut buf8)?;
            let offset = u64::from_le_bytes(buf8);
            reader.read_exact(&mut buf4)?;
            let size = u32::from_le_bytes(buf4);
            reader.read_exact(&mut buf4)?;
            let crc32 = u32::from_le_bytes(buf4);
            chunks.push(ChunkEntry {
                offset,
                size,
                crc32,
            });
        }

        Ok(Self {
            name,
            len,
            chunk_len,
            compression,
            shuffle,
            chunks,
        })
    }
}

/// All dataset records of a container, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    datasets: BTreeMap<String, DatasetMeta>,
}

impl Directory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a dataset record, returning the record it replaced.
    pub fn insert(&mut self, meta: DatasetMeta) -> Option<DatasetMeta> {
        self.datasets.insert(meta.name.clone(), meta)
    }

    /// Gets a dataset record by name.
    pub fn get(&self, name: &str) -> Option<&DatasetMeta> {
        self.datasets.get(name)
    }

    /// Gets a mutable dataset record by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut DatasetMeta> {
        self.datasets.get_mut(name)
    }

    /// Returns an iterator over all records.
    pub fn iter(&self) -> impl Iterator<Item = &DatasetMeta> {
        self.datasets.values()
    }

    /// Returns a mutable iterator over all records.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DatasetMeta> {
        self.datasets.values_mut()
    }

    /// Encoded bytes referenced by every record.
    pub fn stored_bytes(&self) -> u64 {
        self.datasets.values().map(DatasetMeta::stored_bytes).sum()
    }

    /// Returns the number of datasets.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Returns true if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Serializes the directory.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.datasets.len() as u32).to_le_bytes());
        for meta in self.datasets.values() {
            meta.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Parses a directory and checks it against the footer.
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::ChecksumMismatch` if the CRC does not match.
    pub fn from_bytes(bytes: &[u8], footer: &ContainerFooter) -> Result<Self> {
        let actual = crc32fast::hash(bytes);
        if actual != footer.directory_crc32 {
            return Err(ChunkError::ChecksumMismatch {
                expected: footer.directory_crc32,
                actual,
            });
        }

        let mut reader = bytes;
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let count = u32::from_le_bytes(buf4);

        let mut directory = Self::new();
        for _ in 0..count {
            directory.insert(DatasetMeta::read_from(&mut reader)?);
        }
        Ok(directory)
    }
}
