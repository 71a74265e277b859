//! Error and Result types for chunked evaluation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for chunked evaluation operations.
pub type Result<T> = std::result::Result<T, ChunkError>;

/// The error type for storage, range and expression failures.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The backing medium could not be allocated, locked or opened.
    #[error(
        "Storage error at {}{}: {}",
        path.display(),
        codec.as_deref().map(|c| format!(" (codec {c})")).unwrap_or_default(),
        reason
    )]
    Storage {
        /// Path of the file involved.
        path: PathBuf,
        /// Codec requested for the file, if any.
        codec: Option<String>,
        /// Human readable cause.
        reason: String,
    },

    /// A range fell outside the dataset bounds or was empty.
    #[error("Range error: [{start}, {end}) is not within [0, {len})")]
    Range {
        /// Start index (inclusive).
        start: usize,
        /// End index (exclusive).
        end: usize,
        /// Dataset length.
        len: usize,
    },

    /// A value buffer did not match the size of its range.
    #[error("Length mismatch: range holds {expected} elements, buffer has {actual}")]
    LengthMismatch {
        /// Number of elements in the range.
        expected: usize,
        /// Number of elements supplied.
        actual: usize,
    },

    /// The chunk step of a plan was zero.
    #[error("Invalid chunk step: step must be greater than zero")]
    InvalidStep,

    /// The expression text could not be parsed.
    #[error("Evaluation error in '{expr}' at offset {position}: {reason}")]
    Evaluation {
        /// The expression text.
        expr: String,
        /// Byte offset of the offending token.
        position: usize,
        /// Human readable cause.
        reason: String,
    },

    /// Invalid magic bytes in a container file.
    #[error("Invalid magic bytes: expected ACHK, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported container format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the data read back.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored CRC32 checksum.
        expected: u32,
        /// Computed CRC32 checksum.
        actual: u32,
    },

    /// Requested dataset does not exist in the storage.
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    /// A dataset of that name is already open.
    #[error("Dataset already open: {0}")]
    DatasetBusy(String),

    /// Error during compression.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// Error during decompression.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ChunkError {
    /// Builds a [`ChunkError::Storage`] for `path` from any displayable cause.
    pub fn storage(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Storage {
            path: path.into(),
            codec: None,
            reason: reason.to_string(),
        }
    }

    /// Turns an I/O error into a [`ChunkError::Storage`] naming `path`.
    /// Other variants pass through.
    pub fn at_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::IoError(e) => Self::storage(path, e),
            other => other,
        }
    }

    /// Attaches a codec name to a storage error. Other variants pass through.
    pub fn with_codec(self, codec: impl Into<String>) -> Self {
        match self {
            Self::Storage { path, reason, .. } => Self::Storage {
                path,
                codec: Some(codec.into()),
                reason,
            },
            other => other,
        }
    }
}
