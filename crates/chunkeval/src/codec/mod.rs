//! Compression codecs for chunked storage.
//!
//! A [`Compression`] pairs a [`Codec`] with a level in `[0, 9]`. Level 0
//! stores chunks raw whatever the codec, so uncompressed storage is the same
//! for every codec.
//!
//! Which codecs exist depends on cargo features:
//!
//! | Codec     | Feature | Library      |
//! |-----------|---------|--------------|
//! | `zlib`    | `zlib`  | `flate2`     |
//! | `zstd`    | `zstd`  | `zstd`       |
//! | `gorilla` | always  | built in     |

pub mod gorilla;

use crate::error::{ChunkError, Result};
use std::fmt;

/// Highest supported compression level.
pub const MAX_LEVEL: u8 = 9;

/// Size in bytes of one stored element.
const ITEM_SIZE: usize = std::mem::size_of::<f64>();

/// Backend reported for zlib by [`Codec::version`].
#[cfg(feature = "zlib")]
const ZLIB_BACKEND: &str = "flate2 (miniz_oxide)";

/// Codec names recognised by [`Codec::from_name`] that are never built in.
const FOREIGN_CODECS: &[&str] = &["blosc", "lzo", "bzip2"];

/// A compression codec identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Codec {
    /// Deflate with a zlib wrapper.
    Zlib = 1,
    /// Zstandard.
    Zstd = 2,
    /// Gorilla XOR float compression. The level only switches it on or off.
    Gorilla = 3,
}

impl Codec {
    /// All codecs this crate knows how to name, in sweep order.
    pub const ALL: [Codec; 3] = [Codec::Zlib, Codec::Zstd, Codec::Gorilla];

    /// Creates a Codec from its on-disk tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Zlib),
            2 => Some(Self::Zstd),
            3 => Some(Self::Gorilla),
            _ => None,
        }
    }

    /// Looks a codec up by name, case-insensitively.
    ///
    /// Returns `None` for names that are unknown or recognised but never
    /// built into this crate (`blosc`, `lzo`, `bzip2`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "zlib" => Some(Self::Zlib),
            "zstd" => Some(Self::Zstd),
            "gorilla" => Some(Self::Gorilla),
            _ => None,
        }
    }

    /// Returns true if `name` is a codec some other build might provide.
    pub fn is_foreign_name(name: &str) -> bool {
        FOREIGN_CODECS.contains(&name.to_ascii_lowercase().as_str())
    }

    /// Returns the canonical codec name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
            Self::Gorilla => "gorilla",
        }
    }

    /// Returns true if the codec was compiled into this build.
    pub fn is_available(self) -> bool {
        match self {
            Self::Zlib => cfg!(feature = "zlib"),
            Self::Zstd => cfg!(feature = "zstd"),
            Self::Gorilla => true,
        }
    }

    /// Lists the codecs usable in this build.
    pub fn available() -> Vec<Codec> {
        Self::ALL.into_iter().filter(|c| c.is_available()).collect()
    }

    /// Describes the library behind the codec, or `None` if it is not built in.
    ///
    /// zlib reports its backend since `flate2` does not expose a version.
    pub fn version(self) -> Option<&'static str> {
        match self {
            #[cfg(feature = "zlib")]
            Self::Zlib => Some(ZLIB_BACKEND),
            #[cfg(feature = "zstd")]
            Self::Zstd => Some(zstd::zstd_safe::version_string()),
            Self::Gorilla => Some(env!("CARGO_PKG_VERSION")),
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A codec and level applied uniformly to every chunk of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Compression {
    codec: Codec,
    level: u8,
}

impl Default for Compression {
    fn default() -> Self {
        Self::none()
    }
}

impl Compression {
    /// Creates a compression configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::CompressionError`] if `level` exceeds 9.
    pub fn new(codec: Codec, level: u8) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(ChunkError::CompressionError(format!(
                "level {level} out of range [0, {MAX_LEVEL}]"
            )));
        }
        Ok(Self { codec, level })
    }

    /// Uncompressed storage.
    pub fn none() -> Self {
        Self {
            codec: Codec::Zlib,
            level: 0,
        }
    }

    /// The configured codec.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// The configured level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Returns true when chunks are stored raw.
    pub fn is_none(&self) -> bool {
        self.level == 0
    }

    /// Encodes one chunk of values.
    ///
    /// `shuffle` transposes the bytes of the elements before a general purpose
    /// codec runs; it is ignored for raw storage and for Gorilla.
    pub fn compress(&self, values: &[f64], shuffle: bool) -> Result<Vec<u8>> {
        if self.is_none() {
            return Ok(to_bytes(values));
        }
        match self.codec {
            Codec::Gorilla => Ok(gorilla::encode(values)),
            codec => {
                let mut bytes = to_bytes(values);
                if shuffle {
                    bytes = shuffle_bytes(&bytes, ITEM_SIZE);
                }
                compress_bytes(codec, self.level, &bytes)
            }
        }
    }

    /// Decodes one chunk of values into `out`, which must hold exactly the
    /// number of values that were compressed.
    pub fn decompress(&self, data: &[u8], shuffle: bool, out: &mut [f64]) -> Result<()> {
        if self.is_none() {
            return from_bytes(data, out);
        }
        match self.codec {
            Codec::Gorilla => gorilla::decode_into(data, out),
            codec => {
                let mut bytes = decompress_bytes(codec, data, out.len() * ITEM_SIZE)?;
                if shuffle {
                    bytes = unshuffle_bytes(&bytes, ITEM_SIZE);
                }
                from_bytes(&bytes, out)
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "{} lvl{}", self.codec, self.level)
        }
    }
}

/// Serializes values as little-endian bytes.
pub fn to_bytes(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * ITEM_SIZE);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserializes little-endian bytes into `out`.
pub fn from_bytes(bytes: &[u8], out: &mut [f64]) -> Result<()> {
    if bytes.len() != out.len() * ITEM_SIZE {
        return Err(ChunkError::DecompressionError(format!(
            "expected {} bytes, got {}",
            out.len() * ITEM_SIZE,
            bytes.len()
        )));
    }
    for (slot, raw) in out.iter_mut().zip(bytes.chunks_exact(ITEM_SIZE)) {
        let mut buf = [0u8; ITEM_SIZE];
        buf.copy_from_slice(raw);
        *slot = f64::from_le_bytes(buf);
    }
    Ok(())
}

/// Groups byte `b` of every element together: `out[b * n + i] = in[i * size + b]`.
pub fn shuffle_bytes(bytes: &[u8], size: usize) -> Vec<u8> {
    let n = bytes.len() / size;
    let mut out = vec![0u8; bytes.len()];
    for (i, element) in bytes.chunks_exact(size).enumerate() {
        for (b, &byte) in element.iter().enumerate() {
            out[b * n + i] = byte;
        }
    }
    // Trailing partial element, if any, stays in place.
    let tail = n * size;
    out[tail..].copy_from_slice(&bytes[tail..]);
    out
}

/// Inverse of [`shuffle_bytes`].
pub fn unshuffle_bytes(bytes: &[u8], size: usize) -> Vec<u8> {
    let n = bytes.len() / size;
    let mut out = vec![0u8; bytes.len()];
    for (i, element) in out.chunks_exact_mut(size).enumerate() {
        for (b, slot) in element.iter_mut().enumerate() {
            *slot = bytes[b * n + i];
        }
    }
    let tail = n * size;
    out[tail..].copy_from_slice(&bytes[tail..]);
    out
}

#[allow(unused_variables)]
fn compress_bytes(codec: Codec, level: u8, bytes: &[u8]) -> Result<Vec<u8>> {
    match codec {
        #[cfg(feature = "zlib")]
        Codec::Zlib => {
            use std::io::Write;
            let mut encoder = flate2::write::ZlibEncoder::new(
                Vec::with_capacity(bytes.len() / 2),
                flate2::Compression::new(u32::from(level)),
            );
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        #[cfg(feature = "zstd")]
        Codec::Zstd => zstd::bulk::compress(bytes, i32::from(level))
            .map_err(|e| ChunkError::CompressionError(format!("zstd: {e}"))),
        other => Err(ChunkError::CompressionError(format!(
            "codec {other} is not available in this build"
        ))),
    }
}

#[allow(unused_variables)]
fn decompress_bytes(codec: Codec, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    match codec {
        #[cfg(feature = "zlib")]
        Codec::Zlib => {
            use std::io::Read;
            let mut decoder = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::with_capacity(expected_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ChunkError::DecompressionError(format!("zlib: {e}")))?;
            Ok(out)
        }
        #[cfg(feature = "zstd")]
        Codec::Zstd => zstd::bulk::decompress(data, expected_len)
            .map_err(|e| ChunkError::DecompressionError(format!("zstd: {e}"))),
        other => Err(ChunkError::DecompressionError(format!(
            "codec {other} is not available in this build"
        ))),
    }
}
