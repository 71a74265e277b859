//! Benchmark sweep configuration.

use crate::storage::SyncMode;
use std::path::{Path, PathBuf};

/// Polynomial evaluated by default.
pub const DEFAULT_EXPR: &str = ".25*x**3 + .75*x**2 - 1.5*x - 2";

/// Default number of points (80 MB per dataset).
pub const DEFAULT_N: usize = 10 * 1000 * 1000;

/// Default slice length for chunked population and evaluation.
pub const DEFAULT_STEP: usize = 100 * 1000;

/// Codecs requested by default. Names that are not built in are skipped.
pub const DEFAULT_CODECS: &[&str] = &["zlib", "zstd", "gorilla", "blosc"];

/// Where the result dataset `r` is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultSink {
    /// `r` lives in the same storage as `x`.
    #[default]
    Dataset,
    /// `r` is kept in memory whatever the storage of `x`.
    Memory,
}

/// Settings for one benchmark sweep.
///
/// # Examples
/// ```rust,ignore
/// use alopex_chunkeval::bench::BenchConfig;
///
/// let config = BenchConfig::default()
///     .with_n(1_000_000)
///     .with_codecs(["zlib"])
///     .with_work_dir("/tmp/chunkeval");
/// ```
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Expression evaluated over `x`.
    pub expr: String,
    /// Number of elements in each dataset.
    pub n: usize,
    /// Slice length for chunked population and evaluation.
    pub step: usize,
    /// Codec names to sweep, in order.
    pub codecs: Vec<String>,
    /// Compression levels to sweep for every codec.
    pub levels: Vec<u8>,
    /// Fixed chunk length for the container, or `None` for the default shape.
    pub chunk_len: Option<usize>,
    /// Shuffle bytes before general purpose codecs.
    pub shuffle: bool,
    /// Directory holding the generated files.
    pub work_dir: PathBuf,
    /// Run the memory-mapped flat file configuration.
    pub include_flat_file: bool,
    /// Where the result is stored.
    pub result_sink: ResultSink,
    /// How file-backed datasets are flushed before sizes are measured.
    pub sync_mode: SyncMode,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            expr: DEFAULT_EXPR.to_string(),
            n: DEFAULT_N,
            step: DEFAULT_STEP,
            codecs: DEFAULT_CODECS.iter().map(|c| c.to_string()).collect(),
            levels: (0..=9).collect(),
            chunk_len: None,
            shuffle: true,
            work_dir: PathBuf::from("."),
            include_flat_file: true,
            result_sink: ResultSink::default(),
            sync_mode: SyncMode::default(),
        }
    }
}

impl BenchConfig {
    /// Sets the expression.
    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.expr = expr.into();
        self
    }

    /// Sets the dataset length.
    pub fn with_n(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Sets the slice length.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Sets the codec names to sweep.
    pub fn with_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.codecs = codecs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the compression levels to sweep.
    pub fn with_levels(mut self, levels: impl IntoIterator<Item = u8>) -> Self {
        self.levels = levels.into_iter().collect();
        self
    }

    /// Sets a fixed container chunk length.
    pub fn with_chunk_len(mut self, chunk_len: Option<usize>) -> Self {
        self.chunk_len = chunk_len;
        self
    }

    /// Enables or disables the shuffle filter.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Sets the directory for generated files.
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Includes or skips the flat file configuration.
    pub fn with_flat_file(mut self, include: bool) -> Self {
        self.include_flat_file = include;
        self
    }

    /// Sets where the result is stored.
    pub fn with_result_sink(mut self, sink: ResultSink) -> Self {
        self.result_sink = sink;
        self
    }

    /// Sets the sync mode for file-backed datasets.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.expr, DEFAULT_EXPR);
        assert_eq!(config.n, 10_000_000);
        assert_eq!(config.step, 100_000);
        assert_eq!(config.levels, (0..=9).collect::<Vec<u8>>());
        assert_eq!(config.codecs.len(), 4);
        assert!(config.include_flat_file);
        assert_eq!(config.result_sink, ResultSink::Dataset);
        assert_eq!(config.sync_mode, SyncMode::Fsync);
    }

    #[test]
    fn test_builder() {
        let config = BenchConfig::default()
            .with_n(1000)
            .with_step(100)
            .with_codecs(["gorilla"])
            .with_levels([0, 1])
            .with_result_sink(ResultSink::Memory)
            .with_sync_mode(SyncMode::None);
        assert_eq!(config.n, 1000);
        assert_eq!(config.step, 100);
        assert_eq!(config.codecs, vec!["gorilla".to_string()]);
        assert_eq!(config.levels, vec![0, 1]);
        assert_eq!(config.result_sink, ResultSink::Memory);
        assert_eq!(config.sync_mode, SyncMode::None);
    }
}
