//! Chunkeval - Alopex out-of-core expression evaluation
//!
//! This crate evaluates a scalar expression over one-dimensional `f64`
//! arrays that may not fit in memory, and benchmarks how the storage medium
//! affects the cost of doing so.
//!
//! # Components
//!
//! - [`ChunkPlan`]: splits `[0, n)` into fixed-size ranges
//! - [`Storage`] / [`Dataset`]: in-memory, memory-mapped flat file and
//!   compressed chunked container backends
//! - [`Expr`]: parsed expression evaluated element by element
//! - [`WholeArrayEvaluator`] / [`ChunkedEvaluator`]: one-pass and streaming evaluation
//! - [`Runner`]: the benchmark sweep and its [`SweepReport`]
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_chunkeval::{BenchConfig, Runner};
//!
//! let runner = Runner::new(
//!     BenchConfig::default()
//!         .with_n(1_000_000)
//!         .with_codecs(["zlib", "gorilla"])
//!         .with_work_dir("/tmp/chunkeval"),
//! )?;
//! let report = runner.run()?;
//! println!("{report}");
//! ```

#![deny(missing_docs)]

pub mod bench;
pub mod codec;
pub mod error;
pub mod eval;
pub mod expr;
pub mod plan;
pub mod storage;

pub use bench::{BenchConfig, ResultSink, RunReport, RunSpec, Runner, SweepReport};
pub use codec::{Codec, Compression};
pub use error::{ChunkError, Result};
pub use eval::{
    linspace_value, populate, ChunkedEvaluator, Evaluator, EvaluatorKind, WholeArrayEvaluator,
};
pub use expr::Expr;
pub use plan::{plan, ChunkPlan, ChunkRange};
pub use storage::{
    ChunkedOptions, ChunkedStorage, DType, Dataset, FlatFileStorage, MemoryStorage, Storage,
    StorageKind, SyncMode,
};
