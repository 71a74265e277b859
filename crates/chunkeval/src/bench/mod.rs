//! Benchmark sweep over storages, evaluators and compression settings.
//!
//! A [`Runner`] turns a [`BenchConfig`] into an ordered list of
//! [`RunSpec`]s and runs each one through two timed phases:
//!
//! 1. **populate**: write `n` evenly spaced points over `[-1, 1]` into `x`
//! 2. **compute**: evaluate the expression from `x` into `r`
//!
//! and then records the storage size. Results are collected in a
//! [`SweepReport`] whose `Display` output is the human-readable report.

pub mod config;
pub mod report;
pub mod runner;

pub use config::{BenchConfig, ResultSink, DEFAULT_CODECS, DEFAULT_EXPR, DEFAULT_N, DEFAULT_STEP};
pub use report::{Phase, RunReport, SweepReport, TimingRecord, MB};
pub use runner::{RunSpec, Runner, CONTAINER_FILE, INPUT_NAME, RESULT_NAME};
