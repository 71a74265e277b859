//! Sweep planning and execution.

use super::config::{BenchConfig, ResultSink};
use super::report::{Phase, RunReport, SweepReport, TimingRecord};
use crate::codec::{Codec, Compression};
use crate::error::{ChunkError, Result};
use crate::eval::{populate, ChunkedEvaluator, Evaluator, EvaluatorKind, WholeArrayEvaluator};
use crate::expr::Expr;
use crate::plan::{ChunkPlan, ChunkRange};
use crate::storage::{
    ChunkedOptions, ChunkedStorage, DType, Dataset, FlatFileStorage, MemoryStorage, Storage,
    StorageKind,
};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Name of the input dataset.
pub const INPUT_NAME: &str = "x";

/// Name of the result dataset.
pub const RESULT_NAME: &str = "r";

/// File name of the chunked container inside the work directory.
pub const CONTAINER_FILE: &str = "chunkeval.achk";

/// One configuration of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunSpec {
    /// Storage holding the datasets.
    pub storage: StorageKind,
    /// Evaluator computing the result.
    pub evaluator: EvaluatorKind,
    /// Compression of the chunked container, `None` for other storages.
    pub compression: Option<Compression>,
}

impl RunSpec {
    /// An in-memory configuration.
    pub fn memory(evaluator: EvaluatorKind) -> Self {
        Self {
            storage: StorageKind::Memory,
            evaluator,
            compression: None,
        }
    }

    /// The memory-mapped flat file configuration.
    pub fn flat_file() -> Self {
        Self {
            storage: StorageKind::FlatFile,
            evaluator: EvaluatorKind::Chunked,
            compression: None,
        }
    }

    /// A chunked container configuration.
    pub fn chunked(compression: Compression) -> Self {
        Self {
            storage: StorageKind::Chunked,
            evaluator: EvaluatorKind::Chunked,
            compression: Some(compression),
        }
    }
}

impl fmt::Display for RunSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.storage, self.evaluator)
    }
}

/// Runs benchmark configurations one after the other.
///
/// Every configuration populates `x`, computes `r` and closes both
/// datasets before the next one starts, so file-backed configurations can
/// reuse the same paths.
#[derive(Debug)]
pub struct Runner {
    config: BenchConfig,
    expr: Expr,
}

impl Runner {
    /// Validates `config` and parses its expression.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Evaluation`] if the expression does not parse and
    /// [`ChunkError::InvalidStep`] if the step is zero. Nothing touches the
    /// disk before these checks pass.
    pub fn new(config: BenchConfig) -> Result<Self> {
        let expr = Expr::parse(&config.expr)?;
        if config.step == 0 {
            return Err(ChunkError::InvalidStep);
        }
        Ok(Self { config, expr })
    }

    /// The sweep configuration.
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// The parsed expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Path of the chunked container.
    pub fn container_path(&self) -> PathBuf {
        self.config.work_dir.join(CONTAINER_FILE)
    }

    /// Requested codecs that are built in, deduplicated, in request order.
    pub fn codecs(&self) -> Vec<Codec> {
        let mut codecs = Vec::new();
        for name in &self.config.codecs {
            match Codec::from_name(name) {
                Some(codec) if codec.is_available() => {
                    if !codecs.contains(&codec) {
                        codecs.push(codec);
                    }
                }
                Some(codec) => debug!(codec = codec.name(), "codec not compiled in, skipping"),
                None if Codec::is_foreign_name(name) => {
                    debug!(codec = %name, "codec not available, skipping")
                }
                None => debug!(codec = %name, "unknown codec, skipping"),
            }
        }
        codecs
    }

    /// Lists the configurations of the sweep, in run order.
    ///
    /// In-memory baselines come first, then the flat file, then every level
    /// of every available codec. Uncompressed storage is the same for every
    /// codec, so level 0 is listed once.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::CompressionError`] if a level exceeds 9.
    pub fn specs(&self) -> Result<Vec<RunSpec>> {
        let mut specs = vec![
            RunSpec::memory(EvaluatorKind::WholeArray),
            RunSpec::memory(EvaluatorKind::Chunked),
        ];
        if self.config.include_flat_file {
            specs.push(RunSpec::flat_file());
        }

        let mut uncompressed = false;
        for codec in self.codecs() {
            for &level in &self.config.levels {
                if level == 0 {
                    if uncompressed {
                        continue;
                    }
                    uncompressed = true;
                }
                specs.push(RunSpec::chunked(Compression::new(codec, level)?));
            }
        }
        Ok(specs)
    }

    /// Runs the whole sweep.
    pub fn run(&self) -> Result<SweepReport> {
        self.run_each(|_| {})
    }

    /// Runs the whole sweep, handing each report to `on_run` as it completes.
    ///
    /// The first failing configuration aborts the sweep.
    pub fn run_each(&self, mut on_run: impl FnMut(&RunReport)) -> Result<SweepReport> {
        let specs = self.specs()?;
        info!(configurations = specs.len(), n = self.config.n, "starting sweep");

        let mut sweep = SweepReport::new(self.config.n);
        for spec in &specs {
            let report = self.run_spec(spec)?;
            on_run(&report);
            sweep.runs.push(report);
        }
        Ok(sweep)
    }

    /// Runs one configuration: populate, compute, measure, read back.
    ///
    /// Datasets are closed on every path, including failures.
    pub fn run_spec(&self, spec: &RunSpec) -> Result<RunReport> {
        let evaluator = self.evaluator_for(spec.evaluator)?;
        self.run_spec_with(spec, evaluator.as_ref())
    }

    /// Runs one configuration computing the result with `evaluator` in place
    /// of the one `spec` names.
    pub fn run_spec_with(&self, spec: &RunSpec, evaluator: &dyn Evaluator) -> Result<RunReport> {
        info!(%spec, compression = ?spec.compression, "starting configuration");
        let n = self.config.n;
        let mut storage = self.storage_for(spec)?;
        let mut memory_sink = MemoryStorage::new();

        let populate_plan = if spec.storage.is_file_backed() {
            ChunkPlan::new(n, self.config.step)?
        } else {
            ChunkPlan::whole(n)
        };
        let populate_x = || -> Result<()> {
            let mut x = storage.create(INPUT_NAME, n, DType::Float64)?;
            let filled = populate(x.as_mut(), &populate_plan);
            let closed = x.close();
            filled.and(closed)
        };
        let (populated, populate_time) = TimingRecord::measure(Phase::Populate, populate_x);
        populated?;

        let compute_r = || -> Result<()> {
            let mut x = storage.open(INPUT_NAME)?;
            let mut r = match self.config.result_sink {
                ResultSink::Dataset => storage.create(RESULT_NAME, n, DType::Float64)?,
                ResultSink::Memory => memory_sink.create(RESULT_NAME, n, DType::Float64)?,
            };
            let evaluated = evaluator.evaluate(&self.expr, x.as_mut(), r.as_mut());
            let closed_r = r.close();
            let closed_x = x.close();
            evaluated.and(closed_r).and(closed_x)
        };
        let (computed, compute_time) = TimingRecord::measure(Phase::Compute, compute_r);
        computed?;

        let size_bytes = storage.size_bytes()?;
        let sink: &mut dyn Storage = match self.config.result_sink {
            ResultSink::Dataset => storage.as_mut(),
            ResultSink::Memory => &mut memory_sink,
        };
        let endpoints = if n == 0 {
            None
        } else {
            let mut r = sink.open(RESULT_NAME)?;
            let read = read_endpoints(r.as_mut());
            let closed = r.close();
            Some(read.and_then(|ends| closed.map(|_| ends))?)
        };

        info!(
            %spec,
            populate_secs = populate_time.secs(),
            compute_secs = compute_time.secs(),
            size_bytes,
            "finished configuration"
        );
        Ok(RunReport {
            spec: *spec,
            expr: self.expr.source().to_string(),
            n,
            timings: vec![populate_time, compute_time],
            size_bytes,
            endpoints,
        })
    }

    fn storage_for(&self, spec: &RunSpec) -> Result<Box<dyn Storage>> {
        let config = &self.config;
        match spec.storage {
            StorageKind::Memory => Ok(Box::new(MemoryStorage::new())),
            StorageKind::FlatFile => Ok(Box::new(
                FlatFileStorage::new(&config.work_dir)?.with_sync_mode(config.sync_mode),
            )),
            StorageKind::Chunked => {
                fs::create_dir_all(&config.work_dir)
                    .map_err(|e| ChunkError::storage(&config.work_dir, e))?;
                let options = ChunkedOptions::new(spec.compression.unwrap_or_default())
                    .with_chunk_len(config.chunk_len)
                    .with_shuffle(config.shuffle)
                    .with_sync_mode(config.sync_mode);
                Ok(Box::new(ChunkedStorage::new(self.container_path(), options)))
            }
        }
    }

    fn evaluator_for(&self, kind: EvaluatorKind) -> Result<Box<dyn Evaluator>> {
        Ok(match kind {
            EvaluatorKind::WholeArray => Box::new(WholeArrayEvaluator),
            EvaluatorKind::Chunked => Box::new(ChunkedEvaluator::new(self.config.step)?),
        })
    }
}

fn read_endpoints(dataset: &mut dyn Dataset) -> Result<(f64, f64)> {
    let n = dataset.len();
    let mut first = [0.0];
    let mut last = [0.0];
    dataset.read_range_into(ChunkRange::new(0, 1), &mut first)?;
    dataset.read_range_into(ChunkRange::new(n - 1, n), &mut last)?;
    Ok((first[0], last[0]))
}
