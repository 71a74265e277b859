//! Expression evaluation over datasets.
//!
//! Both evaluators apply the same compiled [`Expr`] to each element, so a
//! given input produces bit-identical output whichever evaluator runs it.
//! [`WholeArrayEvaluator`] moves the whole input through memory at once,
//! while [`ChunkedEvaluator`] walks a [`ChunkPlan`] and holds one slice of
//! input and output at a time.

use crate::error::{ChunkError, Result};
use crate::expr::Expr;
use crate::plan::ChunkPlan;
use crate::storage::Dataset;
use std::fmt;
use tracing::debug;

/// Lower bound of the generated input values.
pub const LINSPACE_START: f64 = -1.0;

/// Upper bound of the generated input values.
pub const LINSPACE_STOP: f64 = 1.0;

/// Value at index `i` of `n` evenly spaced points over `[-1, 1]`.
///
/// The last point is exactly `1`; a single point is `-1`.
pub fn linspace_value(i: usize, n: usize) -> f64 {
    if n <= 1 {
        return LINSPACE_START;
    }
    if i == n - 1 {
        return LINSPACE_STOP;
    }
    let step = (LINSPACE_STOP - LINSPACE_START) / (n - 1) as f64;
    i as f64 * step + LINSPACE_START
}

/// Writes the linspace input into `dataset`, one range of `plan` at a time.
///
/// # Errors
///
/// Returns [`ChunkError::LengthMismatch`] if the plan does not cover the
/// dataset, and any error raised by the dataset writes.
pub fn populate(dataset: &mut dyn Dataset, plan: &ChunkPlan) -> Result<()> {
    let n = dataset.len();
    if plan.total_len() != n {
        return Err(ChunkError::LengthMismatch {
            expected: n,
            actual: plan.total_len(),
        });
    }

    let mut buf = Vec::with_capacity(plan.step().min(n));
    for range in plan {
        buf.clear();
        buf.extend(range.as_range().map(|i| linspace_value(i, n)));
        dataset.write_range(range, &buf)?;
    }
    debug!(
        name = dataset.name(),
        len = n,
        chunks = plan.chunk_count(),
        "populated dataset"
    );
    Ok(())
}

/// Which evaluator a configuration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluatorKind {
    /// One pass over the whole array.
    WholeArray,
    /// Slice-by-slice streaming.
    Chunked,
}

impl fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvaluatorKind::WholeArray => "whole-array",
            EvaluatorKind::Chunked => "streaming",
        })
    }
}

/// Evaluates an expression from an input dataset into an output dataset.
pub trait Evaluator {
    /// Evaluator variant.
    fn kind(&self) -> EvaluatorKind;

    /// Writes `output[i] = expr(input[i])` for every index.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::LengthMismatch`] if the datasets differ in length,
    /// and any error raised by the dataset reads and writes.
    fn evaluate(&self, expr: &Expr, input: &mut dyn Dataset, output: &mut dyn Dataset)
        -> Result<()>;
}

fn check_lengths(input: &dyn Dataset, output: &dyn Dataset) -> Result<()> {
    if input.len() != output.len() {
        return Err(ChunkError::LengthMismatch {
            expected: input.len(),
            actual: output.len(),
        });
    }
    Ok(())
}

/// Reads the whole input, evaluates it and writes the whole output at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeArrayEvaluator;

impl Evaluator for WholeArrayEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::WholeArray
    }

    fn evaluate(
        &self,
        expr: &Expr,
        input: &mut dyn Dataset,
        output: &mut dyn Dataset,
    ) -> Result<()> {
        check_lengths(input, output)?;
        for range in ChunkPlan::whole(input.len()) {
            let values = input.read_range(range)?;
            output.write_range(range, &expr.eval_slice(&values))?;
        }
        Ok(())
    }
}

/// Streams the input in slices of `step` elements.
///
/// Peak working memory is two buffers of `step` elements regardless of the
/// dataset length.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedEvaluator {
    step: usize,
}

impl ChunkedEvaluator {
    /// Creates an evaluator reading `step` elements per slice.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::InvalidStep`] if `step` is zero.
    pub fn new(step: usize) -> Result<Self> {
        if step == 0 {
            return Err(ChunkError::InvalidStep);
        }
        Ok(Self { step })
    }

    /// Elements per slice.
    pub fn step(&self) -> usize {
        self.step
    }
}

impl Evaluator for ChunkedEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Chunked
    }

    fn evaluate(
        &self,
        expr: &Expr,
        input: &mut dyn Dataset,
        output: &mut dyn Dataset,
    ) -> Result<()> {
        check_lengths(input, output)?;
        let plan = ChunkPlan::new(input.len(), self.step)?;

        let capacity = self.step.min(input.len());
        let mut src = Vec::with_capacity(capacity);
        let mut dst = Vec::with_capacity(capacity);
        for range in &plan {
            src.resize(range.len(), 0.0);
            dst.resize(range.len(), 0.0);
            input.read_range_into(range, &mut src)?;
            expr.eval_into(&src, &mut dst)?;
            output.write_range(range, &dst)?;
        }
        debug!(
            input = input.name(),
            output = output.name(),
            chunks = plan.chunk_count(),
            "streamed evaluation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ChunkRange;
    use crate::storage::{DType, MemoryStorage, Storage};

    const POLY: &str = ".25*x**3 + .75*x**2 - 1.5*x - 2";

    #[test]
    fn test_linspace_endpoints() {
        assert_eq!(linspace_value(0, 1000), -1.0);
        assert_eq!(linspace_value(999, 1000), 1.0);
        assert_eq!(linspace_value(0, 1), -1.0);
        assert_eq!(linspace_value(1, 3), 0.0);
        assert_eq!(linspace_value(2, 5), 0.0);
    }

    #[test]
    fn test_linspace_monotonic() {
        let n = 10_001;
        let values: Vec<f64> = (0..n).map(|i| linspace_value(i, n)).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_populate_chunked_matches_whole() {
        let n = 1003;
        let mut storage = MemoryStorage::new();
        let mut whole = storage.create("a", n, DType::Float64).unwrap();
        let mut chunked = storage.create("b", n, DType::Float64).unwrap();
        populate(whole.as_mut(), &ChunkPlan::whole(n)).unwrap();
        populate(chunked.as_mut(), &ChunkPlan::new(n, 100).unwrap()).unwrap();

        let full = ChunkRange::new(0, n);
        assert_eq!(
            whole.read_range(full).unwrap(),
            chunked.read_range(full).unwrap()
        );
    }

    #[test]
    fn test_populate_plan_length_mismatch() {
        let mut storage = MemoryStorage::new();
        let mut ds = storage.create("x", 10, DType::Float64).unwrap();
        assert!(matches!(
            populate(ds.as_mut(), &ChunkPlan::whole(11)),
            Err(ChunkError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_whole_and_chunked_agree() {
        let n = 1007;
        let expr = Expr::parse(POLY).unwrap();
        let mut storage = MemoryStorage::new();
        let mut x = storage.create("x", n, DType::Float64).unwrap();
        populate(x.as_mut(), &ChunkPlan::whole(n)).unwrap();

        let mut r1 = storage.create("r1", n, DType::Float64).unwrap();
        let mut r2 = storage.create("r2", n, DType::Float64).unwrap();
        WholeArrayEvaluator
            .evaluate(&expr, x.as_mut(), r1.as_mut())
            .unwrap();
        ChunkedEvaluator::new(100)
            .unwrap()
            .evaluate(&expr, x.as_mut(), r2.as_mut())
            .unwrap();

        let full = ChunkRange::new(0, n);
        let a = r1.read_range(full).unwrap();
        let b = r2.read_range(full).unwrap();
        assert!(a.iter().zip(&b).all(|(a, b)| a.to_bits() == b.to_bits()));
        assert_eq!(a[0], 0.0);
        assert_eq!(a[n - 1], -2.5);
    }

    #[test]
    fn test_length_mismatch() {
        let expr = Expr::parse(POLY).unwrap();
        let mut storage = MemoryStorage::new();
        let mut x = storage.create("x", 10, DType::Float64).unwrap();
        let mut r = storage.create("r", 9, DType::Float64).unwrap();
        assert!(matches!(
            WholeArrayEvaluator.evaluate(&expr, x.as_mut(), r.as_mut()),
            Err(ChunkError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_datasets() {
        let expr = Expr::parse(POLY).unwrap();
        let mut storage = MemoryStorage::new();
        let mut x = storage.create("x", 0, DType::Float64).unwrap();
        let mut r = storage.create("r", 0, DType::Float64).unwrap();
        populate(x.as_mut(), &ChunkPlan::whole(0)).unwrap();
        WholeArrayEvaluator
            .evaluate(&expr, x.as_mut(), r.as_mut())
            .unwrap();
        ChunkedEvaluator::new(4)
            .unwrap()
            .evaluate(&expr, x.as_mut(), r.as_mut())
            .unwrap();
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(matches!(
            ChunkedEvaluator::new(0),
            Err(ChunkError::InvalidStep)
        ));
    }
}
