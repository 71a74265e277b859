//! Property tests for the chunk planner.

use alopex_chunkeval::{plan, ChunkError, ChunkRange};
use proptest::prelude::*;

proptest! {
    /// Ranges are contiguous, ascending, non-empty and cover `[0, n)` once.
    #[test]
    fn test_plan_covers_exactly_once(n in 0usize..50_000, step in 1usize..5_000) {
        let plan = plan(n, step).unwrap();
        let ranges: Vec<ChunkRange> = plan.iter().collect();

        prop_assert_eq!(ranges.len(), n.div_ceil(step));
        prop_assert_eq!(plan.chunk_count(), ranges.len());

        let mut next = 0;
        for range in &ranges {
            prop_assert_eq!(range.start, next);
            prop_assert!(range.end > range.start);
            prop_assert!(range.len() <= step);
            next = range.end;
        }
        prop_assert_eq!(next, n);
    }

    /// Only the last range may be short, and it holds `n mod step` elements.
    #[test]
    fn test_plan_last_range(n in 1usize..50_000, step in 1usize..5_000) {
        let ranges: Vec<ChunkRange> = plan(n, step).unwrap().iter().collect();
        let (last, rest) = ranges.split_last().unwrap();
        prop_assert!(rest.iter().all(|r| r.len() == step));
        let expected = if n % step == 0 { step } else { n % step };
        prop_assert_eq!(last.len(), expected);
    }

    /// Iterating a plan twice yields the same ranges.
    #[test]
    fn test_plan_restartable(n in 0usize..10_000, step in 1usize..1_000) {
        let plan = plan(n, step).unwrap();
        let first: Vec<_> = plan.iter().collect();
        let second: Vec<_> = (&plan).into_iter().collect();
        prop_assert_eq!(first, second);
        prop_assert_eq!(plan.iter().len(), plan.chunk_count());
    }
}

#[test]
fn test_zero_step() {
    assert!(matches!(plan(10, 0), Err(ChunkError::InvalidStep)));
}

#[test]
fn test_empty_plan() {
    assert_eq!(plan(0, 7).unwrap().iter().count(), 0);
}
