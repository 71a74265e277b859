//! Chunk planning for out-of-core evaluation.
//!
//! A [`ChunkPlan`] splits `[0, len)` into consecutive half-open ranges of at
//! most `step` elements. The plan is a plain value: iterating it twice yields
//! the same ranges, so population and computation can share one plan.
//!
//! ```text
//! len = 10, step = 4
//!
//! [0, 4) [4, 8) [8, 10)
//! ```

use crate::error::{ChunkError, Result};
use std::fmt;
use std::ops::Range;

/// A half-open index interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    /// First index covered (inclusive).
    pub start: usize,
    /// One past the last index covered (exclusive).
    pub end: usize,
}

impl ChunkRange {
    /// Creates a new range.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of elements in the range.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if the range holds no elements.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Checks that the range is non-empty and lies within `[0, len)`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Range`] otherwise.
    pub fn check_within(&self, len: usize) -> Result<()> {
        if self.start < self.end && self.end <= len {
            Ok(())
        } else {
            Err(ChunkError::Range {
                start: self.start,
                end: self.end,
                len,
            })
        }
    }

    /// Returns the range as a `std::ops::Range` for slicing.
    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for ChunkRange {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// An ordered sequence of chunk ranges covering `[0, len)` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    len: usize,
    step: usize,
}

impl ChunkPlan {
    /// Creates a plan over `len` elements in slices of `step`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::InvalidStep`] if `step` is zero.
    pub fn new(len: usize, step: usize) -> Result<Self> {
        if step == 0 {
            return Err(ChunkError::InvalidStep);
        }
        Ok(Self { len, step })
    }

    /// A plan with one range covering the whole array.
    pub fn whole(len: usize) -> Self {
        Self {
            len,
            step: len.max(1),
        }
    }

    /// Total number of elements covered.
    pub fn total_len(&self) -> usize {
        self.len
    }

    /// Maximum number of elements per range.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Number of ranges, `ceil(len / step)`.
    pub fn chunk_count(&self) -> usize {
        self.len.div_ceil(self.step)
    }

    /// Returns an iterator over the ranges, starting from the first one.
    pub fn iter(&self) -> ChunkIter {
        ChunkIter {
            next_start: 0,
            len: self.len,
            step: self.step,
        }
    }
}

impl IntoIterator for ChunkPlan {
    type Item = ChunkRange;
    type IntoIter = ChunkIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = ChunkRange;
    type IntoIter = ChunkIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over the ranges of a [`ChunkPlan`].
#[derive(Debug, Clone)]
pub struct ChunkIter {
    next_start: usize,
    len: usize,
    step: usize,
}

impl Iterator for ChunkIter {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_start >= self.len {
            return None;
        }
        let start = self.next_start;
        let end = start.saturating_add(self.step).min(self.len);
        self.next_start = end;
        Some(ChunkRange::new(start, end))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.next_start.min(self.len)).div_ceil(self.step);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}

impl std::iter::FusedIterator for ChunkIter {}

/// Plans `len` elements in slices of `step`.
///
/// Shorthand for [`ChunkPlan::new`].
pub fn plan(len: usize, step: usize) -> Result<ChunkPlan> {
    ChunkPlan::new(len, step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let ranges: Vec<_> = plan(10, 5).unwrap().iter().collect();
        assert_eq!(ranges, vec![ChunkRange::new(0, 5), ChunkRange::new(5, 10)]);
    }

    #[test]
    fn test_partial_last_chunk() {
        let p = plan(1_000_007, 100_000).unwrap();
        assert_eq!(p.chunk_count(), 11);

        let last = p.iter().last().unwrap();
        assert_eq!(last, ChunkRange::new(1_000_000, 1_000_007));
        assert_eq!(last.len(), 7);
    }

    #[test]
    fn test_empty_plan() {
        let p = plan(0, 10).unwrap();
        assert_eq!(p.chunk_count(), 0);
        assert_eq!(p.iter().next(), None);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(matches!(plan(10, 0), Err(ChunkError::InvalidStep)));
    }

    #[test]
    fn test_step_larger_than_len() {
        let ranges: Vec<_> = plan(3, 100).unwrap().into_iter().collect();
        assert_eq!(ranges, vec![ChunkRange::new(0, 3)]);
    }

    #[test]
    fn test_whole_plan() {
        let p = ChunkPlan::whole(42);
        assert_eq!(p.iter().collect::<Vec<_>>(), vec![ChunkRange::new(0, 42)]);
        assert_eq!(ChunkPlan::whole(0).chunk_count(), 0);
    }

    #[test]
    fn test_restartable() {
        let p = plan(25, 7).unwrap();
        let first: Vec<_> = p.iter().collect();
        let second: Vec<_> = (&p).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_size_hint_tracks_progress() {
        let mut iter = plan(25, 7).unwrap().iter();
        assert_eq!(iter.len(), 4);
        iter.next();
        assert_eq!(iter.len(), 3);
    }

    #[test]
    fn test_check_within() {
        assert!(ChunkRange::new(0, 10).check_within(10).is_ok());
        assert!(matches!(
            ChunkRange::new(5, 11).check_within(10),
            Err(ChunkError::Range { start: 5, end: 11, len: 10 })
        ));
        assert!(ChunkRange::new(4, 4).check_within(10).is_err());
    }
}
