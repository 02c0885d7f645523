// ========================================================================================
//
//                               Range Partitioner
//
// ========================================================================================
//
// Splits an index span into contiguous chunks for job-array dispatch. All ranges
// are zero-based and half-open; the same convention is used by every caller so a
// chunk's `end` is the next chunk's `start`.

use std::iter::FusedIterator;
use thiserror::Error;

use crate::types::IndexRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("invalid range: 'to' ({to}) is less than 'from' ({from})")]
    InvalidRange { from: u64, to: u64 },
    #[error("invalid chunk size {0}: a chunk must hold at least one index")]
    InvalidChunkSize(u64),
}

/// Iterator over the chunks of `[from, to)`.
///
/// Yields `ceil((to - from) / chunk_size)` ranges of `chunk_size` indices, the
/// last one holding the remainder. A zero-length span yields exactly one empty
/// range so that every request maps to at least one job.
#[derive(Debug, Clone)]
pub struct RangeChunks {
    next_start: u64,
    end: u64,
    chunk_size: u64,
    remaining: usize,
}

impl RangeChunks {
    pub fn new(from: u64, to: u64, chunk_size: u64) -> Result<Self, PartitionError> {
        if from > to {
            return Err(PartitionError::InvalidRange { from, to });
        }
        if chunk_size == 0 {
            return Err(PartitionError::InvalidChunkSize(chunk_size));
        }

        let span = to - from;
        let remaining = if span == 0 {
            1
        } else {
            span.div_ceil(chunk_size) as usize
        };

        Ok(Self {
            next_start: from,
            end: to,
            chunk_size,
            remaining,
        })
    }
}

impl Iterator for RangeChunks {
    type Item = IndexRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let start = self.next_start;
        let stop = start.saturating_add(self.chunk_size).min(self.end);
        self.next_start = stop;
        Some(IndexRange::spanning(start, stop))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for RangeChunks {}

impl FusedIterator for RangeChunks {}

/// Splits `[from, to)` into ordered, gap-free, non-overlapping chunks.
pub fn partition(from: u64, to: u64, chunk_size: u64) -> Result<Vec<IndexRange>, PartitionError> {
    Ok(RangeChunks::new(from, to, chunk_size)?.collect())
}

/// Number of chunks `partition` would produce, without allocating them.
pub fn chunk_count(from: u64, to: u64, chunk_size: u64) -> Result<usize, PartitionError> {
    Ok(RangeChunks::new(from, to, chunk_size)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(ranges: &[IndexRange]) -> Vec<(u64, u64)> {
        ranges.iter().map(|r| (r.start(), r.end())).collect()
    }

    #[test]
    fn remainder_becomes_a_trailing_chunk() {
        let ranges = partition(0, 10, 3).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
    }

    #[test]
    fn chunk_larger_than_span_yields_one_chunk() {
        let ranges = partition(0, 3, 10).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 3)]);
    }

    #[test]
    fn empty_span_yields_single_empty_range() {
        let ranges = partition(5, 5, 4).unwrap();
        assert_eq!(bounds(&ranges), vec![(5, 5)]);
        assert!(ranges[0].is_empty());
    }

    #[test]
    fn offset_span_keeps_absolute_indices() {
        let ranges = partition(1000, 2000, 400).unwrap();
        assert_eq!(bounds(&ranges), vec![(1000, 1400), (1400, 1800), (1800, 2000)]);
    }

    #[test]
    fn end_index_is_excluded_from_the_last_chunk() {
        let ranges = partition(0, 6, 3).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 3), (3, 6)]);
        assert!(!ranges[1].contains(6));
        assert!(ranges[1].contains(5));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(
            partition(7, 3, 2),
            Err(PartitionError::InvalidRange { from: 7, to: 3 })
        );
        assert_eq!(partition(0, 3, 0), Err(PartitionError::InvalidChunkSize(0)));
    }

    #[test]
    fn ranges_cover_the_span_exactly_once() {
        for from in 0..6u64 {
            for to in from..from + 23 {
                for chunk_size in 1..9u64 {
                    let ranges = partition(from, to, chunk_size).unwrap();
                    let mut expected_next = from;
                    for range in &ranges {
                        assert_eq!(range.start(), expected_next, "gap or overlap");
                        assert!(range.len() <= chunk_size);
                        expected_next = range.end();
                    }
                    assert_eq!(expected_next, to);
                    assert_eq!(ranges.len(), chunk_count(from, to, chunk_size).unwrap());
                    if to > from {
                        assert!(ranges.iter().all(|r| !r.is_empty()));
                    }
                }
            }
        }
    }

    #[test]
    fn iterator_reports_exact_length() {
        let mut chunks = RangeChunks::new(0, 2000, 100).unwrap();
        assert_eq!(chunks.len(), 20);
        chunks.next();
        assert_eq!(chunks.len(), 19);
        assert_eq!(chunks.by_ref().count(), 19);
        assert!(chunks.next().is_none());
    }
}
