//! Batch bounds calculation.
//!
//! A migration covers an inclusive range of batch column values. Batches are
//! carved off that range front to back, each starting right after the highest
//! value already claimed. Since the only input besides the migration's own
//! configuration is "highest value claimed so far", the next range can always
//! be recomputed from the jobs table after a crash; no separate cursor exists.

use serde::{Deserialize, Serialize};

/// An inclusive `[min_value, max_value]` range of batch column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    pub min_value: i64,
    pub max_value: i64,
}

impl BatchRange {
    pub fn new(min_value: i64, max_value: i64) -> Self {
        Self {
            min_value,
            max_value,
        }
    }

    /// Number of batch column values covered by the range.
    pub fn len(&self) -> u64 {
        if self.max_value < self.min_value {
            return 0;
        }
        let len = self.max_value as i128 - self.min_value as i128 + 1;
        u64::try_from(len).unwrap_or(u64::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min_value <= value && value <= self.max_value
    }

    /// Split this range into consecutive slices of at most `size` values.
    pub fn split(&self, size: i64) -> BatchRanges {
        BatchRanges::new(*self, size)
    }
}

impl std::fmt::Display for BatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min_value, self.max_value)
    }
}

/// Compute the next batch to process.
///
/// `previous_max` is the highest `max_value` already claimed by a job of the
/// migration, or `None` before the first batch. Returns `None` once the whole
/// range has been claimed.
pub fn next_batch_bounds(
    range: BatchRange,
    batch_size: i64,
    previous_max: Option<i64>,
) -> Option<BatchRange> {
    let start = match previous_max {
        // i64::MAX claimed means nothing can follow it
        Some(previous) => previous.checked_add(1)?.max(range.min_value),
        None => range.min_value,
    };

    if start > range.max_value {
        return None;
    }

    let end = start
        .saturating_add(batch_size.max(1) - 1)
        .min(range.max_value);

    Some(BatchRange::new(start, end))
}

/// Iterator over consecutive batches of a range.
///
/// Used both to enumerate a migration's batches and to split a batch into
/// sub-batches.
#[derive(Debug, Clone)]
pub struct BatchRanges {
    range: BatchRange,
    size: i64,
    previous_max: Option<i64>,
}

impl BatchRanges {
    pub fn new(range: BatchRange, size: i64) -> Self {
        Self {
            range,
            size,
            previous_max: None,
        }
    }
}

impl Iterator for BatchRanges {
    type Item = BatchRange;

    fn next(&mut self) -> Option<Self::Item> {
        let next = next_batch_bounds(self.range, self.size, self.previous_max)?;
        self.previous_max = Some(next.max_value);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_batch_starts_at_min_value() {
        let next = next_batch_bounds(BatchRange::new(1, 100), 30, None);
        assert_eq!(next, Some(BatchRange::new(1, 30)));
    }

    #[test]
    fn batches_cover_range_in_order() {
        let batches: Vec<_> = BatchRange::new(1, 100).split(30).collect();
        assert_eq!(
            batches,
            vec![
                BatchRange::new(1, 30),
                BatchRange::new(31, 60),
                BatchRange::new(61, 90),
                BatchRange::new(91, 100),
            ]
        );
    }

    #[test]
    fn resumes_after_previous_max() {
        let next = next_batch_bounds(BatchRange::new(1, 100), 30, Some(60));
        assert_eq!(next, Some(BatchRange::new(61, 90)));
    }

    #[test]
    fn no_more_batches_after_max_value() {
        assert_eq!(next_batch_bounds(BatchRange::new(1, 100), 30, Some(100)), None);
        assert_eq!(next_batch_bounds(BatchRange::new(1, 100), 30, Some(250)), None);
    }

    #[test]
    fn single_value_range_yields_one_batch() {
        let batches: Vec<_> = BatchRange::new(7, 7).split(1_000).collect();
        assert_eq!(batches, vec![BatchRange::new(7, 7)]);
    }

    #[test]
    fn previous_max_below_range_starts_at_min_value() {
        let next = next_batch_bounds(BatchRange::new(50, 100), 10, Some(3));
        assert_eq!(next, Some(BatchRange::new(50, 59)));
    }

    #[test]
    fn end_of_i64_domain_does_not_overflow() {
        let range = BatchRange::new(i64::MAX - 5, i64::MAX);
        let batches: Vec<_> = range.split(4).collect();
        assert_eq!(
            batches,
            vec![
                BatchRange::new(i64::MAX - 5, i64::MAX - 2),
                BatchRange::new(i64::MAX - 1, i64::MAX),
            ]
        );
        assert_eq!(next_batch_bounds(range, 4, Some(i64::MAX)), None);
    }

    #[test]
    fn range_len_counts_inclusive_values() {
        assert_eq!(BatchRange::new(1, 100).len(), 100);
        assert_eq!(BatchRange::new(5, 5).len(), 1);
        assert_eq!(BatchRange::new(i64::MIN, i64::MAX).len(), u64::MAX);
        assert!(BatchRange::new(2, 1).is_empty());
    }

    proptest! {
        #[test]
        fn batches_partition_the_range(
            min in -1_000_000i64..1_000_000,
            len in 0i64..50_000,
            size in 1i64..5_000,
        ) {
            let range = BatchRange::new(min, min + len);
            let batches: Vec<_> = range.split(size).collect();

            prop_assert_eq!(batches.first().map(|b| b.min_value), Some(range.min_value));
            prop_assert_eq!(batches.last().map(|b| b.max_value), Some(range.max_value));
            for pair in batches.windows(2) {
                prop_assert_eq!(pair[0].max_value + 1, pair[1].min_value);
            }
            for batch in &batches {
                prop_assert!(batch.len() as i64 <= size);
            }
            let covered: u64 = batches.iter().map(|b| b.len()).sum();
            prop_assert_eq!(covered, range.len());
        }
    }
}
