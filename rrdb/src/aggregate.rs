//! Sufficient statistics for one bucket of one tier.
//!
//! A bucket never keeps raw samples. `(count, sum, sum_sqr, min, max)` is
//! enough to combine buckets associatively and to derive mean and standard
//! deviation afterwards.

/// Aggregate of all samples that fell into one bucket.
///
/// `count == 0` marks an empty slot; the other fields are then meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AggregateSlot {
    /// Start of the bucket, `floor(ts / resolution) * resolution`.
    pub bucket_start: u64,
    /// Number of samples.
    pub count: u64,
    /// Sum of sample values.
    pub sum: f64,
    /// Sum of squared sample values.
    pub sum_sqr: f64,
    /// Smallest sample value.
    pub min: f64,
    /// Largest sample value.
    pub max: f64,
}

impl AggregateSlot {
    /// An empty slot.
    pub const EMPTY: Self = Self {
        bucket_start: 0,
        count: 0,
        sum: 0.0,
        sum_sqr: 0.0,
        min: 0.0,
        max: 0.0,
    };

    /// A fresh aggregate holding a single sample.
    pub fn from_sample(bucket_start: u64, value: f64) -> Self {
        Self {
            bucket_start,
            count: 1,
            sum: value,
            sum_sqr: value * value,
            min: value,
            max: value,
        }
    }

    /// Returns `true` if no sample has been recorded.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Folds one more sample of the same bucket into the aggregate.
    pub fn add(&mut self, value: f64) {
        if self.is_empty() {
            *self = Self::from_sample(self.bucket_start, value);
            return;
        }
        self.count += 1;
        self.sum += value;
        self.sum_sqr += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Combines another aggregate into this one.
    ///
    /// The bucket start of `self` is kept; callers merging native buckets
    /// into a coarser output bucket set it beforehand.
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sqr += other.sum_sqr;
    }

    /// Mean of the samples; 0 for an empty slot.
    #[allow(clippy::cast_precision_loss)] // counts beyond 2^53 are not realistic
    pub fn avg(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Population standard deviation, `sqrt(max(0, sum_sqr/count - avg^2))`.
    #[allow(clippy::cast_precision_loss)]
    pub fn stddev(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let avg = self.avg();
        let variance = self.sum_sqr / self.count as f64 - avg * avg;
        variance.max(0.0).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accumulates() {
        let mut slot = AggregateSlot::from_sample(100, 2.0);
        slot.add(4.0);
        slot.add(-1.0);

        assert_eq!(slot.bucket_start, 100);
        assert_eq!(slot.count, 3);
        assert_eq!(slot.sum, 5.0);
        assert_eq!(slot.sum_sqr, 21.0);
        assert_eq!(slot.min, -1.0);
        assert_eq!(slot.max, 4.0);
    }

    #[test]
    fn test_add_to_empty_slot() {
        let mut slot = AggregateSlot {
            bucket_start: 60,
            ..AggregateSlot::EMPTY
        };
        slot.add(-3.0);
        assert_eq!(slot, AggregateSlot::from_sample(60, -3.0));
    }

    #[test]
    fn test_merge_two_buckets() {
        let mut merged = AggregateSlot {
            bucket_start: 0,
            count: 2,
            sum: 3.0,
            sum_sqr: 5.0,
            min: 1.0,
            max: 2.0,
        };
        merged.merge(&AggregateSlot {
            bucket_start: 1,
            count: 1,
            sum: 2.0,
            sum_sqr: 4.0,
            min: 2.0,
            max: 2.0,
        });

        assert_eq!(merged.bucket_start, 0);
        assert_eq!(merged.count, 3);
        assert_eq!(merged.sum, 5.0);
        assert_eq!(merged.sum_sqr, 9.0);
        assert_eq!(merged.avg(), 5.0 / 3.0);
        let expected = (9.0 / 3.0 - (5.0f64 / 3.0).powi(2)).sqrt();
        assert!((merged.stddev() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_merge_into_empty_takes_min_max() {
        let mut merged = AggregateSlot::EMPTY;
        merged.merge(&AggregateSlot::from_sample(10, 7.5));
        assert_eq!(merged.count, 1);
        assert_eq!(merged.min, 7.5);
        assert_eq!(merged.max, 7.5);

        merged.merge(&AggregateSlot::EMPTY);
        assert_eq!(merged.count, 1);
    }

    #[test]
    fn test_constant_series_has_zero_stddev() {
        let mut slot = AggregateSlot::from_sample(0, 1.0);
        for _ in 0..29 {
            slot.add(1.0);
        }
        assert_eq!(slot.avg(), 1.0);
        assert_eq!(slot.stddev(), 0.0);
    }

    #[test]
    fn test_empty_stats() {
        assert_eq!(AggregateSlot::EMPTY.avg(), 0.0);
        assert_eq!(AggregateSlot::EMPTY.stddev(), 0.0);
    }
}
