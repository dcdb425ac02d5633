//! Tier archive: round-robin slots of one tier over a slab.
//!
//! # Design
//!
//! A slot's index is a pure function of its bucket start:
//! `slot_index = (bucket_start / resolution) % capacity`. Buckets exactly
//! `capacity * resolution` seconds apart share a slot, and writing the newer
//! one replaces the older. There is no cursor and no separate eviction pass;
//! a slot whose stored bucket start differs from the incoming sample's is
//! simply reset.

use std::path::Path;

use crate::aggregate::AggregateSlot;
use crate::error::{Result, SlabIoError};
use crate::policy::RetentionTier;
use crate::slab::Slab;

/// Fixed-capacity circular buffer of aggregate slots for one tier.
#[derive(Debug)]
pub struct TierArchive {
    /// Resolution, retention and capacity of this tier.
    tier: RetentionTier,
    /// Backing storage.
    slab: Slab,
}

impl TierArchive {
    /// Creates an empty archive file for `tier`.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError`] if the slab cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, tier: RetentionTier) -> Result<Self> {
        let slab = Slab::create(path, tier.resolution_secs(), tier.capacity())?;
        Ok(Self { tier, slab })
    }

    /// Opens an existing archive file and checks it matches `tier`.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::CorruptedSlab`] if the file's resolution or
    /// capacity differ from the tier's, or any error of [`Slab::open`].
    pub fn open<P: AsRef<Path>>(path: P, tier: RetentionTier) -> Result<Self> {
        let slab = Slab::open(path)?;
        if slab.resolution() != tier.resolution_secs() || slab.capacity() != tier.capacity() {
            return Err(SlabIoError::CorruptedSlab {
                path: slab.path().to_string(),
                reason: format!(
                    "geometry {}s x {} does not match tier '{}' ({}s x {})",
                    slab.resolution(),
                    slab.capacity(),
                    tier,
                    tier.resolution_secs(),
                    tier.capacity()
                ),
            }
            .into());
        }
        Ok(Self { tier, slab })
    }

    /// The tier this archive stores.
    pub fn tier(&self) -> &RetentionTier {
        &self.tier
    }

    /// Bucket width in seconds.
    pub fn resolution(&self) -> u64 {
        self.tier.resolution_secs()
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.tier.capacity()
    }

    /// Start of the bucket containing `timestamp`.
    pub fn bucket_start(&self, timestamp: u64) -> u64 {
        timestamp - timestamp % self.resolution()
    }

    /// Slot index of the bucket starting at `bucket_start`.
    #[allow(clippy::cast_possible_truncation)] // the modulo result is < capacity, a u32
    pub fn slot_index(&self, bucket_start: u64) -> u32 {
        ((bucket_start / self.resolution()) % u64::from(self.capacity())) as u32
    }

    /// Folds a sample into its bucket, resetting the slot if it held a
    /// different bucket. Returns the slot index written.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError`] if the slot cannot be written.
    pub fn apply(&mut self, timestamp: u64, value: f64) -> Result<u32> {
        let bucket_start = self.bucket_start(timestamp);
        let index = self.slot_index(bucket_start);

        let mut slot = self.slab.read_slot(index)?;
        if !slot.is_empty() && slot.bucket_start == bucket_start {
            slot.add(value);
        } else {
            slot = AggregateSlot::from_sample(bucket_start, value);
        }

        self.slab.write_slot(index, &slot)?;
        Ok(index)
    }

    /// Reads one slot.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SlotOutOfBounds`] for an invalid index.
    pub fn slot(&self, index: u32) -> Result<AggregateSlot> {
        self.slab.read_slot(index)
    }

    /// Populated slots whose bucket start lies in `[start, end)`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError`] if a slot cannot be read.
    pub fn range(&self, start: u64, end: u64) -> Result<Vec<AggregateSlot>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let resolution = self.resolution();
        let first = start.div_ceil(resolution).saturating_mul(resolution);
        let buckets = if first >= end {
            0
        } else {
            (end - first).div_ceil(resolution)
        };

        let mut slots = Vec::new();
        if buckets <= u64::from(self.capacity()) {
            // Walk the requested buckets directly; already in order.
            let mut bucket_start = first;
            for _ in 0..buckets {
                let slot = self.slab.read_slot(self.slot_index(bucket_start))?;
                if !slot.is_empty() && slot.bucket_start == bucket_start {
                    slots.push(slot);
                }
                bucket_start = bucket_start.saturating_add(resolution);
            }
        } else {
            // The range covers more than one lap of the ring: scan every slot.
            for index in 0..self.capacity() {
                let slot = self.slab.read_slot(index)?;
                if !slot.is_empty() && slot.bucket_start >= start && slot.bucket_start < end {
                    slots.push(slot);
                }
            }
            slots.sort_by_key(|s| s.bucket_start);
        }
        Ok(slots)
    }

    /// Last `(timestamp, value)` recorded in this archive's header.
    pub fn last_update(&self) -> Option<(u64, f64)> {
        self.slab.last_update()
    }

    /// Records the last `(timestamp, value)` in this archive's header.
    pub fn set_last_update(&mut self, timestamp: u64, value: f64) {
        self.slab.set_last_update(timestamp, value);
    }

    /// Flushes one slot to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SyncFailed`] if the flush fails.
    pub fn sync_slot(&self, index: u32) -> Result<()> {
        self.slab.sync_slot(index)
    }

    /// Flushes the whole archive to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SyncFailed`] if the flush fails.
    pub fn sync(&self) -> Result<()> {
        self.slab.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetentionPolicy;

    fn tier(policy: &str) -> RetentionTier {
        *RetentionPolicy::parse(policy).unwrap().finest()
    }

    fn archive(dir: &tempfile::TempDir, policy: &str) -> TierArchive {
        TierArchive::create(dir.path().join("tier.slab"), tier(policy)).unwrap()
    }

    #[test]
    fn test_slot_arithmetic() {
        let temp_dir = tempfile::tempdir().unwrap();
        let archive = archive(&temp_dir, "10 secs for 1 min");

        assert_eq!(archive.capacity(), 6);
        assert_eq!(archive.bucket_start(1_700_000_007), 1_700_000_000);
        assert_eq!(archive.bucket_start(1_700_000_010), 1_700_000_010);
        assert_eq!(archive.slot_index(0), 0);
        assert_eq!(archive.slot_index(50), 5);
        assert_eq!(archive.slot_index(60), 0);
    }

    #[test]
    fn test_apply_accumulates_within_bucket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&temp_dir, "10 secs for 1 min");

        archive.apply(100, 1.0).unwrap();
        archive.apply(105, 3.0).unwrap();
        let index = archive.apply(109, 2.0).unwrap();

        let slot = archive.slot(index).unwrap();
        assert_eq!(slot.bucket_start, 100);
        assert_eq!(slot.count, 3);
        assert_eq!(slot.sum, 6.0);
        assert_eq!(slot.sum_sqr, 14.0);
        assert_eq!(slot.min, 1.0);
        assert_eq!(slot.max, 3.0);
    }

    #[test]
    fn test_wraparound_keeps_last_capacity_buckets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&temp_dir, "1 sec for 10 secs");
        let capacity = u64::from(archive.capacity());
        let k = 4;

        for ts in 0..capacity + k {
            archive.apply(1000 + ts, 1.0).unwrap();
        }

        let slots = archive.range(0, u64::MAX).unwrap();
        let starts: Vec<u64> = slots.iter().map(|s| s.bucket_start).collect();
        let expected: Vec<u64> = (k..capacity + k).map(|ts| 1000 + ts).collect();
        assert_eq!(starts, expected);
    }

    #[test]
    fn test_old_sample_overwrites_wrapped_slot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&temp_dir, "1 sec for 10 secs");

        archive.apply(1010, 5.0).unwrap();
        // 1000 aliases to the same slot as 1010 and replaces it.
        archive.apply(1000, 1.0).unwrap();

        let slots = archive.range(0, u64::MAX).unwrap();
        assert_eq!(slots, vec![AggregateSlot::from_sample(1000, 1.0)]);
    }

    #[test]
    fn test_range_bounds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&temp_dir, "10 secs for 10 mins");

        for ts in (1000..1100).step_by(5) {
            archive.apply(ts, 1.0).unwrap();
        }

        // Half-open on the end, and buckets starting before `start` excluded.
        let starts: Vec<u64> = archive
            .range(1005, 1050)
            .unwrap()
            .iter()
            .map(|s| s.bucket_start)
            .collect();
        assert_eq!(starts, vec![1010, 1020, 1030, 1040]);

        assert!(archive.range(1050, 1050).unwrap().is_empty());
        assert!(archive.range(1060, 1050).unwrap().is_empty());
        assert!(archive.range(5000, 6000).unwrap().is_empty());
    }

    #[test]
    fn test_range_wider_than_ring_is_sorted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&temp_dir, "1 sec for 5 secs");

        // Fill out of slot order: 1003 lands in slot 3, 1006 in slot 1.
        for ts in [1006, 1003, 1004, 1005, 1007] {
            archive.apply(ts, 1.0).unwrap();
        }

        let starts: Vec<u64> = archive
            .range(0, 10_000)
            .unwrap()
            .iter()
            .map(|s| s.bucket_start)
            .collect();
        assert_eq!(starts, vec![1003, 1004, 1005, 1006, 1007]);
    }

    #[test]
    fn test_open_rejects_mismatched_tier() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("tier.slab");
        drop(TierArchive::create(&path, tier("1 sec for 10 secs")).unwrap());

        assert!(TierArchive::open(&path, tier("1 sec for 10 secs")).is_ok());
        let err = TierArchive::open(&path, tier("1 sec for 20 secs")).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
