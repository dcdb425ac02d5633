//! Memory-mapped slab file holding the slots of one tier.
//!
//! # File Format
//!
//! ```text
//! [0..64)                 Header
//! [64..64+128*capacity)   Slots, each two 64-byte record copies (A, B)
//! ```
//!
//! Header:
//!
//! ```text
//! [0..4)    magic "RRDB"
//! [4..8)    version (u32)
//! [8..16)   resolution in seconds (u64)
//! [16..20)  capacity (u32)
//! [24..32)  last update timestamp (u64)
//! [32..40)  last update value (f64)
//! [40..44)  last update present flag (u32)
//! [44..48)  CRC32 of [24..44)
//! ```
//!
//! Record:
//!
//! ```text
//! [0..8)    sequence number (u64, 0 = never written)
//! [8..16)   bucket_start (u64)
//! [16..24)  count (u64)
//! [24..56)  sum, sum_sqr, min, max (f64)
//! [56..60)  CRC32 of [0..56)
//! ```
//!
//! All integers are little-endian.
//!
//! # Crash Safety
//!
//! A slot update never touches the record that is currently valid. It writes
//! the other copy with the next sequence number, and the CRC decides whether
//! that copy is complete. On read the valid copy with the highest sequence
//! number wins, so a write torn by a crash leaves the previous aggregate in
//! place.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::aggregate::AggregateSlot;
use crate::error::{Result, SlabIoError};

/// Magic bytes identifying an rrdb slab file.
const SLAB_MAGIC: [u8; 4] = *b"RRDB";

/// Current slab format version.
const SLAB_VERSION: u32 = 1;

/// Size of the slab header in bytes.
const HEADER_SIZE: usize = 64;

/// Size of one record copy in bytes.
const RECORD_SIZE: usize = 64;

/// Size of one slot (two record copies) in bytes.
const SLOT_SIZE: usize = 2 * RECORD_SIZE;

/// Offset of the CRC within a record; the CRC covers everything before it.
const RECORD_CRC_OFFSET: usize = 56;

/// Byte range of the last-update block inside the header.
const LAST_UPDATE_OFFSET: usize = 24;
const LAST_UPDATE_CRC_OFFSET: usize = 44;

/// Helper for computing slab layout sizes and offsets.
#[derive(Debug, Clone, Copy)]
struct SlabLayout {
    /// Number of slots.
    capacity: u32,
    /// Total file size in bytes.
    file_size: usize,
}

impl SlabLayout {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            file_size: HEADER_SIZE + capacity as usize * SLOT_SIZE,
        }
    }

    /// Byte offset of record copy `copy` (0 or 1) of slot `index`.
    fn record_offset(&self, index: u32, copy: usize) -> usize {
        HEADER_SIZE + index as usize * SLOT_SIZE + copy * RECORD_SIZE
    }
}

/// A decoded, checksum-verified record copy.
#[derive(Debug, Clone, Copy)]
struct Record {
    seq: u64,
    slot: AggregateSlot,
}

impl Record {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        put_u64(&mut buf, 0, self.seq);
        put_u64(&mut buf, 8, self.slot.bucket_start);
        put_u64(&mut buf, 16, self.slot.count);
        put_u64(&mut buf, 24, self.slot.sum.to_bits());
        put_u64(&mut buf, 32, self.slot.sum_sqr.to_bits());
        put_u64(&mut buf, 40, self.slot.min.to_bits());
        put_u64(&mut buf, 48, self.slot.max.to_bits());
        let crc = crc32fast::hash(&buf[..RECORD_CRC_OFFSET]);
        buf[RECORD_CRC_OFFSET..RECORD_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a record, returning `None` for never-written or torn copies.
    fn decode(bytes: &[u8]) -> Option<Self> {
        let seq = get_u64(bytes, 0);
        if seq == 0 {
            return None;
        }
        let crc = get_u32(bytes, RECORD_CRC_OFFSET);
        if crc != crc32fast::hash(&bytes[..RECORD_CRC_OFFSET]) {
            return None;
        }
        Some(Self {
            seq,
            slot: AggregateSlot {
                bucket_start: get_u64(bytes, 8),
                count: get_u64(bytes, 16),
                sum: f64::from_bits(get_u64(bytes, 24)),
                sum_sqr: f64::from_bits(get_u64(bytes, 32)),
                min: f64::from_bits(get_u64(bytes, 40)),
                max: f64::from_bits(get_u64(bytes, 48)),
            },
        })
    }
}

/// Memory-mapped slab file storing the slots of one tier.
///
/// # Thread Safety
///
/// A slab has a single writer. Callers serialize access (the owning metric
/// sits behind a mutex), which also guarantees readers never observe a
/// record mid-write.
#[derive(Debug)]
pub struct Slab {
    /// Memory mapping of the slab file.
    mmap: MmapMut,
    /// Pre-computed layout information.
    layout: SlabLayout,
    /// Bucket width in seconds.
    resolution: u64,
    /// Path to the slab file (for error reporting).
    path: String,
}

impl Slab {
    /// Creates a new slab file with every slot empty. An existing file at
    /// `path` is never reused.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::WriteFailed`] if the file already exists or
    /// if creation or memory mapping fails.
    pub fn create<P: AsRef<Path>>(path: P, resolution: u64, capacity: u32) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();
        let layout = SlabLayout::new(capacity);

        let write_failed = |source| SlabIoError::WriteFailed {
            path: path_str.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(write_failed)?;

        // A freshly extended file reads as zeros, which decodes as empty slots.
        file.set_len(layout.file_size as u64).map_err(write_failed)?;

        // SAFETY: The file was just created with the correct size and this
        // process holds the only handle to it.
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(write_failed)? };

        mmap[0..4].copy_from_slice(&SLAB_MAGIC);
        put_u32(&mut mmap, 4, SLAB_VERSION);
        put_u64(&mut mmap, 8, resolution);
        put_u32(&mut mmap, 16, capacity);

        let slab = Self {
            mmap,
            layout,
            resolution,
            path: path_str,
        };
        slab.sync()?;
        Ok(slab)
    }

    /// Opens an existing slab file and validates its header and size.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError`] if the file cannot be opened or mapped, or
    /// if it is corrupted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let read_failed = |source| SlabIoError::ReadFailed {
            path: path_str.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(read_failed)?;

        // SAFETY: The file was successfully opened read/write. Slab files
        // are only ever made with `create_new`, and a metric directory is
        // not recreated while its slabs are mapped, so nothing truncates
        // the file under this mapping.
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(read_failed)? };

        let corrupted = |reason: String| SlabIoError::CorruptedSlab {
            path: path_str.clone(),
            reason,
        };

        if mmap.len() < HEADER_SIZE {
            return Err(corrupted(format!(
                "file too small: {} bytes, expected at least {}",
                mmap.len(),
                HEADER_SIZE
            ))
            .into());
        }

        if mmap[0..4] != SLAB_MAGIC {
            return Err(corrupted(format!(
                "invalid magic bytes: expected {:?}, found {:?}",
                SLAB_MAGIC,
                &mmap[0..4]
            ))
            .into());
        }

        let version = get_u32(&mmap, 4);
        if version != SLAB_VERSION {
            return Err(corrupted(format!(
                "unsupported version: expected {SLAB_VERSION}, found {version}"
            ))
            .into());
        }

        let resolution = get_u64(&mmap, 8);
        let capacity = get_u32(&mmap, 16);
        if resolution == 0 || capacity == 0 {
            return Err(corrupted(format!(
                "invalid geometry: resolution {resolution}, capacity {capacity}"
            ))
            .into());
        }

        let layout = SlabLayout::new(capacity);
        if mmap.len() != layout.file_size {
            return Err(corrupted(format!(
                "file size mismatch: {} bytes, expected {}",
                mmap.len(),
                layout.file_size
            ))
            .into());
        }

        Ok(Self {
            mmap,
            layout,
            resolution,
            path: path_str,
        })
    }

    /// Bucket width in seconds.
    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    /// Returns the path to this slab file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the current aggregate of a slot.
    ///
    /// A slot with no valid record copy reads as [`AggregateSlot::EMPTY`].
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SlotOutOfBounds`] if `index >= capacity`.
    pub fn read_slot(&self, index: u32) -> Result<AggregateSlot> {
        self.check_bounds(index)?;
        Ok(self
            .active_record(index)
            .map_or(AggregateSlot::EMPTY, |(_, record)| record.slot))
    }

    /// Replaces the aggregate of a slot.
    ///
    /// The record copy that is not currently valid is overwritten, so the
    /// previous aggregate survives until the new one is complete.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SlotOutOfBounds`] if `index >= capacity`.
    pub fn write_slot(&mut self, index: u32, slot: &AggregateSlot) -> Result<()> {
        self.check_bounds(index)?;
        let (target, seq) = match self.active_record(index) {
            Some((copy, record)) => (1 - copy, record.seq + 1),
            None => (0, 1),
        };

        let bytes = Record { seq, slot: *slot }.encode();
        let offset = self.layout.record_offset(index, target);
        self.mmap[offset..offset + RECORD_SIZE].copy_from_slice(&bytes);
        Ok(())
    }

    /// Returns the last `(timestamp, value)` stored in the header, if any.
    pub fn last_update(&self) -> Option<(u64, f64)> {
        if get_u32(&self.mmap, 40) != 1 {
            return None;
        }
        let crc = get_u32(&self.mmap, LAST_UPDATE_CRC_OFFSET);
        if crc != crc32fast::hash(&self.mmap[LAST_UPDATE_OFFSET..LAST_UPDATE_CRC_OFFSET]) {
            return None;
        }
        Some((
            get_u64(&self.mmap, 24),
            f64::from_bits(get_u64(&self.mmap, 32)),
        ))
    }

    /// Stores the last `(timestamp, value)` in the header.
    pub fn set_last_update(&mut self, timestamp: u64, value: f64) {
        put_u64(&mut self.mmap, 24, timestamp);
        put_u64(&mut self.mmap, 32, value.to_bits());
        put_u32(&mut self.mmap, 40, 1);
        let crc = crc32fast::hash(&self.mmap[LAST_UPDATE_OFFSET..LAST_UPDATE_CRC_OFFSET]);
        put_u32(&mut self.mmap, LAST_UPDATE_CRC_OFFSET, crc);
    }

    /// Flushes one slot and the header to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SyncFailed`] if the flush fails.
    pub fn sync_slot(&self, index: u32) -> Result<()> {
        self.check_bounds(index)?;
        let offset = self.layout.record_offset(index, 0);
        self.mmap
            .flush_range(0, HEADER_SIZE)
            .and_then(|()| self.mmap.flush_range(offset, SLOT_SIZE))
            .map_err(|e| {
                SlabIoError::SyncFailed {
                    path: self.path.clone(),
                    source: e,
                }
                .into()
            })
    }

    /// Syncs the whole memory mapping to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SyncFailed`] if the sync operation fails.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| {
            SlabIoError::SyncFailed {
                path: self.path.clone(),
                source: e,
            }
            .into()
        })
    }

    /// Finds the valid record copy with the highest sequence number.
    fn active_record(&self, index: u32) -> Option<(usize, Record)> {
        let decode = |copy: usize| {
            let offset = self.layout.record_offset(index, copy);
            Record::decode(&self.mmap[offset..offset + RECORD_SIZE]).map(|r| (copy, r))
        };
        match (decode(0), decode(1)) {
            (Some(a), Some(b)) => Some(if b.1.seq > a.1.seq { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    fn check_bounds(&self, index: u32) -> Result<()> {
        if index >= self.layout.capacity {
            return Err(SlabIoError::SlotOutOfBounds {
                path: self.path.clone(),
                index,
                capacity: self.layout.capacity,
            }
            .into());
        }
        Ok(())
    }
}

fn get_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
