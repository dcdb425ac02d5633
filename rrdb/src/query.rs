//! Range queries over a metric's tiers.
//!
//! # Tier Selection
//!
//! A query asks for a granularity `g`: the `GROUP BY` interval, or the
//! finest resolution when none is given. The tier used is the one with the
//! largest resolution not exceeding `g` (the finest tier when every
//! resolution is larger than `g`).
//!
//! # Output
//!
//! When `g` does not exceed the tier's resolution, each populated bucket is
//! returned as is, with its raw sufficient statistics:
//!
//! ```text
//! ts,count,sum,sum_sqr,min,max
//! ```
//!
//! Otherwise buckets are merged into `floor(bucket_start / g) * g` groups and
//! returned with derived statistics:
//!
//! ```text
//! ts,count,sum,avg,stddev,min,max
//! ```
//!
//! # Number Formatting
//!
//! `ts` and `count` print as unsigned integers. Floating point fields print
//! the shortest text that parses back to the same `f64`, with no fractional
//! part for integral values (`30`, not `30.0`) and `-0` folded to `0`.

use std::fmt;

use crate::aggregate::AggregateSlot;
use crate::archive::TierArchive;
use crate::duration::Duration;
use crate::error::Result;

/// CSV header of raw (unmerged) rows.
pub const RAW_HEADER: &str = "ts,count,sum,sum_sqr,min,max";

/// CSV header of merged rows.
pub const MERGED_HEADER: &str = "ts,count,sum,avg,stddev,min,max";

/// Shape of the rows in a [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// Native buckets with raw sufficient statistics.
    Raw,
    /// Merged buckets with derived statistics.
    Merged,
}

/// Result of a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Row layout.
    format: RowFormat,
    /// Rows in ascending bucket order; `bucket_start` holds the row timestamp.
    rows: Vec<AggregateSlot>,
    /// Which tier index was used for this query.
    tier_used: usize,
    /// Output granularity in seconds.
    granularity: u64,
    /// The requested time range.
    requested_range: (u64, u64),
}

impl QueryResult {
    /// Row layout of this result.
    pub fn format(&self) -> RowFormat {
        self.format
    }

    /// CSV header line, without the trailing newline.
    pub fn header(&self) -> &'static str {
        match self.format {
            RowFormat::Raw => RAW_HEADER,
            RowFormat::Merged => MERGED_HEADER,
        }
    }

    /// The result rows.
    pub fn rows(&self) -> &[AggregateSlot] {
        &self.rows
    }

    /// Which tier index was used.
    pub fn tier_used(&self) -> usize {
        self.tier_used
    }

    /// Width of one output row in seconds.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// The time range that was requested, `[start, end)`.
    pub fn requested_range(&self) -> (u64, u64) {
        self.requested_range
    }

    /// Returns `true` if no bucket was populated in the range.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Renders the result as newline-terminated CSV lines.
    pub fn to_csv(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header())?;
        for row in &self.rows {
            match self.format {
                RowFormat::Raw => writeln!(
                    f,
                    "{},{},{},{},{},{}",
                    row.bucket_start,
                    row.count,
                    format_value(row.sum),
                    format_value(row.sum_sqr),
                    format_value(row.min),
                    format_value(row.max),
                )?,
                RowFormat::Merged => writeln!(
                    f,
                    "{},{},{},{},{},{},{}",
                    row.bucket_start,
                    row.count,
                    format_value(row.sum),
                    format_value(row.avg()),
                    format_value(row.stddev()),
                    format_value(row.min),
                    format_value(row.max),
                )?,
            }
        }
        Ok(())
    }
}

/// Formats a floating point field for protocol output.
pub fn format_value(value: f64) -> String {
    if value == 0.0 {
        // Also catches -0.0.
        return "0".to_string();
    }
    // `Display` for f64 never uses exponents and omits `.0` on integers.
    value.to_string()
}

/// Picks the tier for granularity `g`: the largest resolution `<= g`,
/// falling back to the finest tier.
pub fn select_tier(tiers: &[TierArchive], granularity: u64) -> usize {
    tiers
        .iter()
        .rposition(|t| t.resolution() <= granularity)
        .unwrap_or(0)
}

/// Runs a range query over `tiers` (finest first).
///
/// # Errors
///
/// Returns an error if a slot cannot be read.
pub fn select(
    tiers: &[TierArchive],
    start: u64,
    end: u64,
    group_by: Option<Duration>,
) -> Result<QueryResult> {
    let Some(finest) = tiers.first() else {
        return Ok(QueryResult {
            format: RowFormat::Raw,
            rows: Vec::new(),
            tier_used: 0,
            granularity: 0,
            requested_range: (start, end),
        });
    };

    let granularity = group_by.map_or(finest.resolution(), |d| d.to_seconds());
    let tier_used = select_tier(tiers, granularity);
    let archive = &tiers[tier_used];
    let native = archive.range(start, end)?;

    if granularity <= archive.resolution() {
        return Ok(QueryResult {
            format: RowFormat::Raw,
            rows: native,
            tier_used,
            granularity: archive.resolution(),
            requested_range: (start, end),
        });
    }

    Ok(QueryResult {
        format: RowFormat::Merged,
        rows: merge_buckets(&native, granularity),
        tier_used,
        granularity,
        requested_range: (start, end),
    })
}

/// Merges ascending native buckets into groups of `granularity` seconds.
pub fn merge_buckets(native: &[AggregateSlot], granularity: u64) -> Vec<AggregateSlot> {
    let mut merged: Vec<AggregateSlot> = Vec::new();
    for slot in native {
        let group_start = slot.bucket_start - slot.bucket_start % granularity;
        match merged.last_mut() {
            Some(last) if last.bucket_start == group_start => last.merge(slot),
            _ => {
                let mut group = AggregateSlot {
                    bucket_start: group_start,
                    ..AggregateSlot::EMPTY
                };
                group.merge(slot);
                merged.push(group);
            }
        }
    }
    merged
}
