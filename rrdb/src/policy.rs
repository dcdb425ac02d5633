//! Retention policies: the ordered tiers a metric is stored at.
//!
//! A policy is written as comma-separated `<resolution> for <retention>`
//! clauses, finest resolution first:
//!
//! ```rust
//! use rrdb::policy::RetentionPolicy;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy: RetentionPolicy = "1 sec for 10 sec, 10 secs for 30 secs, 30 secs for 10 min".parse()?;
//! assert_eq!(policy.tiers().len(), 3);
//! assert_eq!(
//!     policy.to_string(),
//!     "1 sec for 10 secs, 10 secs for 30 secs, 30 secs for 10 mins"
//! );
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::duration::{Duration, TimeUnit};
use crate::error::{PolicyError, Result};

/// Maximum number of slots allowed in any single tier.
///
/// Each slot takes 128 bytes on disk, so this caps a tier file at ~1.3 GB.
pub const MAX_SLOTS_PER_TIER: u64 = 10_000_000;

/// One resolution/retention pair within a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetentionTier {
    resolution: Duration,
    retention: Duration,
    capacity: u32,
}

impl RetentionTier {
    /// Width of one bucket.
    pub const fn resolution(&self) -> Duration {
        self.resolution
    }

    /// How long data survives in this tier.
    pub const fn retention(&self) -> Duration {
        self.retention
    }

    /// Bucket width in seconds; always > 0.
    pub const fn resolution_secs(&self) -> u64 {
        self.resolution.to_seconds()
    }

    /// Retention in seconds.
    pub const fn retention_secs(&self) -> u64 {
        self.retention.to_seconds()
    }

    /// Number of slots, `ceil(retention / resolution)`.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.resolution, self.retention)
    }
}

/// Ordered tiers, strictly increasing in resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RetentionPolicy {
    tiers: Vec<RetentionTier>,
}

impl RetentionPolicy {
    /// Builds and validates a policy from `(resolution, retention)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if there are no tiers, a tier retains less
    /// than one bucket, resolutions are not strictly increasing, or a tier
    /// would exceed [`MAX_SLOTS_PER_TIER`].
    pub fn from_tiers(pairs: &[(Duration, Duration)]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(PolicyError::NoTiers.into());
        }

        let mut tiers = Vec::with_capacity(pairs.len());
        for (index, &(resolution, retention)) in pairs.iter().enumerate() {
            let res = resolution.to_seconds();
            let ret = retention.to_seconds();
            if res == 0 || ret < res {
                return Err(PolicyError::RetentionTooShort {
                    resolution: resolution.to_string(),
                    retention: retention.to_string(),
                }
                .into());
            }

            let slot_count = ret.div_ceil(res);
            let capacity = u32::try_from(slot_count)
                .ok()
                .filter(|_| slot_count <= MAX_SLOTS_PER_TIER)
                .ok_or(PolicyError::TooManySlots {
                    tier: index,
                    slot_count,
                    max_slots: MAX_SLOTS_PER_TIER,
                })?;

            tiers.push(RetentionTier {
                resolution,
                retention,
                capacity,
            });
        }

        for window in tiers.windows(2) {
            if window[0].resolution_secs() >= window[1].resolution_secs() {
                return Err(PolicyError::TiersNotOrdered {
                    previous: window[0].resolution.to_string(),
                    current: window[1].resolution.to_string(),
                }
                .into());
            }
        }

        Ok(Self { tiers })
    }

    /// Parses policy text such as `"5 secs for 30 secs, 10 secs for 1 min"`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::MalformedClause`] when a clause is not
    /// `<duration> for <duration>`, a [`crate::error::ParseError`] when a
    /// duration is malformed, and the validation errors of
    /// [`RetentionPolicy::from_tiers`].
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PolicyError::NoTiers.into());
        }

        let mut pairs = Vec::new();
        for clause in text.split(',') {
            let tokens: Vec<&str> = clause.split_whitespace().collect();
            let split = tokens
                .iter()
                .position(|t| t.eq_ignore_ascii_case("for"))
                .filter(|&pos| pos > 0 && pos + 1 < tokens.len())
                .ok_or_else(|| PolicyError::MalformedClause {
                    clause: clause.trim().to_string(),
                })?;

            let resolution = Duration::parse(&tokens[..split].join(" "))?;
            let retention = Duration::parse(&tokens[split + 1..].join(" "))?;
            pairs.push((resolution, retention));
        }

        Self::from_tiers(&pairs)
    }

    /// Tiers from finest to coarsest.
    pub fn tiers(&self) -> &[RetentionTier] {
        &self.tiers
    }

    /// The finest tier.
    ///
    /// # Panics
    ///
    /// Never panics: a validated policy always has at least one tier.
    pub fn finest(&self) -> &RetentionTier {
        &self.tiers[0]
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tier) in self.tiers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{tier}")?;
        }
        Ok(())
    }
}

/// `1 min for 1 day`: the policy of metrics created implicitly by an update.
impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![RetentionTier {
                resolution: Duration::new(1, TimeUnit::Minute),
                retention: Duration::new(1, TimeUnit::Day),
                capacity: 1_440,
            }],
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = crate::RrdbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RetentionPolicy {
    type Error = crate::RrdbError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RetentionPolicy> for String {
    fn from(value: RetentionPolicy) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_and_render() {
        let policy =
            RetentionPolicy::parse("1 sec for 10 sec, 10 secs for 30 secs, 30 secs for 10 min")
                .unwrap();
        assert_eq!(
            policy.to_string(),
            "1 sec for 10 secs, 10 secs for 30 secs, 30 secs for 10 mins"
        );

        let tiers = policy.tiers();
        assert_eq!(tiers[0].resolution_secs(), 1);
        assert_eq!(tiers[0].capacity(), 10);
        assert_eq!(tiers[1].resolution_secs(), 10);
        assert_eq!(tiers[1].capacity(), 3);
        assert_eq!(tiers[2].resolution_secs(), 30);
        assert_eq!(tiers[2].capacity(), 20);
    }

    #[test]
    fn test_render_is_idempotent() {
        let inputs = [
            "5 secs for 1 min",
            "1 MIN FOR 1 DAY, 1 hour for 1 month",
            "5 secs for 10 sec, 1 min for 10 min, 10 min for 10 day, 1 day for 1 year",
        ];
        for text in inputs {
            let once = RetentionPolicy::parse(text).unwrap().to_string();
            let twice = RetentionPolicy::parse(&once).unwrap().to_string();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.to_string(), "1 min for 1 day");
        assert_eq!(policy, RetentionPolicy::parse("1 min for 1 day").unwrap());
    }

    #[test]
    fn test_capacity_rounds_up() {
        let policy = RetentionPolicy::parse("5 secs for 12 secs").unwrap();
        assert_eq!(policy.finest().capacity(), 3);
    }

    #[test]
    fn test_rejects_unordered_tiers() {
        let err = RetentionPolicy::parse("10 secs for 1 min, 5 secs for 1 hour").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);

        let err = RetentionPolicy::parse("1 min for 1 hour, 60 secs for 1 day").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }

    #[test]
    fn test_rejects_short_retention() {
        let err = RetentionPolicy::parse("1 min for 10 secs").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }

    #[test]
    fn test_rejects_malformed_clauses() {
        for text in ["", "   ", "1 sec", "for 1 min", "1 sec for", "1 sec for 1 min,"] {
            let err = RetentionPolicy::parse(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPolicy, "{text:?}");
        }

        let err = RetentionPolicy::parse("1 blink for 1 min").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_rejects_too_many_slots() {
        let err = RetentionPolicy::parse("1 sec for 100 years").unwrap_err();
        assert!(err.to_string().contains("slots"));
    }

    #[test]
    fn test_serde_as_text() {
        let policy = RetentionPolicy::parse("1 min for 1 day").unwrap();
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, "\"1 min for 1 day\"");
        let back: RetentionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
