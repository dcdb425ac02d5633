//! Duration literals such as `10 secs` or `1 year`.
//!
//! A [`Duration`] keeps the unit it was written with so that policies render
//! back in the user's terms. Conversion to seconds uses fixed calendar
//! approximations: a month is 30 days and a year is 365 days.
//!
//! ```rust
//! use rrdb::duration::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let d: Duration = "10 MINUTES".parse()?;
//! assert_eq!(d.to_seconds(), 600);
//! assert_eq!(d.to_string(), "10 mins");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// Calendar unit of a [`Duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeUnit {
    /// One second.
    Second,
    /// 60 seconds.
    Minute,
    /// 3600 seconds.
    Hour,
    /// 86400 seconds.
    Day,
    /// 7 days.
    Week,
    /// 30 days.
    Month,
    /// 365 days.
    Year,
}

impl TimeUnit {
    /// Number of seconds in one unit.
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
            Self::Month => 30 * 86_400,
            Self::Year => 365 * 86_400,
        }
    }

    /// Canonical singular spelling used when rendering.
    pub const fn singular(self) -> &'static str {
        match self {
            Self::Second => "sec",
            Self::Minute => "min",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Looks up a unit by any accepted spelling, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let unit = match name.to_ascii_lowercase().as_str() {
            "sec" | "secs" | "second" | "seconds" => Self::Second,
            "min" | "mins" | "minute" | "minutes" => Self::Minute,
            "hour" | "hours" | "hr" | "hrs" => Self::Hour,
            "day" | "days" => Self::Day,
            "week" | "weeks" => Self::Week,
            "month" | "months" => Self::Month,
            "year" | "years" => Self::Year,
            _ => return None,
        };
        Some(unit)
    }
}

/// A `quantity unit` pair such as `30 secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Duration {
    quantity: u64,
    unit: TimeUnit,
}

impl Duration {
    /// Creates a duration from its parts.
    pub const fn new(quantity: u64, unit: TimeUnit) -> Self {
        Self { quantity, unit }
    }

    /// Shorthand for a duration in seconds.
    pub const fn from_secs(quantity: u64) -> Self {
        Self::new(quantity, TimeUnit::Second)
    }

    /// Parses a strictly positive duration literal.
    ///
    /// The quantity and unit may be separated by whitespace or written
    /// together (`10secs`).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Duration`] on an unknown unit, a missing part,
    /// trailing tokens, or a zero quantity.
    pub fn parse(text: &str) -> Result<Self> {
        let duration = Self::parse_any(text)?;
        if duration.quantity == 0 {
            return Err(duration_error(text));
        }
        Ok(duration)
    }

    /// Parses a duration literal, allowing a zero quantity.
    ///
    /// Used for `GROUP BY` intervals where `0 sec` asks for native buckets.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Duration`] if the text is malformed.
    pub fn parse_any(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let mut tokens = trimmed.split_whitespace();
        let (quantity, unit) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(quantity), Some(unit), None) => (quantity, unit),
            (Some(joined), None, None) => {
                let split = joined
                    .find(|c: char| !c.is_ascii_digit())
                    .ok_or_else(|| duration_error(text))?;
                joined.split_at(split)
            }
            _ => return Err(duration_error(text)),
        };

        let quantity: u64 = quantity.parse().map_err(|_| duration_error(text))?;
        let unit = TimeUnit::from_name(unit).ok_or_else(|| duration_error(text))?;
        Ok(Self { quantity, unit })
    }

    /// The number of units.
    pub const fn quantity(&self) -> u64 {
        self.quantity
    }

    /// The unit as written.
    pub const fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Total length in seconds, saturating at `u64::MAX`.
    pub const fn to_seconds(&self) -> u64 {
        self.quantity.saturating_mul(self.unit.seconds())
    }

    /// Converts to a [`std::time::Duration`].
    pub const fn to_std(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.to_seconds())
    }
}

fn duration_error(text: &str) -> crate::RrdbError {
    ParseError::Duration {
        input: text.trim().to_string(),
    }
    .into()
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.quantity == 1 { "" } else { "s" };
        write!(f, "{} {}{}", self.quantity, self.unit.singular(), suffix)
    }
}

impl FromStr for Duration {
    type Err = crate::RrdbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Duration {
    type Error = crate::RrdbError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Duration> for String {
    fn from(value: Duration) -> Self {
        value.to_string()
    }
}
