//! # rrdb
//!
//! Round-robin time-series storage and query engine.
//!
//! rrdb stores numeric samples for named metrics in fixed-size circular
//! archives. Each metric has a retention policy made of tiers such as
//! `1 sec for 10 mins, 1 min for 1 day`; every tier keeps per-bucket
//! sufficient statistics (count, sum, sum of squares, min, max) so averages
//! and standard deviations can be derived at query time without keeping
//! raw samples.
//!
//! ## Key Properties
//!
//! - Storage size is fixed by the policy, not by data volume
//! - Every tier aggregates raw samples independently at write time
//! - Memory-mapped slabs with checksummed double-buffered slots
//! - Text protocol front end (TCP statements, UDP short commands)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rrdb::{Registry, RegistryOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::open("./rrdb_data", RegistryOptions::default())?;
//! registry.create("cpu.load", "10 secs for 1 hour, 5 mins for 7 days")?;
//!
//! registry.update("cpu.load", 1_700_000_000, 0.75)?;
//! registry.update("cpu.load", 1_700_000_005, 0.25)?;
//!
//! let result = registry.select("cpu.load", 1_700_000_000, 1_700_000_060, None)?;
//! print!("{result}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: Metric map, lifecycle and persistence root
//! - [`engine`]: Statement dispatch, responses and status counters
//! - [`statement`]: TCP statement and UDP command parsing
//! - [`metric`]: Metric metadata plus one archive per tier
//! - [`archive`]: Round-robin slot arithmetic for one tier
//! - [`slab`]: Raw memory-mapped file format
//! - [`query`]: Tier selection, bucket merging and CSV output
//! - [`aggregate`]: Per-bucket sufficient statistics
//! - [`policy`]: Retention policy parsing and validation
//! - [`duration`]: Human-readable durations
//! - [`status`]: Server status counters
//! - [`error`]: Error types

pub mod aggregate;
pub mod archive;
pub mod duration;
pub mod engine;
pub mod error;
pub mod metric;
pub mod policy;
pub mod query;
pub mod registry;
pub mod slab;
pub mod statement;
pub mod status;

// Re-export primary API types at crate root for convenience.
pub use aggregate::AggregateSlot;
pub use duration::{Duration, TimeUnit};
pub use engine::{Engine, Response};
pub use error::{ErrorKind, Result, RrdbError};
pub use policy::{RetentionPolicy, RetentionTier};
pub use query::QueryResult;
pub use registry::{MetricInfo, Registry, RegistryOptions};
pub use statement::Statement;
pub use status::{Counter, ServerStatus};
