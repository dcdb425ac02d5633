//! Error types for the rrdb time-series engine.
//!
//! Every error that can reach a client is rendered with its `Display`
//! implementation, so the messages here double as protocol error text.

use thiserror::Error;

/// The main error type for all rrdb operations.
#[derive(Error, Debug)]
pub enum RrdbError {
    /// A statement, duration, name or value could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A retention policy is malformed or violates tier ordering.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A metric lookup or lifecycle operation failed.
    #[error(transparent)]
    Metric(#[from] MetricError),

    /// Error accessing the data directory or metric metadata.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error during slab I/O operations.
    #[error("slab I/O error: {0}")]
    SlabIo(#[from] SlabIoError),
}

/// Coarse classification of [`RrdbError`], matching the error kinds of the
/// text protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed statement, duration, policy text, name or value.
    Parse,
    /// The named metric does not exist.
    UnknownMetric,
    /// A metric with that name already exists.
    AlreadyExists,
    /// The retention policy is non-monotonic or has malformed tiers.
    InvalidPolicy,
    /// Transport or persistence failure.
    Io,
}

impl RrdbError {
    /// Returns the protocol-level kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::Parse,
            Self::Policy(_) => ErrorKind::InvalidPolicy,
            Self::Metric(MetricError::UnknownMetric { .. }) => ErrorKind::UnknownMetric,
            Self::Metric(MetricError::AlreadyExists { .. }) => ErrorKind::AlreadyExists,
            Self::Store(_) | Self::SlabIo(_) => ErrorKind::Io,
        }
    }
}

/// Errors produced while parsing client input.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The statement does not match the grammar.
    ///
    /// The client only ever sees the fixed message; `reason` is kept for logs.
    #[error("Unable to parse the statement")]
    Statement {
        /// What the parser expected at the failure point.
        reason: String,
    },

    /// A UDP short command is malformed.
    #[error("Unable to parse the command '{input}'")]
    Command {
        /// The offending packet text.
        input: String,
    },

    /// A duration literal such as `10 secs` is malformed.
    #[error("Unable to parse the interval '{input}'")]
    Duration {
        /// The offending duration text.
        input: String,
    },

    /// A metric name is empty, too long or contains forbidden characters.
    #[error("The metric name '{name}' is invalid: {reason}")]
    MetricName {
        /// The rejected name.
        name: String,
        /// Why the name was rejected.
        reason: &'static str,
    },

    /// A sample value could not be parsed as a number.
    #[error("Unable to parse the value '{input}'")]
    Value {
        /// The offending value text.
        input: String,
    },

    /// A sample value is NaN or infinite.
    #[error("The value {value} is not a finite number")]
    NonFiniteValue {
        /// The rejected value.
        value: f64,
    },
}

impl ParseError {
    /// Shorthand for a [`ParseError::Statement`] with the given reason.
    pub fn statement(reason: impl Into<String>) -> Self {
        Self::Statement {
            reason: reason.into(),
        }
    }
}

/// Errors produced while validating a retention policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// The policy text contains no tiers.
    #[error("The retention policy must have at least one tier")]
    NoTiers,

    /// A clause is not of the form `<duration> for <duration>`.
    #[error("Unable to parse the retention policy clause '{clause}'")]
    MalformedClause {
        /// The offending clause text.
        clause: String,
    },

    /// A tier keeps less data than a single bucket.
    #[error("The retention '{retention}' is shorter than the resolution '{resolution}'")]
    RetentionTooShort {
        /// Rendered resolution of the tier.
        resolution: String,
        /// Rendered retention of the tier.
        retention: String,
    },

    /// Tiers are not ordered by strictly increasing resolution.
    #[error("The resolution '{current}' must be greater than the previous resolution '{previous}'")]
    TiersNotOrdered {
        /// Rendered resolution of the previous tier.
        previous: String,
        /// Rendered resolution of the offending tier.
        current: String,
    },

    /// Tier would need more slots than allowed.
    #[error("tier {tier} would have {slot_count} slots (max {max_slots})")]
    TooManySlots {
        /// The tier index that's problematic.
        tier: usize,
        /// The computed slot count.
        slot_count: u64,
        /// The maximum allowed slots.
        max_slots: u64,
    },
}

/// Errors about metric existence.
#[derive(Error, Debug)]
pub enum MetricError {
    /// No metric with this name exists.
    #[error("The metric '{name}' does not exist")]
    UnknownMetric {
        /// The requested metric name.
        name: String,
    },

    /// A metric with this name already exists.
    #[error("The metric '{name}' already exists")]
    AlreadyExists {
        /// The conflicting metric name.
        name: String,
    },
}

/// Errors that can occur when accessing the data directory.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A directory could not be created, listed or removed.
    #[error("failed to access directory '{path}': {source}")]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata file (meta.json) is corrupted or invalid.
    #[error("corrupted metadata file '{path}': {reason}")]
    CorruptedMetadata {
        /// The metadata file path.
        path: String,
        /// Description of what was invalid about the metadata.
        reason: String,
    },

    /// Failed to read or write the metadata file.
    #[error("failed to write metadata file '{path}': {source}")]
    MetadataWrite {
        /// The metadata file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize metadata to JSON.
    #[error("failed to serialize metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),
}

/// Errors that can occur during slab I/O operations.
#[derive(Error, Debug)]
pub enum SlabIoError {
    /// Failed to open or map a slab file for reading.
    #[error("failed to read slab '{path}': {source}")]
    ReadFailed {
        /// The slab file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create, size or map a slab file for writing.
    #[error("failed to write slab '{path}': {source}")]
    WriteFailed {
        /// The slab file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to sync slab file to disk.
    #[error("failed to sync slab '{path}' to disk: {source}")]
    SyncFailed {
        /// The slab file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Slab file is corrupted or has invalid format.
    #[error("slab '{path}' is corrupted: {reason}")]
    CorruptedSlab {
        /// The slab file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// Attempted to access a slot beyond the slab capacity.
    #[error("slot {index} is out of bounds for slab '{path}' with {capacity} slots")]
    SlotOutOfBounds {
        /// The slab file path.
        path: String,
        /// The requested slot index.
        index: u32,
        /// The slab capacity.
        capacity: u32,
    },
}

/// Type alias for `Result<T, RrdbError>`.
pub type Result<T> = std::result::Result<T, RrdbError>;
