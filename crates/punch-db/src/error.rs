//! Error taxonomy for the punch storage core.
//!
//! Every failure mode callers are expected to dispatch on gets its own
//! variant; driver errors are wrapped with their message preserved.

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Storage and engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller supplied contradictory or empty required inputs.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An operation requires no open interval but one exists.
    #[error("already existing opened interval")]
    ExistingOpenInterval,

    /// More than one open interval was found on read.
    #[error("multiple opened intervals: {0}")]
    MultipleOpenInterval(i64),

    /// The requested start time falls inside a live closed interval.
    #[error("invalid start timestamp")]
    InvalidStartTimestamp,

    /// The requested stop time is not after the start, or would swallow
    /// another interval's start.
    #[error("invalid stop timestamp")]
    InvalidStopTimestamp,

    /// Tagging would create a second effective tag row for the same pair.
    #[error("duplicated interval tag: id:{id}, tag:{tag}")]
    DuplicatedIntervalTag { id: String, tag: String },

    /// A per-replica id does not resolve to a live entity.
    #[error("interval not found: {0}")]
    NotFound(String),

    /// Reserved operation that the event-log schema does not realise.
    #[error("not implemented")]
    NotImplemented,

    /// A recorded migration no longer matches the shipped script.
    #[error("checksum mismatch on migration {version}: recorded {recorded}, computed {computed}")]
    MigrationChecksum {
        version: i64,
        recorded: String,
        computed: String,
    },

    /// The sanity auditor found invariant violations.
    #[error("sanity check failed: {0}")]
    Sanity(SanityReport),

    /// An error from the local database driver.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An error from the relay database driver.
    #[error("relay error: {0}")]
    Relay(#[from] postgres::Error),
}

impl Error {
    /// True when the underlying driver reported an empty result set, the
    /// "nothing to stop" case of [`crate::TimeTracker::stop_at`].
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Error::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }
}

/// A single invariant violation found by the sanity auditor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanityViolation {
    /// A live closed interval whose start is not before its stop.
    #[error("invalid interval {id}: start {start} is not before stop {stop}")]
    InvalidInterval { id: i64, start: i64, stop: i64 },

    /// A live closed interval beginning before the previous one ended.
    #[error("invalid start timestamp: interval {current} begins before interval {previous} stops")]
    InvalidStartTimestamp { current: i64, previous: i64 },

    /// More than one effective tag row for the same (interval, tag) pair.
    #[error("interval tag unicity failed ({interval},{tag})")]
    IntervalTagsUnicity { interval: String, tag: String },

    /// An interval row without a creation timestamp, only possible in
    /// databases migrated from pre-event-log schemas.
    #[error("interval {id} has no creation timestamp")]
    MissingCreatedAt { id: i64 },
}

/// Everything the sanity auditor found wrong, in scan order.
#[derive(Debug, Default)]
pub struct SanityReport {
    pub violations: Vec<SanityViolation>,
}

impl fmt::Display for SanityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "; {violation}")?;
        }
        Ok(())
    }
}
