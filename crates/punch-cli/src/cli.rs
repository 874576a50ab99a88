//! Command-line argument definitions.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::timespec::{Period, parse_duration, parse_period, parse_timestamp};

/// Personal time tracker with relay synchronisation.
///
/// Records tagged time intervals in a local database and reconciles several
/// machines through a shared relay database.
#[derive(Debug, Parser)]
#[command(name = "punch", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the local database file.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Defaults to `current` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start tracking a new time interval.
    Start(StartArgs),

    /// Stop tracking the currently opened interval.
    Stop(StopArgs),

    /// List recorded intervals over a period.
    List(ListArgs),

    /// Show the currently opened interval.
    Current,

    /// Start a new interval with the same tags as a previous one.
    Continue(ContinueArgs),

    /// Tag an interval with the given values.
    Tag(TagArgs),

    /// Remove tags from an interval.
    Untag(UntagArgs),

    /// Delete recorded intervals.
    Delete(DeleteArgs),

    /// Record a closed interval in one go.
    Record(RecordArgs),

    /// Hard delete old soft deleted data.
    Vacuum(VacuumArgs),

    /// Synchronise with the relay database.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Start timestamp (RFC 3339, local date-time, or HH:MM today).
    #[arg(long, value_parser = parse_timestamp, group = "time")]
    pub at: Option<DateTime<Utc>>,

    /// Start timestamp as a duration in the past (e.g. 15m).
    #[arg(long, value_parser = parse_duration, group = "time")]
    pub ago: Option<Duration>,

    /// Values to tag the new interval with.
    pub tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    /// Stop timestamp (RFC 3339, local date-time, or HH:MM today).
    #[arg(long, value_parser = parse_timestamp, group = "time")]
    pub at: Option<DateTime<Utc>>,

    /// Stop timestamp as a duration in the past (e.g. 15m).
    #[arg(long, value_parser = parse_duration, group = "time")]
    pub ago: Option<Duration>,

    /// Close the interval after this much time from its start (e.g. 1h30m).
    #[arg(long = "for", value_parser = parse_duration, group = "time")]
    pub duration: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Reference instant for the period instead of now.
    #[arg(long, value_parser = parse_timestamp)]
    pub at: Option<DateTime<Utc>>,

    /// Only output intervals carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Logical time period to look at (:day, :week, :month or :year).
    #[arg(default_value = ":day", value_parser = parse_period)]
    pub period: Period,
}

#[derive(Debug, Args)]
pub struct ContinueArgs {
    /// Interval id to continue; defaults to the latest one.
    #[arg(long)]
    pub id: Option<String>,

    /// Start timestamp of the new interval instead of now.
    #[arg(long, value_parser = parse_timestamp)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
pub struct TagArgs {
    /// The interval id to tag.
    pub id: String,

    /// Values to tag the interval with.
    #[arg(required = true)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct UntagArgs {
    /// The interval id to untag.
    pub id: String,

    /// The tags to remove from the interval.
    #[arg(required = true)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    /// The ids of the intervals to delete.
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// The start time of the new closed interval.
    #[arg(value_parser = parse_timestamp)]
    pub start: DateTime<Utc>,

    /// The stop time of the new closed interval.
    #[arg(value_parser = parse_timestamp)]
    pub stop: DateTime<Utc>,

    /// Values to tag the new interval with.
    pub tags: Vec<String>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("time").required(true)))]
pub struct VacuumArgs {
    /// Delete soft deleted data older than this duration.
    #[arg(long, value_parser = parse_duration, group = "time")]
    pub since: Option<Duration>,

    /// Delete soft deleted data older than this timestamp.
    #[arg(long, value_parser = parse_timestamp, group = "time")]
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Relay database user login.
    #[arg(short, long)]
    pub login: Option<String>,

    /// Relay database password.
    #[arg(long, env = "PUNCH_SYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Relay database host name.
    #[arg(long = "host")]
    pub hostname: Option<String>,

    /// Relay database connection port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Relay database name.
    #[arg(long = "dbname")]
    pub database_name: Option<String>,
}
