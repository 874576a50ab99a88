//! Transactional storage for time intervals and their tags.
//!
//! The dataset is an append-only event log: starting an interval, stopping
//! it, deleting it and editing its tags all INSERT rows, never UPDATE or
//! DELETE them. Corrections are expressed as tombstones. This is what makes
//! bidirectional replication through a relay (see [`TimeTracker::sync`]) a
//! plain set union over globally unique identifiers.
//!
//! # Thread Safety
//!
//! [`TimeTracker`] wraps a single `rusqlite::Connection`, which is `Send` but
//! not `Sync`. Move it between threads if you must, but do not share it;
//! the engine runs one transaction at a time and is not meant for concurrent
//! writers.
//!
//! # Timestamps
//!
//! All timestamps are stored as unix seconds (`INTEGER`). Operations accept
//! `chrono::DateTime<Utc>` values and truncate them to second resolution on
//! the way in. Row creation times come from an injectable clock so tests can
//! pin the wall clock.

mod error;
mod migrations;
mod sanity;
mod sync;

pub use error::{Error, Result, SanityReport, SanityViolation};
pub use sync::RelayConfig;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::debug;
use uuid::Uuid;

/// A recorded time interval.
///
/// `id` is the per-replica sequence number shown to the user; it is not
/// synchronised. `uuid` is the globally unique identifier replication runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: String,
    pub uuid: String,
    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
}

/// An interval together with its effective tags, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedInterval {
    pub interval: Interval,
    pub tags: Vec<String>,
}

/// Handle over the local store.
pub struct TimeTracker {
    conn: Connection,
    clock: Box<dyn Fn() -> i64 + Send>,
}

impl std::fmt::Debug for TimeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeTracker").finish_non_exhaustive()
    }
}

pub(crate) const COUNT_OPEN_INTERVALS: &str = "
    SELECT count(1)
    FROM interval_start s
    LEFT JOIN interval_stop p ON p.start_uuid = s.uuid
    LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
    WHERE p.uuid IS NULL AND d.uuid IS NULL";

const EFFECTIVE_TAGS: &str = "
    SELECT t.tag
    FROM interval_tags t
    LEFT JOIN interval_tags_tombstone ts ON ts.interval_tag_uuid = t.uuid
    WHERE ts.uuid IS NULL AND t.interval_start_uuid = ?1
    ORDER BY t.created_at, t.rowid";

impl TimeTracker {
    /// Opens a database at the given path, creating and migrating it if
    /// necessary. Opening an up-to-date database is a no-op.
    pub fn open(path: &Path) -> Result<Self> {
        Self::setup(Connection::open(path)?)
    }

    /// Opens an in-memory database, useful for testing.
    pub fn open_in_memory() -> Result<Self> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(mut conn: Connection) -> Result<Self> {
        register_uuid_function(&conn)?;
        migrations::migrate_local(&mut conn)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA defer_foreign_keys = ON;",
        )?;
        Ok(Self {
            conn,
            clock: Box::new(|| Utc::now().timestamp()),
        })
    }

    /// Replaces the wall clock used to stamp created rows.
    pub fn set_clock(&mut self, clock: impl Fn() -> i64 + Send + 'static) {
        self.clock = Box::new(clock);
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Registers a new open interval with a set of tags.
    ///
    /// Fails with [`Error::ExistingOpenInterval`] when an interval is already
    /// running and with [`Error::InvalidStartTimestamp`] when `t` falls inside
    /// a live closed interval.
    pub fn start(&mut self, t: DateTime<Utc>, tags: &[String]) -> Result<()> {
        let now = self.now();
        let tx = self.conn.transaction()?;

        let open: i64 = tx.query_row(COUNT_OPEN_INTERVALS, [], |row| row.get(0))?;
        if open >= 1 {
            return Err(Error::ExistingOpenInterval);
        }

        let enclosing: i64 = tx.query_row(
            "SELECT count(1)
             FROM interval_start s
             JOIN interval_stop p ON p.start_uuid = s.uuid
             LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
             WHERE d.uuid IS NULL
               AND s.start_timestamp <= ?1
               AND p.stop_timestamp > ?1",
            [t.timestamp()],
            |row| row.get(0),
        )?;
        if enclosing >= 1 {
            return Err(Error::InvalidStartTimestamp);
        }

        let uuid = insert_interval(&tx, t.timestamp(), tags, now)?;
        tx.commit()?;
        debug!(uuid = %uuid, start = t.timestamp(), "started interval");
        Ok(())
    }

    /// Closes the currently open interval at `t`.
    ///
    /// When no interval is open the underlying no-rows error surfaces; see
    /// [`Error::is_no_rows`].
    pub fn stop_at(&mut self, t: DateTime<Utc>) -> Result<()> {
        let now = self.now();
        let tx = self.conn.transaction()?;
        let uuid = stop_open_interval(&tx, StopSpec::At(t.timestamp()), now)?;
        tx.commit()?;
        debug!(uuid = %uuid, stop = t.timestamp(), "stopped interval");
        Ok(())
    }

    /// Closes the currently open interval `d` after its own start.
    pub fn stop_for(&mut self, d: chrono::Duration) -> Result<()> {
        let now = self.now();
        let tx = self.conn.transaction()?;
        let uuid = stop_open_interval(&tx, StopSpec::After(d.num_seconds()), now)?;
        tx.commit()?;
        debug!(uuid = %uuid, duration = d.num_seconds(), "stopped interval");
        Ok(())
    }

    /// Opens a new interval at `t` carrying the effective tags of a previous
    /// one: the interval with the given per-replica id, or the latest live
    /// interval when `id` is `None`.
    pub fn continue_at(&mut self, t: DateTime<Utc>, id: Option<&str>) -> Result<()> {
        let now = self.now();
        let tx = self.conn.transaction()?;

        let open: i64 = tx.query_row(COUNT_OPEN_INTERVALS, [], |row| row.get(0))?;
        if open >= 1 {
            return Err(Error::ExistingOpenInterval);
        }

        let enclosing: i64 = tx.query_row(
            "SELECT count(1)
             FROM interval_start s
             JOIN interval_stop p ON p.start_uuid = s.uuid
             LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
             WHERE d.uuid IS NULL
               AND s.start_timestamp <= ?1
               AND p.stop_timestamp > ?1",
            [t.timestamp()],
            |row| row.get(0),
        )?;
        if enclosing >= 1 {
            return Err(Error::InvalidStartTimestamp);
        }

        let previous = match id {
            None => tx
                .query_row(
                    "SELECT s.uuid
                     FROM interval_start s
                     LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
                     WHERE d.uuid IS NULL
                     ORDER BY s.start_timestamp DESC
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?,
            Some(id) => live_interval_uuid(&tx, id)?,
        };
        let Some(previous) = previous else {
            return Err(Error::NotFound(id.unwrap_or("latest").to_string()));
        };

        let tags: Vec<String> = query_vec(&tx, EFFECTIVE_TAGS, params![previous], |row| row.get(0))?;
        let uuid = insert_interval(&tx, t.timestamp(), &tags, now)?;
        tx.commit()?;
        debug!(uuid = %uuid, from = %previous, "continued interval");
        Ok(())
    }

    /// Attaches tags to the live interval with the given id.
    pub fn tag(&mut self, id: &str, tags: &[String]) -> Result<()> {
        let now = self.now();
        let tx = self.conn.transaction()?;

        let Some(uuid) = live_interval_uuid(&tx, id)? else {
            return Err(Error::NotFound(id.to_string()));
        };

        for tag in tags {
            let effective: i64 = tx.query_row(
                "SELECT count(1)
                 FROM interval_tags t
                 LEFT JOIN interval_tags_tombstone ts ON ts.interval_tag_uuid = t.uuid
                 WHERE ts.uuid IS NULL
                   AND t.interval_start_uuid = ?1
                   AND t.tag = ?2",
                params![uuid, tag],
                |row| row.get(0),
            )?;
            if effective >= 1 {
                return Err(Error::DuplicatedIntervalTag {
                    id: id.to_string(),
                    tag: tag.clone(),
                });
            }

            tx.execute(
                "INSERT INTO tags (name, created_at) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                params![tag, now],
            )?;
            tx.execute(
                "INSERT INTO interval_tags (uuid, interval_start_uuid, tag, created_at)
                 VALUES (uuid(), ?1, ?2, ?3)",
                params![uuid, tag, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Shadows every effective tag row matching the given tags on the live
    /// interval with the given id.
    pub fn untag(&mut self, id: &str, tags: &[String]) -> Result<()> {
        let now = self.now();
        let tx = self.conn.transaction()?;

        let Some(uuid) = live_interval_uuid(&tx, id)? else {
            return Err(Error::NotFound(id.to_string()));
        };

        for tag in tags {
            tx.execute(
                "INSERT INTO interval_tags_tombstone (uuid, interval_tag_uuid, created_at)
                 SELECT uuid(), t.uuid, ?3
                 FROM interval_tags t
                 LEFT JOIN interval_tags_tombstone ts ON ts.interval_tag_uuid = t.uuid
                 WHERE ts.uuid IS NULL
                   AND t.interval_start_uuid = ?1
                   AND t.tag = ?2",
                params![uuid, tag, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Tombstones the interval with the given id. Deleting an already
    /// deleted interval is a no-op.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let now = self.now();
        let seq = parse_id(id)?;
        let tx = self.conn.transaction()?;

        let uuid: Option<String> = tx
            .query_row(
                "SELECT uuid FROM interval_start WHERE id = ?1",
                [seq],
                |row| row.get(0),
            )
            .optional()?;
        let Some(uuid) = uuid else {
            return Err(Error::NotFound(id.to_string()));
        };

        tx.execute(
            "INSERT INTO interval_tombstone (uuid, start_uuid, created_at)
             VALUES (uuid(), ?1, ?2)
             ON CONFLICT (start_uuid) DO NOTHING",
            params![uuid, now],
        )?;
        tx.commit()?;
        debug!(uuid = %uuid, "deleted interval");
        Ok(())
    }

    /// Returns the currently open interval, if any.
    pub fn current(&self) -> Result<Option<TaggedInterval>> {
        let row = self
            .conn
            .query_row(
                "SELECT s.id, s.uuid, s.start_timestamp
                 FROM interval_start s
                 LEFT JOIN interval_stop p ON p.start_uuid = s.uuid
                 LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
                 WHERE p.uuid IS NULL AND d.uuid IS NULL",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, uuid, start)) = row else {
            return Ok(None);
        };

        let tags = query_vec(&self.conn, EFFECTIVE_TAGS, params![uuid], |row| row.get(0))?;
        Ok(Some(TaggedInterval {
            interval: Interval {
                id: id.to_string(),
                uuid,
                start: from_unix(start),
                stop: None,
            },
            tags,
        }))
    }

    /// Returns every live interval intersecting the half-open range
    /// `[since, until)`, sorted by start timestamp. Open intervals are always
    /// included.
    pub fn list(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<TaggedInterval>> {
        let rows = query_vec(
            &self.conn,
            "SELECT s.id, s.uuid, s.start_timestamp, p.stop_timestamp
             FROM interval_start s
             LEFT JOIN interval_stop p ON p.start_uuid = s.uuid
             LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
             WHERE d.uuid IS NULL
               AND ((s.start_timestamp >= ?1 AND s.start_timestamp < ?2)
                 OR (p.stop_timestamp >= ?1 AND p.stop_timestamp < ?2)
                 OR p.stop_timestamp IS NULL)
             ORDER BY s.start_timestamp",
            params![since.timestamp(), until.timestamp()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;

        let mut intervals = Vec::with_capacity(rows.len());
        for (id, uuid, start, stop) in rows {
            let tags = query_vec(&self.conn, EFFECTIVE_TAGS, params![uuid], |row| row.get(0))?;
            intervals.push(TaggedInterval {
                interval: Interval {
                    id: id.to_string(),
                    uuid,
                    start: from_unix(start),
                    stop: stop.map(from_unix),
                },
                tags,
            });
        }
        Ok(intervals)
    }

    /// Hard deletion of tombstoned data is not realised under the event-log
    /// schema; replication relies on every replica keeping its full history.
    pub fn vacuum(&mut self, _before: DateTime<Utc>) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

enum StopSpec {
    /// Close at an absolute timestamp.
    At(i64),
    /// Close this many seconds after the open interval started.
    After(i64),
}

fn stop_open_interval(tx: &Transaction<'_>, spec: StopSpec, now: i64) -> Result<String> {
    let (uuid, start, open): (String, i64, i64) = tx.query_row(
        "SELECT s.uuid, s.start_timestamp, count(1) OVER ()
         FROM interval_start s
         LEFT JOIN interval_stop p ON p.start_uuid = s.uuid
         LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
         WHERE p.uuid IS NULL AND d.uuid IS NULL
         LIMIT 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    if open > 1 {
        return Err(Error::MultipleOpenInterval(open));
    }

    let stop = match spec {
        StopSpec::At(t) => t,
        StopSpec::After(d) => start + d,
    };
    if stop <= start {
        return Err(Error::InvalidStopTimestamp);
    }

    // The new closed interval must not swallow another interval's start.
    let enclosed: i64 = tx.query_row(
        "SELECT count(1)
         FROM interval_start s
         LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
         WHERE d.uuid IS NULL
           AND s.start_timestamp > ?1
           AND s.start_timestamp < ?2",
        params![start, stop],
        |row| row.get(0),
    )?;
    if enclosed >= 1 {
        return Err(Error::InvalidStopTimestamp);
    }

    tx.execute(
        "INSERT INTO interval_stop (uuid, start_uuid, stop_timestamp, created_at)
         VALUES (uuid(), ?1, ?2, ?3)",
        params![uuid, stop, now],
    )?;
    Ok(uuid)
}

fn insert_interval(tx: &Transaction<'_>, start: i64, tags: &[String], now: i64) -> Result<String> {
    for tag in tags {
        tx.execute(
            "INSERT INTO tags (name, created_at) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![tag, now],
        )?;
    }

    let uuid: String = tx.query_row(
        "INSERT INTO interval_start (uuid, start_timestamp, created_at)
         VALUES (uuid(), ?1, ?2)
         RETURNING uuid",
        params![start, now],
        |row| row.get(0),
    )?;

    for tag in tags {
        tx.execute(
            "INSERT INTO interval_tags (uuid, interval_start_uuid, tag, created_at)
             VALUES (uuid(), ?1, ?2, ?3)",
            params![uuid, tag, now],
        )?;
    }
    Ok(uuid)
}

/// Resolves a per-replica id to the uuid of a live interval.
fn live_interval_uuid(tx: &Transaction<'_>, id: &str) -> Result<Option<String>> {
    let seq = parse_id(id)?;
    let uuid = tx
        .query_row(
            "SELECT s.uuid
             FROM interval_start s
             LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
             WHERE d.uuid IS NULL AND s.id = ?1",
            [seq],
            |row| row.get(0),
        )
        .optional()?;
    Ok(uuid)
}

fn parse_id(id: &str) -> Result<i64> {
    id.parse().map_err(|_| Error::NotFound(id.to_string()))
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn register_uuid_function(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function("uuid", 0, FunctionFlags::SQLITE_UTF8, |_ctx| {
        Ok(Uuid::new_v4().to_string())
    })
}

/// Collects every row of a query into a vector through the given mapper.
pub(crate) fn query_vec<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Vec<T>>
where
    P: rusqlite::Params,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
