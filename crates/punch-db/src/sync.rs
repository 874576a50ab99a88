//! Bidirectional replication between the local store and a relay database.
//!
//! Both replicas and the relay hold the same six append-only event tables.
//! A sync round extracts every row created since the last watermark on each
//! side and cross-inserts them with `ON CONFLICT DO NOTHING` on the globally
//! unique identifiers, so rounds are idempotent and interleaving syncs from
//! several replicas converge to the same relay state.
//!
//! The "new since last sync" query is textually identical on both sides: the
//! relay gets a transaction-scoped temporary `sync_history` table seeded with
//! the local watermark before any extraction runs.

use std::fmt;

use postgres::NoTls;
use rusqlite::{Transaction, params};
use tracing::info;

use crate::error::{Error, Result};
use crate::{COUNT_OPEN_INTERVALS, TimeTracker, migrations, query_vec};

/// Connection settings for the relay database.
#[derive(Clone)]
pub struct RelayConfig {
    pub login: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
    pub database_name: String,
}

impl RelayConfig {
    fn connect(&self) -> std::result::Result<postgres::Client, postgres::Error> {
        postgres::Config::new()
            .user(&self.login)
            .password(&self.password)
            .host(&self.hostname)
            .port(self.port)
            .dbname(&self.database_name)
            .connect(NoTls)
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .finish()
    }
}

impl TimeTracker {
    /// Runs one bidirectional synchronisation round against the relay.
    ///
    /// Refuses to run while an interval is open: an open interval has no
    /// agreed duration yet and must not propagate. On any error before the
    /// final commits both stores are left untouched.
    pub fn sync(&mut self, cfg: &RelayConfig) -> Result<()> {
        let now = self.now();

        let mut relay = cfg.connect()?;
        migrations::migrate_relay(&mut relay)?;

        let open: i64 = self
            .conn
            .query_row(COUNT_OPEN_INTERVALS, [], |row| row.get(0))?;
        if open >= 1 {
            return Err(Error::ExistingOpenInterval);
        }

        let local_tx = self.conn.transaction()?;
        let last_sync = last_sync_timestamp(&local_tx)?;
        let now = next_watermark(now, last_sync);

        let mut relay_tx = relay.transaction()?;
        setup_relay_watermark(&mut relay_tx, last_sync)?;

        synchronise::<TagRow>(&local_tx, &mut relay_tx, now)?;
        synchronise::<IntervalStartRow>(&local_tx, &mut relay_tx, now)?;
        synchronise::<IntervalStopRow>(&local_tx, &mut relay_tx, now)?;
        synchronise::<IntervalTombstoneRow>(&local_tx, &mut relay_tx, now)?;
        synchronise::<IntervalTagRow>(&local_tx, &mut relay_tx, now)?;
        synchronise::<IntervalTagTombstoneRow>(&local_tx, &mut relay_tx, now)?;

        store_sync_timestamp(&local_tx, now)?;

        // Local first: a crash in between re-sends the missing rows on the
        // next round and the conflict-tolerant inserts absorb them.
        local_tx.commit()?;
        relay_tx.commit()?;
        info!(watermark = now, "synchronisation round complete");
        Ok(())
    }
}

/// Picks the watermark for this round. Two rounds within the same wall
/// second would collide on the `sync_history` primary key, so the new
/// watermark is always strictly greater than the previous one.
fn next_watermark(now: i64, last_sync: Option<i64>) -> i64 {
    match last_sync {
        Some(last) if now <= last => last + 1,
        _ => now,
    }
}

/// Returns the most recent sync watermark, or `None` when this replica has
/// never synchronised.
fn last_sync_timestamp(tx: &Transaction<'_>) -> Result<Option<i64>> {
    let last: Option<i64> = tx.query_row(
        "SELECT max(sync_timestamp) FROM sync_history",
        [],
        |row| row.get(0),
    )?;
    Ok(last)
}

fn store_sync_timestamp(tx: &Transaction<'_>, now: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO sync_history (sync_timestamp) VALUES (?1)",
        [now],
    )?;
    Ok(())
}

/// Creates the transaction-scoped `sync_history` on the relay and seeds it
/// with the local watermark so both sides evaluate "new since last sync"
/// identically. The temporary table shadows the relay's persistent one.
fn setup_relay_watermark(
    tx: &mut postgres::Transaction<'_>,
    last_sync: Option<i64>,
) -> Result<()> {
    tx.batch_execute(
        "CREATE TEMPORARY TABLE sync_history (sync_timestamp BIGINT) ON COMMIT DROP",
    )?;
    if let Some(last) = last_sync {
        tx.execute(
            "INSERT INTO sync_history (sync_timestamp) VALUES ($1)",
            &[&last],
        )?;
    }
    Ok(())
}

/// One replicated event table: how to extract its new rows and how to insert
/// them on either side. `SELECT_NEW` must parse under both dialects, which is
/// why the watermark comes from a `sync_history` table instead of a bind
/// parameter.
trait Replicated: Sized {
    const NAME: &'static str;
    const SELECT_NEW: &'static str;

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
    fn from_relay(row: &postgres::Row) -> Self;
    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()>;
    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error>;
}

fn fetch_new_local<T: Replicated>(tx: &Transaction<'_>) -> Result<Vec<T>> {
    query_vec(tx, T::SELECT_NEW, [], T::from_local)
}

fn fetch_new_relay<T: Replicated>(tx: &mut postgres::Transaction<'_>) -> Result<Vec<T>> {
    Ok(tx
        .query(T::SELECT_NEW, &[])?
        .iter()
        .map(T::from_relay)
        .collect())
}

/// Exchanges one table: new relay rows land locally, new local rows land on
/// the relay, both stamped with this round's `now`.
fn synchronise<T: Replicated>(
    local_tx: &Transaction<'_>,
    relay_tx: &mut postgres::Transaction<'_>,
    now: i64,
) -> Result<()> {
    let new_local = fetch_new_local::<T>(local_tx)?;
    let new_relay = fetch_new_relay::<T>(relay_tx)?;
    info!(
        table = T::NAME,
        local = new_local.len(),
        relay = new_relay.len(),
        "synchronising"
    );

    for row in &new_relay {
        row.insert_local(local_tx, now)?;
    }
    for row in &new_local {
        row.insert_relay(relay_tx, now)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TagRow {
    name: String,
}

impl Replicated for TagRow {
    const NAME: &'static str = "tags";
    const SELECT_NEW: &'static str = "
        WITH last_sync AS (
            SELECT max(sync_timestamp) AS last_timestamp
            FROM sync_history
        )
        SELECT name
        FROM tags
        JOIN last_sync ON (last_timestamp IS NULL OR created_at >= last_timestamp)
        ORDER BY created_at, name";

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self { name: row.get(0)? })
    }

    fn from_relay(row: &postgres::Row) -> Self {
        Self { name: row.get(0) }
    }

    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO tags (name, created_at) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![self.name, now],
        )?;
        Ok(())
    }

    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error> {
        tx.execute(
            "INSERT INTO tags (name, created_at) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            &[&self.name, &now],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IntervalStartRow {
    uuid: String,
    start_timestamp: i64,
    created_at: i64,
}

impl Replicated for IntervalStartRow {
    const NAME: &'static str = "interval_start";
    const SELECT_NEW: &'static str = "
        WITH last_sync AS (
            SELECT max(sync_timestamp) AS last_timestamp
            FROM sync_history
        )
        SELECT uuid, start_timestamp, created_at
        FROM interval_start
        JOIN last_sync ON (last_timestamp IS NULL OR created_at >= last_timestamp)
        ORDER BY created_at";

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            start_timestamp: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    fn from_relay(row: &postgres::Row) -> Self {
        Self {
            uuid: row.get(0),
            start_timestamp: row.get(1),
            created_at: row.get(2),
        }
    }

    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO interval_start (uuid, start_timestamp, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![self.uuid, self.start_timestamp, now],
        )?;
        Ok(())
    }

    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error> {
        tx.execute(
            "INSERT INTO interval_start (uuid, start_timestamp, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
            &[&self.uuid, &self.start_timestamp, &now],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IntervalStopRow {
    uuid: String,
    start_uuid: String,
    stop_timestamp: i64,
    created_at: i64,
}

impl Replicated for IntervalStopRow {
    const NAME: &'static str = "interval_stop";
    const SELECT_NEW: &'static str = "
        WITH last_sync AS (
            SELECT max(sync_timestamp) AS last_timestamp
            FROM sync_history
        )
        SELECT uuid, start_uuid, stop_timestamp, created_at
        FROM interval_stop
        JOIN last_sync ON (last_timestamp IS NULL OR created_at >= last_timestamp)
        ORDER BY created_at";

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            start_uuid: row.get(1)?,
            stop_timestamp: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn from_relay(row: &postgres::Row) -> Self {
        Self {
            uuid: row.get(0),
            start_uuid: row.get(1),
            stop_timestamp: row.get(2),
            created_at: row.get(3),
        }
    }

    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO interval_stop (uuid, start_uuid, stop_timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![self.uuid, self.start_uuid, self.stop_timestamp, now],
        )?;
        Ok(())
    }

    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error> {
        tx.execute(
            "INSERT INTO interval_stop (uuid, start_uuid, stop_timestamp, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
            &[&self.uuid, &self.start_uuid, &self.stop_timestamp, &now],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IntervalTombstoneRow {
    uuid: String,
    start_uuid: String,
    created_at: i64,
}

impl Replicated for IntervalTombstoneRow {
    const NAME: &'static str = "interval_tombstone";
    const SELECT_NEW: &'static str = "
        WITH last_sync AS (
            SELECT max(sync_timestamp) AS last_timestamp
            FROM sync_history
        )
        SELECT uuid, start_uuid, created_at
        FROM interval_tombstone
        JOIN last_sync ON (last_timestamp IS NULL OR created_at >= last_timestamp)
        ORDER BY created_at";

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            start_uuid: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    fn from_relay(row: &postgres::Row) -> Self {
        Self {
            uuid: row.get(0),
            start_uuid: row.get(1),
            created_at: row.get(2),
        }
    }

    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO interval_tombstone (uuid, start_uuid, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![self.uuid, self.start_uuid, now],
        )?;
        Ok(())
    }

    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error> {
        tx.execute(
            "INSERT INTO interval_tombstone (uuid, start_uuid, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
            &[&self.uuid, &self.start_uuid, &now],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IntervalTagRow {
    uuid: String,
    interval_start_uuid: String,
    tag: String,
    created_at: i64,
}

impl Replicated for IntervalTagRow {
    const NAME: &'static str = "interval_tags";
    const SELECT_NEW: &'static str = "
        WITH last_sync AS (
            SELECT max(sync_timestamp) AS last_timestamp
            FROM sync_history
        )
        SELECT uuid, interval_start_uuid, tag, created_at
        FROM interval_tags
        JOIN last_sync ON (last_timestamp IS NULL OR created_at >= last_timestamp)
        ORDER BY created_at";

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            interval_start_uuid: row.get(1)?,
            tag: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn from_relay(row: &postgres::Row) -> Self {
        Self {
            uuid: row.get(0),
            interval_start_uuid: row.get(1),
            tag: row.get(2),
            created_at: row.get(3),
        }
    }

    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO interval_tags (uuid, interval_start_uuid, tag, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![self.uuid, self.interval_start_uuid, self.tag, now],
        )?;
        Ok(())
    }

    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error> {
        tx.execute(
            "INSERT INTO interval_tags (uuid, interval_start_uuid, tag, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
            &[&self.uuid, &self.interval_start_uuid, &self.tag, &now],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IntervalTagTombstoneRow {
    uuid: String,
    interval_tag_uuid: String,
    created_at: i64,
}

impl Replicated for IntervalTagTombstoneRow {
    const NAME: &'static str = "interval_tags_tombstone";
    const SELECT_NEW: &'static str = "
        WITH last_sync AS (
            SELECT max(sync_timestamp) AS last_timestamp
            FROM sync_history
        )
        SELECT uuid, interval_tag_uuid, created_at
        FROM interval_tags_tombstone
        JOIN last_sync ON (last_timestamp IS NULL OR created_at >= last_timestamp)
        ORDER BY created_at";

    fn from_local(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            interval_tag_uuid: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    fn from_relay(row: &postgres::Row) -> Self {
        Self {
            uuid: row.get(0),
            interval_tag_uuid: row.get(1),
            created_at: row.get(2),
        }
    }

    fn insert_local(&self, tx: &Transaction<'_>, now: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO interval_tags_tombstone (uuid, interval_tag_uuid, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![self.uuid, self.interval_tag_uuid, now],
        )?;
        Ok(())
    }

    fn insert_relay(
        &self,
        tx: &mut postgres::Transaction<'_>,
        now: i64,
    ) -> std::result::Result<(), postgres::Error> {
        tx.execute(
            "INSERT INTO interval_tags_tombstone (uuid, interval_tag_uuid, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
            &[&self.uuid, &self.interval_tag_uuid, &now],
        )?;
        Ok(())
    }
}
