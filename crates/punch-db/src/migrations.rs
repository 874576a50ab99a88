//! Versioned schema migrations for the local store and the relay.
//!
//! Each migration is recorded in a `schema_migrations` table together with a
//! SHA-256 checksum of its script. Re-applying an already-applied migration is
//! a no-op; a checksum that no longer matches the recorded one aborts the open
//! so a database is never driven by a schema history it did not go through.

use std::time::Instant;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub script: &'static str,
}

impl Migration {
    fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.script.as_bytes()))
    }
}

/// Returns whether the migration still has to run, failing on checksum drift.
fn pending(migration: &Migration, recorded: Option<&str>) -> Result<bool> {
    match recorded {
        None => Ok(true),
        Some(recorded) if recorded == migration.checksum() => Ok(false),
        Some(recorded) => Err(Error::MigrationChecksum {
            version: migration.version,
            recorded: recorded.to_string(),
            computed: migration.checksum(),
        }),
    }
}

const TRACKING_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        description TEXT NOT NULL,
        script TEXT NOT NULL,
        checksum TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        execution_time_ms INTEGER NOT NULL
    )";

const RECORD_MIGRATION: &str = "
    INSERT INTO schema_migrations
        (version, description, script, checksum, applied_at, execution_time_ms)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Applies the outstanding local migrations in ascending version order.
pub(crate) fn migrate_local(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(TRACKING_TABLE)?;
    for migration in LOCAL_MIGRATIONS {
        let tx = conn.transaction()?;
        let recorded: Option<String> = tx
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                [migration.version],
                |row| row.get(0),
            )
            .optional()?;
        if !pending(migration, recorded.as_deref())? {
            continue;
        }

        debug!(
            version = migration.version,
            description = migration.description,
            "applying local migration"
        );
        let started = Instant::now();
        tx.execute_batch(migration.script)?;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        tx.execute(
            RECORD_MIGRATION,
            rusqlite::params![
                migration.version,
                migration.description,
                migration.script,
                migration.checksum(),
                Utc::now().timestamp(),
                elapsed_ms,
            ],
        )?;
        tx.commit()?;
    }
    Ok(())
}

/// Applies the outstanding relay migrations in ascending version order.
pub(crate) fn migrate_relay(client: &mut postgres::Client) -> Result<()> {
    client.batch_execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            script TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at BIGINT NOT NULL,
            execution_time_ms BIGINT NOT NULL
        )",
    )?;
    for migration in RELAY_MIGRATIONS {
        let mut tx = client.transaction()?;
        let recorded: Option<String> = tx
            .query_opt(
                "SELECT checksum FROM schema_migrations WHERE version = $1",
                &[&migration.version],
            )?
            .map(|row| row.get(0));
        if !pending(migration, recorded.as_deref())? {
            continue;
        }

        debug!(
            version = migration.version,
            description = migration.description,
            "applying relay migration"
        );
        let started = Instant::now();
        tx.batch_execute(migration.script)?;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        tx.execute(
            "INSERT INTO schema_migrations
                (version, description, script, checksum, applied_at, execution_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &migration.version,
                &migration.description,
                &migration.script,
                &migration.checksum(),
                &Utc::now().timestamp(),
                &elapsed_ms,
            ],
        )?;
        tx.commit()?;
    }
    Ok(())
}

pub(crate) const LOCAL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base table definitions for intervals and tags",
        script: "
            CREATE TABLE tags (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE intervals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_timestamp INTEGER NOT NULL,
                stop_timestamp INTEGER
            );

            CREATE TABLE interval_tags (
                interval_id INTEGER NOT NULL REFERENCES intervals (id),
                tag TEXT NOT NULL REFERENCES tags (name),
                PRIMARY KEY (interval_id, tag)
            );
        ",
    },
    Migration {
        version: 2,
        description: "add lifecycle timestamps on all tables",
        script: "
            ALTER TABLE tags ADD COLUMN created_at INTEGER;
            ALTER TABLE intervals ADD COLUMN created_at INTEGER;
            ALTER TABLE intervals ADD COLUMN updated_at INTEGER;
            ALTER TABLE intervals ADD COLUMN deleted_at INTEGER;
            ALTER TABLE interval_tags ADD COLUMN created_at INTEGER;
            ALTER TABLE interval_tags ADD COLUMN deleted_at INTEGER;
        ",
    },
    Migration {
        version: 3,
        description: "add uuid unique keys as conflict free identifiers",
        script: "
            ALTER TABLE intervals ADD COLUMN uuid TEXT;
            UPDATE intervals SET uuid = uuid() WHERE uuid IS NULL;
            CREATE UNIQUE INDEX idx_intervals_uuid ON intervals (uuid);

            ALTER TABLE interval_tags ADD COLUMN interval_uuid TEXT;
            UPDATE interval_tags
            SET interval_uuid = (
                SELECT uuid FROM intervals WHERE intervals.id = interval_tags.interval_id
            );
        ",
    },
    Migration {
        version: 4,
        description: "add a synchronisation history table",
        script: "
            CREATE TABLE sync_history (
                sync_timestamp INTEGER PRIMARY KEY
            );
        ",
    },
    Migration {
        version: 5,
        description: "split the intervals table into immutable event tables",
        script: "
            CREATE TABLE interval_start (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                start_timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE interval_stop (
                uuid TEXT PRIMARY KEY,
                start_uuid TEXT NOT NULL UNIQUE REFERENCES interval_start (uuid),
                stop_timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE interval_tombstone (
                uuid TEXT PRIMARY KEY,
                start_uuid TEXT NOT NULL UNIQUE REFERENCES interval_start (uuid),
                created_at INTEGER NOT NULL
            );

            UPDATE tags SET created_at = unixepoch('now') WHERE created_at IS NULL;

            INSERT INTO interval_start (uuid, start_timestamp, created_at)
            SELECT uuid, start_timestamp, COALESCE(created_at, unixepoch('now'))
            FROM intervals
            WHERE deleted_at IS NULL;

            INSERT INTO interval_stop (uuid, start_uuid, stop_timestamp, created_at)
            SELECT uuid(), uuid, stop_timestamp, COALESCE(updated_at, created_at, unixepoch('now'))
            FROM intervals
            WHERE deleted_at IS NULL AND stop_timestamp IS NOT NULL;

            CREATE TABLE interval_tags_new (
                uuid TEXT PRIMARY KEY,
                interval_start_uuid TEXT NOT NULL REFERENCES interval_start (uuid),
                tag TEXT NOT NULL REFERENCES tags (name),
                created_at INTEGER NOT NULL
            );

            INSERT INTO interval_tags_new (uuid, interval_start_uuid, tag, created_at)
            SELECT uuid(), interval_uuid, tag, COALESCE(created_at, unixepoch('now'))
            FROM interval_tags
            WHERE deleted_at IS NULL
                AND interval_uuid IN (SELECT uuid FROM interval_start);

            DROP TABLE interval_tags;
            ALTER TABLE interval_tags_new RENAME TO interval_tags;

            CREATE TABLE interval_tags_tombstone (
                uuid TEXT PRIMARY KEY,
                interval_tag_uuid TEXT NOT NULL UNIQUE REFERENCES interval_tags (uuid),
                created_at INTEGER NOT NULL
            );

            DROP TABLE intervals;

            CREATE INDEX idx_interval_start_timestamp ON interval_start (start_timestamp);
            CREATE INDEX idx_interval_tags_start_uuid ON interval_tags (interval_start_uuid);
        ",
    },
];

// The relay reaches the same logical schema in one step: it never went
// through the mutable era, so there is no data to carry over.
pub(crate) const RELAY_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "event log schema for the relay store",
    script: "
        CREATE TABLE tags (
            name TEXT PRIMARY KEY,
            created_at BIGINT NOT NULL
        );

        CREATE TABLE interval_start (
            id BIGSERIAL PRIMARY KEY,
            uuid TEXT NOT NULL UNIQUE,
            start_timestamp BIGINT NOT NULL,
            created_at BIGINT NOT NULL
        );

        CREATE TABLE interval_stop (
            uuid TEXT PRIMARY KEY,
            start_uuid TEXT NOT NULL UNIQUE REFERENCES interval_start (uuid),
            stop_timestamp BIGINT NOT NULL,
            created_at BIGINT NOT NULL
        );

        CREATE TABLE interval_tombstone (
            uuid TEXT PRIMARY KEY,
            start_uuid TEXT NOT NULL UNIQUE REFERENCES interval_start (uuid),
            created_at BIGINT NOT NULL
        );

        CREATE TABLE interval_tags (
            uuid TEXT PRIMARY KEY,
            interval_start_uuid TEXT NOT NULL REFERENCES interval_start (uuid),
            tag TEXT NOT NULL REFERENCES tags (name),
            created_at BIGINT NOT NULL
        );

        CREATE TABLE interval_tags_tombstone (
            uuid TEXT PRIMARY KEY,
            interval_tag_uuid TEXT NOT NULL UNIQUE REFERENCES interval_tags (uuid),
            created_at BIGINT NOT NULL
        );

        CREATE TABLE sync_history (
            sync_timestamp BIGINT PRIMARY KEY
        );
    ",
}];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_versions_are_strictly_ascending() {
        for pair in LOCAL_MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn pending_detects_checksum_drift() {
        let migration = &LOCAL_MIGRATIONS[0];

        assert!(pending(migration, None).unwrap());
        assert!(!pending(migration, Some(migration.checksum().as_str())).unwrap());

        let err = pending(migration, Some("deadbeef")).unwrap_err();
        assert!(matches!(err, Error::MigrationChecksum { version: 1, .. }));
    }
}
