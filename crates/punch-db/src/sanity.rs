//! Read-only data sanity checks.
//!
//! The auditor scans the whole dataset and reports every invariant violation
//! it finds instead of stopping at the first one. It never writes; a failed
//! check is a diagnosis, not a repair.

use crate::error::{Error, Result, SanityReport, SanityViolation};
use crate::{TimeTracker, query_vec};

impl TimeTracker {
    /// Scans the dataset for invariant violations: interval ordering and
    /// non-overlap, effective tag unicity, and creation timestamp presence.
    pub fn sanity_check(&self) -> Result<()> {
        let mut violations = Vec::new();
        self.check_no_overlap(&mut violations)?;
        self.check_interval_tags_unicity(&mut violations)?;
        self.check_created_at(&mut violations)?;

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Sanity(SanityReport { violations }))
        }
    }

    /// Walks the live closed intervals in start order checking that each one
    /// is well formed and begins no earlier than the previous one ended.
    fn check_no_overlap(&self, violations: &mut Vec<SanityViolation>) -> Result<()> {
        let rows: Vec<(i64, i64, i64)> = query_vec(
            &self.conn,
            "SELECT s.id, s.start_timestamp, p.stop_timestamp
             FROM interval_start s
             JOIN interval_stop p ON p.start_uuid = s.uuid
             LEFT JOIN interval_tombstone d ON d.start_uuid = s.uuid
             WHERE d.uuid IS NULL
             ORDER BY s.start_timestamp",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut previous: Option<(i64, i64, i64)> = None;
        for (id, start, stop) in rows {
            if start >= stop {
                violations.push(SanityViolation::InvalidInterval { id, start, stop });
            }
            if let Some((previous_id, _, previous_stop)) = previous {
                if start < previous_stop {
                    violations.push(SanityViolation::InvalidStartTimestamp {
                        current: id,
                        previous: previous_id,
                    });
                }
            }
            previous = Some((id, start, stop));
        }
        Ok(())
    }

    /// Reports every (interval, tag) pair carrying more than one effective
    /// tag row.
    fn check_interval_tags_unicity(&self, violations: &mut Vec<SanityViolation>) -> Result<()> {
        let rows: Vec<(String, String)> = query_vec(
            &self.conn,
            "SELECT t.interval_start_uuid, t.tag
             FROM interval_tags t
             LEFT JOIN interval_tags_tombstone ts ON ts.interval_tag_uuid = t.uuid
             WHERE ts.uuid IS NULL
             GROUP BY t.interval_start_uuid, t.tag
             HAVING count(1) > 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        for (interval, tag) in rows {
            violations.push(SanityViolation::IntervalTagsUnicity { interval, tag });
        }
        Ok(())
    }

    /// Creation timestamps can only be missing in databases migrated from
    /// pre-event-log schemas; the current schema declares them NOT NULL.
    fn check_created_at(&self, violations: &mut Vec<SanityViolation>) -> Result<()> {
        let rows: Vec<i64> = query_vec(
            &self.conn,
            "SELECT id FROM interval_start WHERE created_at IS NULL",
            [],
            |row| row.get(0),
        )?;

        for id in rows {
            violations.push(SanityViolation::MissingCreatedAt { id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn setup() -> TimeTracker {
        TimeTracker::open_in_memory().expect("open in-memory tracker")
    }

    fn seed_closed_interval(tt: &TimeTracker, uuid: &str, start: i64, stop: i64) {
        tt.conn
            .execute(
                "INSERT INTO interval_start (uuid, start_timestamp, created_at)
                 VALUES (?1, ?2, ?2)",
                params![uuid, start],
            )
            .unwrap();
        tt.conn
            .execute(
                "INSERT INTO interval_stop (uuid, start_uuid, stop_timestamp, created_at)
                 VALUES (uuid(), ?1, ?2, ?2)",
                params![uuid, stop],
            )
            .unwrap();
    }

    #[test]
    fn empty_database_is_sane() {
        setup().sanity_check().unwrap();
    }

    #[test]
    fn overlapping_intervals_reported() {
        let tt = setup();
        seed_closed_interval(&tt, "one", 1_000, 2_000);
        seed_closed_interval(&tt, "two", 1_500, 2_500);

        let err = tt.sanity_check().unwrap_err();
        let Error::Sanity(report) = err else {
            panic!("expected a sanity report");
        };
        assert_eq!(
            report.violations,
            vec![SanityViolation::InvalidStartTimestamp {
                current: 2,
                previous: 1,
            }]
        );
    }

    #[test]
    fn inverted_interval_reported() {
        let tt = setup();
        seed_closed_interval(&tt, "one", 2_000, 1_000);

        let err = tt.sanity_check().unwrap_err();
        let Error::Sanity(report) = err else {
            panic!("expected a sanity report");
        };
        assert_eq!(
            report.violations,
            vec![SanityViolation::InvalidInterval {
                id: 1,
                start: 2_000,
                stop: 1_000,
            }]
        );
    }

    #[test]
    fn duplicated_effective_tag_reported() {
        let tt = setup();
        seed_closed_interval(&tt, "one", 1_000, 2_000);
        tt.conn
            .execute(
                "INSERT INTO tags (name, created_at) VALUES ('tag1', 1000)",
                [],
            )
            .unwrap();
        for _ in 0..2 {
            tt.conn
                .execute(
                    "INSERT INTO interval_tags (uuid, interval_start_uuid, tag, created_at)
                     VALUES (uuid(), 'one', 'tag1', 1000)",
                    [],
                )
                .unwrap();
        }

        let err = tt.sanity_check().unwrap_err();
        let Error::Sanity(report) = err else {
            panic!("expected a sanity report");
        };
        assert_eq!(
            report.violations,
            vec![SanityViolation::IntervalTagsUnicity {
                interval: "one".to_string(),
                tag: "tag1".to_string(),
            }]
        );
    }

    #[test]
    fn tombstoned_rows_do_not_trip_the_auditor() {
        let tt = setup();
        seed_closed_interval(&tt, "one", 1_000, 2_000);
        seed_closed_interval(&tt, "two", 1_500, 2_500);
        tt.conn
            .execute(
                "INSERT INTO interval_tombstone (uuid, start_uuid, created_at)
                 VALUES (uuid(), 'two', 3000)",
                [],
            )
            .unwrap();

        tt.sanity_check().unwrap();
    }
}
