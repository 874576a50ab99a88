//! Relay replication round-trips against a live PostgreSQL server.
//!
//! These tests need a reachable relay database and are ignored by default;
//! point `PUNCH_TEST_RELAY_*` at a scratch database and run with
//! `cargo test -- --ignored`. Every run wipes the relay tables first.

use std::env;

use chrono::{DateTime, TimeZone, Utc};
use postgres::NoTls;
use punch_db::{RelayConfig, TaggedInterval, TimeTracker};

fn relay_config() -> RelayConfig {
    let var = |name: &str, default: &str| env::var(name).unwrap_or_else(|_| default.to_string());
    RelayConfig {
        login: var("PUNCH_TEST_RELAY_LOGIN", "postgres"),
        password: var("PUNCH_TEST_RELAY_PASSWORD", "postgres"),
        hostname: var("PUNCH_TEST_RELAY_HOST", "localhost"),
        port: var("PUNCH_TEST_RELAY_PORT", "5432").parse().expect("port"),
        database_name: var("PUNCH_TEST_RELAY_DBNAME", "postgres"),
    }
}

fn wipe_relay(cfg: &RelayConfig) {
    let mut client = postgres::Config::new()
        .user(&cfg.login)
        .password(&cfg.password)
        .host(&cfg.hostname)
        .port(cfg.port)
        .dbname(&cfg.database_name)
        .connect(NoTls)
        .expect("connect to relay");
    client
        .batch_execute(
            "DROP TABLE IF EXISTS
                interval_tags_tombstone, interval_tags, interval_tombstone,
                interval_stop, interval_start, tags, sync_history,
                schema_migrations
             CASCADE",
        )
        .expect("wipe relay tables");
}

/// Pins the tracker's wall clock to an absolute second. The scenarios below
/// step the clock forward between phases the way real wall time would.
fn set_time(tt: &mut TimeTracker, at: i64) {
    tt.set_clock(move || at);
}

/// Projects out the per-replica id and uuid, keeping the effective state.
fn effective(
    intervals: &[TaggedInterval],
) -> Vec<(DateTime<Utc>, Option<DateTime<Utc>>, Vec<String>)> {
    intervals
        .iter()
        .map(|ti| (ti.interval.start, ti.interval.stop, ti.tags.clone()))
        .collect()
}

#[test]
#[ignore = "needs a PostgreSQL relay, see PUNCH_TEST_RELAY_* variables"]
fn relay_round_trip_scenarios() {
    let cfg = relay_config();
    wipe_relay(&cfg);

    let t = Utc.with_ymd_and_hms(2022, 2, 25, 12, 0, 0).unwrap();
    let now = t.timestamp() + 3600;
    let mut replica_a = TimeTracker::open_in_memory().expect("open replica A");
    let mut replica_b = TimeTracker::open_in_memory().expect("open replica B");
    set_time(&mut replica_a, now);
    set_time(&mut replica_b, now);

    // An open interval must not propagate.
    replica_a
        .start(t - chrono::Duration::hours(4), &["tag1".to_string()])
        .unwrap();
    let err = replica_a.sync(&cfg).unwrap_err();
    assert!(matches!(err, punch_db::Error::ExistingOpenInterval));
    replica_a.stop_at(t - chrono::Duration::hours(3)).unwrap();

    replica_b
        .start(t - chrono::Duration::hours(2), &["tag2".to_string()])
        .unwrap();
    replica_b.stop_at(t - chrono::Duration::hours(1)).unwrap();

    // A publishes, B exchanges, A pulls B's rows back.
    replica_a.sync(&cfg).unwrap();
    set_time(&mut replica_b, now + 10);
    replica_b.sync(&cfg).unwrap();
    set_time(&mut replica_a, now + 20);
    replica_a.sync(&cfg).unwrap();

    let since = t - chrono::Duration::hours(10);
    let until = t + chrono::Duration::hours(10);
    let listed_a = replica_a.list(since, until).unwrap();
    let listed_b = replica_b.list(since, until).unwrap();

    assert_eq!(listed_a.len(), 2);
    assert_eq!(effective(&listed_a), effective(&listed_b));
    assert_eq!(listed_a[0].tags, vec!["tag1".to_string()]);
    assert_eq!(listed_a[1].tags, vec!["tag2".to_string()]);
    replica_a.sanity_check().unwrap();
    replica_b.sanity_check().unwrap();

    // Back-to-back rounds inside one wall second: watermarks must still be
    // strictly increasing, and the rounds must change nothing.
    set_time(&mut replica_a, now + 30);
    let before = effective(&replica_a.list(since, until).unwrap());
    replica_a.sync(&cfg).unwrap();
    replica_a.sync(&cfg).unwrap();
    assert_eq!(before, effective(&replica_a.list(since, until).unwrap()));

    // Tag edits and deletions converge the same way.
    set_time(&mut replica_b, now + 40);
    let id_b = replica_b.list(since, until).unwrap()[1].interval.id.clone();
    replica_b.tag(&id_b, &["tag3".to_string()]).unwrap();
    replica_b.untag(&id_b, &["tag2".to_string()]).unwrap();

    set_time(&mut replica_a, now + 40);
    let id_a = replica_a.list(since, until).unwrap()[0].interval.id.clone();
    replica_a.delete(&id_a).unwrap();

    set_time(&mut replica_a, now + 50);
    replica_a.sync(&cfg).unwrap();
    set_time(&mut replica_b, now + 60);
    replica_b.sync(&cfg).unwrap();
    set_time(&mut replica_a, now + 70);
    replica_a.sync(&cfg).unwrap();

    let listed_a = replica_a.list(since, until).unwrap();
    let listed_b = replica_b.list(since, until).unwrap();
    assert_eq!(effective(&listed_a), effective(&listed_b));
    assert_eq!(listed_a.len(), 1);
    assert_eq!(listed_a[0].tags, vec!["tag3".to_string()]);
    replica_a.sanity_check().unwrap();
    replica_b.sanity_check().unwrap();
}
