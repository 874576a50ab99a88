//! Command surface for the punch time tracker.
//!
//! Maps subcommands onto the engine operations of [`punch_db`], computing
//! concrete timestamps from user input. Every engine error propagates out and
//! makes the process exit non-zero.

pub mod cli;
pub mod config;
pub mod report;
pub mod timespec;

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use punch_db::{RelayConfig, TimeTracker};

pub use cli::{Cli, Commands};
pub use config::Config;

/// Runs one parsed invocation, writing report output to `out`.
pub fn run<W: Write>(cli: Cli, out: &mut W) -> Result<()> {
    let config =
        Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    let database_path = cli.db.unwrap_or_else(|| config.database_path.clone());
    let mut tt = TimeTracker::open(&database_path)
        .with_context(|| format!("cannot open database {}", database_path.display()))?;

    match cli.command.unwrap_or(Commands::Current) {
        Commands::Start(args) => {
            let start = resolve_time(args.at, args.ago);
            // Close the running interval at the new start time first; having
            // nothing to stop is not an error here.
            if let Err(err) = tt.stop_at(start) {
                if !err.is_no_rows() {
                    return Err(err).context("cannot stop the currently opened interval");
                }
            }
            tt.start(start, &args.tags)
                .context("cannot start a new interval")?;
        }
        Commands::Stop(args) => {
            if let Some(duration) = args.duration {
                tt.stop_for(duration)
                    .context("cannot stop the currently opened interval")?;
            } else {
                tt.stop_at(resolve_time(args.at, args.ago))
                    .context("cannot stop the currently opened interval")?;
            }
        }
        Commands::List(args) => {
            let reference = args.at.unwrap_or_else(Utc::now);
            let (since, until) = args.period.boundaries(reference);
            let mut intervals = tt
                .list(since, until)
                .context("cannot list recorded intervals")?;
            if let Some(tag) = &args.tag {
                intervals.retain(|tagged| tagged.tags.iter().any(|t| t == tag));
            }
            report::flat_report(out, &intervals, Utc::now())?;
        }
        Commands::Current => {
            if let Some(interval) = tt
                .current()
                .context("cannot retrieve the current interval")?
            {
                report::flat_report(out, &[interval], Utc::now())?;
            }
        }
        Commands::Continue(args) => {
            let start = resolve_time(args.at, None);
            tt.continue_at(start, args.id.as_deref())
                .context("cannot continue a previously closed interval")?;
        }
        Commands::Tag(args) => {
            tt.tag(&args.id, &args.tags)
                .with_context(|| format!("cannot tag interval {}", args.id))?;
        }
        Commands::Untag(args) => {
            tt.untag(&args.id, &args.tags)
                .with_context(|| format!("cannot untag interval {}", args.id))?;
        }
        Commands::Delete(args) => {
            for id in &args.ids {
                tt.delete(id)
                    .with_context(|| format!("cannot delete interval {id}"))?;
            }
        }
        Commands::Record(args) => {
            tt.start(args.start, &args.tags)
                .context("cannot register the new interval start")?;
            tt.stop_at(args.stop)
                .context("cannot register the new interval stop")?;
        }
        Commands::Vacuum(args) => {
            let before = args
                .before
                .unwrap_or_else(|| Utc::now() - args.since.unwrap_or_else(chrono::Duration::zero));
            tt.vacuum(before).context("cannot vacuum the database")?;
        }
        Commands::Sync(args) => {
            let relay = &config.relay;
            let cfg = RelayConfig {
                login: args
                    .login
                    .or_else(|| relay.login.clone())
                    .context("missing relay login")?,
                password: args
                    .password
                    .or_else(|| relay.password.clone())
                    .context("missing relay password")?,
                hostname: args
                    .hostname
                    .or_else(|| relay.hostname.clone())
                    .context("missing relay hostname")?,
                port: args.port.or(relay.port).context("missing relay port")?,
                database_name: args
                    .database_name
                    .or_else(|| relay.database_name.clone())
                    .context("missing relay database name")?,
            };
            tt.sync(&cfg)
                .context("cannot synchronise with the relay database")?;
        }
    }

    Ok(())
}

fn resolve_time(at: Option<DateTime<Utc>>, ago: Option<chrono::Duration>) -> DateTime<Utc> {
    match (at, ago) {
        (Some(t), _) => t,
        (None, Some(d)) => Utc::now() - d,
        (None, None) => Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(args).expect("arguments parse");
        let mut out = Vec::new();
        run(cli, &mut out)?;
        Ok(String::from_utf8(out).expect("utf-8 output"))
    }

    fn db_flag(temp: &tempfile::TempDir) -> String {
        temp.path().join("punch.db").display().to_string()
    }

    #[test]
    fn record_then_list_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);

        run_args(&[
            "punch",
            "--db",
            &db,
            "record",
            "2022-02-25T12:00:00Z",
            "2022-02-25T13:00:00Z",
            "tag1",
            "tag2",
        ])
        .unwrap();

        let rendered = run_args(&[
            "punch",
            "--db",
            &db,
            "list",
            ":month",
            "--at",
            "2022-02-25T12:00:00Z",
        ])
        .unwrap();
        assert!(rendered.contains("tag1,tag2"));
        assert!(rendered.contains("1h00m"));
    }

    #[test]
    fn list_filters_on_tag() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);

        run_args(&[
            "punch", "--db", &db, "record",
            "2022-02-25T12:00:00Z", "2022-02-25T13:00:00Z", "backend",
        ])
        .unwrap();
        run_args(&[
            "punch", "--db", &db, "record",
            "2022-02-25T14:00:00Z", "2022-02-25T15:00:00Z", "frontend",
        ])
        .unwrap();

        let rendered = run_args(&[
            "punch", "--db", &db, "list", ":month",
            "--at", "2022-02-25T12:00:00Z", "--tag", "backend",
        ])
        .unwrap();
        assert!(rendered.contains("backend"));
        assert!(!rendered.contains("frontend"));
    }

    #[test]
    fn start_inside_closed_interval_fails() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);

        run_args(&[
            "punch", "--db", &db, "record",
            "2022-02-25T12:00:00Z", "2022-02-25T13:00:00Z",
        ])
        .unwrap();

        let err = run_args(&[
            "punch", "--db", &db, "start", "--at", "2022-02-25T12:30:00Z",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cannot start"));
    }

    #[test]
    fn start_replaces_the_open_interval() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);

        run_args(&[
            "punch", "--db", &db, "start", "--at", "2022-02-25T12:00:00Z", "first",
        ])
        .unwrap();
        run_args(&[
            "punch", "--db", &db, "start", "--at", "2022-02-25T13:00:00Z", "second",
        ])
        .unwrap();

        let rendered = run_args(&[
            "punch", "--db", &db, "list", ":month", "--at", "2022-02-25T12:00:00Z",
        ])
        .unwrap();
        // The first interval was closed at 13:00 when the second one started.
        assert!(rendered.contains("first"));
        assert!(rendered.contains("1h00m"));
        assert!(rendered.contains("second"));
    }

    #[test]
    fn current_is_the_default_command() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);

        let rendered = run_args(&["punch", "--db", &db]).unwrap();
        assert!(rendered.is_empty());

        run_args(&[
            "punch", "--db", &db, "start", "--at", "2022-02-25T12:00:00Z", "work",
        ])
        .unwrap();
        let rendered = run_args(&["punch", "--db", &db]).unwrap();
        assert!(rendered.contains("work"));
    }

    #[test]
    fn vacuum_reports_not_implemented() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);

        let err = run_args(&["punch", "--db", &db, "vacuum", "--since", "720h"]).unwrap_err();
        assert!(err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<punch_db::Error>(),
                Some(punch_db::Error::NotImplemented)
            )
        }));
    }

    #[test]
    fn sync_without_credentials_fails_with_context() {
        let temp = tempfile::tempdir().unwrap();
        let db = db_flag(&temp);
        // An unrelated config file leaves the relay section empty.
        let config_path = temp.path().join("config.toml");
        std::fs::write(&config_path, "").unwrap();

        let cli = Cli::try_parse_from([
            "punch",
            "--db",
            &db,
            "--config",
            config_path.to_str().unwrap(),
            "sync",
        ])
        .unwrap();
        let mut out = Vec::new();
        let err = run(cli, &mut out).unwrap_err();
        assert!(err.to_string().contains("missing relay"));
    }
}
