//! Flat tabular rendering of recorded intervals.
//!
//! One line per interval: the date on the first row of each day, the
//! per-replica id, start and stop clock times in the local timezone, the
//! interval duration and its tags. A footer totals the durations. Open
//! intervals are measured against the provided "now".

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, Utc};
use punch_db::TaggedInterval;

/// Writes the flat report. The input must already be sorted ascending by
/// start timestamp.
pub fn flat_report<W: Write>(
    out: &mut W,
    intervals: &[TaggedInterval],
    now: DateTime<Utc>,
) -> Result<()> {
    let sorted = intervals
        .windows(2)
        .all(|pair| pair[0].interval.start <= pair[1].interval.start);
    if !sorted {
        return Err(punch_db::Error::InvalidParameter(
            "input tagged intervals are not sorted".to_string(),
        )
        .into());
    }

    let mut total_seconds: i64 = 0;
    let mut previous_day: Option<NaiveDate> = None;

    for tagged in intervals {
        let start_local = tagged.interval.start.with_timezone(&Local);
        let day = start_local.date_naive();
        let date_column = if previous_day == Some(day) {
            String::new()
        } else {
            day.format("%Y-%m-%d").to_string()
        };
        previous_day = Some(day);

        let stop_column = match tagged.interval.stop {
            Some(stop) => stop.with_timezone(&Local).format("%H:%M:%S").to_string(),
            None => String::new(),
        };
        let effective_stop = tagged.interval.stop.unwrap_or(now);
        let seconds = (effective_stop - tagged.interval.start).num_seconds().max(0);
        total_seconds += seconds;

        writeln!(
            out,
            "{:<12}{:<6}{:<10}{:<10}{:<10}{}",
            date_column,
            tagged.interval.id,
            start_local.format("%H:%M:%S").to_string(),
            stop_column,
            format_duration(seconds),
            tagged.tags.join(","),
        )?;
    }

    writeln!(out)?;
    writeln!(out, "{:<38}{}", "Total time", format_duration(total_seconds))?;
    Ok(())
}

/// Formats a second count as `2h30m`, `45m10s` or `30s`.
fn format_duration(total_seconds: i64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
