//! User-facing timestamp, duration and period parsing.
//!
//! Timestamps accept three shapes, tried in order: RFC 3339, a local
//! date-time without offset, and a bare `HH:MM` meaning today in the local
//! timezone. Durations use the compact `NhNmNs` grammar (`1h30m`, `45m`,
//! `90s`).

use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};

/// Parses a user-supplied timestamp, also usable as a clap value parser.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }

    // Without an offset the local timezone applies.
    if let Ok(t) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return local_to_utc(t);
    }

    // A bare clock time means today.
    if let Ok(t) = NaiveTime::parse_from_str(input, "%H:%M") {
        let today = Local::now().date_naive();
        return local_to_utc(today.and_time(t));
    }

    Err(format!("unparsable timestamp format: {input}"))
}

fn local_to_utc(t: NaiveDateTime) -> Result<DateTime<Utc>, String> {
    match Local.from_local_datetime(&t) {
        // DST fall-back makes the time ambiguous: pick the earlier one.
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => Ok(t.with_timezone(&Utc)),
        LocalResult::None => Err(format!("timestamp does not exist in the local timezone: {t}")),
    }
}

/// Parses a `NhNmNs` duration, also usable as a clap value parser.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut seen_component = false;

    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {input}"))?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid duration unit {c:?}: {input}")),
        };
        total += value * unit;
        seen_component = true;
    }

    if !digits.is_empty() || !seen_component {
        return Err(format!("invalid duration: {input}"));
    }
    Ok(Duration::seconds(total))
}

/// A logical reporting period, anchored on a reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
}

/// Parses the `:day | :week | :month | :year` period argument.
pub fn parse_period(input: &str) -> Result<Period, String> {
    match input {
        ":day" => Ok(Period::Day),
        ":week" => Ok(Period::Week),
        ":month" => Ok(Period::Month),
        ":year" => Ok(Period::Year),
        other => Err(format!("time range not implemented: {other}")),
    }
}

impl Period {
    /// Returns the half-open `[since, until)` window containing `reference`,
    /// computed on local calendar boundaries. Weeks start on Monday.
    pub fn boundaries(self, reference: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = reference.with_timezone(&Local).date_naive();
        match self {
            Period::Day => (
                local_midnight(today),
                local_midnight(today + Duration::days(1)),
            ),
            Period::Week => {
                let monday =
                    today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                (
                    local_midnight(monday),
                    local_midnight(monday + Duration::days(7)),
                )
            }
            Period::Month => {
                let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap();
                let next = if today.month() == 12 {
                    NaiveDate::from_ymd_opt(today.year() + 1, 1, 1).unwrap()
                } else {
                    NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1).unwrap()
                };
                (local_midnight(first), local_midnight(next))
            }
            Period::Year => {
                let first = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap();
                let next = NaiveDate::from_ymd_opt(today.year() + 1, 1, 1).unwrap();
                (local_midnight(first), local_midnight(next))
            }
        }
    }
}

/// Converts a local date at midnight to UTC, handling DST ambiguity by
/// picking the earlier time and a spring-forward gap by falling back to 1am.
fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    match Local.from_local_datetime(&midnight) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        LocalResult::None => {
            let one_am = date.and_time(NaiveTime::from_hms_opt(1, 0, 0).unwrap());
            match Local.from_local_datetime(&one_am) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
                LocalResult::None => Utc.from_utc_datetime(&one_am),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_timestamps_parse() {
        let t = parse_timestamp("2022-02-25T13:30:00Z").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2022, 2, 25, 13, 30, 0).unwrap());

        let t = parse_timestamp("2022-02-25T13:30:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2022, 2, 25, 11, 30, 0).unwrap());
    }

    #[test]
    fn offsetless_timestamps_use_local_time() {
        let t = parse_timestamp("2022-02-25T13:30:00").unwrap();
        let local = Local
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2022, 2, 25)
                    .unwrap()
                    .and_hms_opt(13, 30, 0)
                    .unwrap(),
            )
            .single()
            .unwrap();
        assert_eq!(t, local.with_timezone(&Utc));
    }

    #[test]
    fn bare_clock_time_means_today() {
        let t = parse_timestamp("13:30").unwrap();
        assert_eq!(t.with_timezone(&Local).date_naive(), Local::now().date_naive());
    }

    #[test]
    fn garbage_timestamps_rejected() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("25/02/2022").is_err());
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("45m").unwrap(), Duration::minutes(45));
        assert_eq!(parse_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("2h0m0s").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("0m").unwrap(), Duration::zero());
    }

    #[test]
    fn malformed_durations_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("90").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("1h30").is_err());
    }

    #[test]
    fn period_arguments_parse() {
        assert_eq!(parse_period(":day").unwrap(), Period::Day);
        assert_eq!(parse_period(":week").unwrap(), Period::Week);
        assert!(parse_period("day").is_err());
        assert!(parse_period(":fortnight").is_err());
    }

    #[test]
    fn week_window_starts_on_monday() {
        // 2022-02-25 is a Friday.
        let reference = Utc.with_ymd_and_hms(2022, 2, 25, 12, 0, 0).unwrap();
        let (since, until) = Period::Week.boundaries(reference);

        let since_local = since.with_timezone(&Local).date_naive();
        let until_local = until.with_timezone(&Local).date_naive();
        assert_eq!(since_local.weekday(), chrono::Weekday::Mon);
        assert_eq!(until_local - since_local, Duration::days(7));
        assert!(since <= reference && reference < until);
    }

    #[test]
    fn month_window_contains_reference() {
        let reference = Utc.with_ymd_and_hms(2022, 2, 25, 12, 0, 0).unwrap();
        let (since, until) = Period::Month.boundaries(reference);
        assert!(since <= reference && reference < until);
        assert_eq!(since.with_timezone(&Local).date_naive().day(), 1);
    }

    #[test]
    fn year_window_spans_january_to_january() {
        let reference = Utc.with_ymd_and_hms(2022, 7, 1, 0, 0, 0).unwrap();
        let (since, until) = Period::Year.boundaries(reference);
        let since_local = since.with_timezone(&Local).date_naive();
        let until_local = until.with_timezone(&Local).date_naive();
        assert_eq!((since_local.month(), since_local.day()), (1, 1));
        assert_eq!(until_local.year(), since_local.year() + 1);
    }
}
