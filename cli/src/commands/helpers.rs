use anyhow::{Context, Result, bail};
use chrono::{DateTime, Days, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use buzz_core::models::parse_clock_time;

/// Resolve `--at` against `now`.
///
/// Accepts `HH:MM` (the most recent such time, so `23:30` typed after midnight
/// means last night), `YYYY-MM-DD HH:MM` in local time, or RFC 3339.
pub(crate) fn parse_at<Tz: TimeZone>(s: &str, now: &DateTime<Tz>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    let tz = now.timezone();
    let resolve = |naive: NaiveDateTime| {
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("'{s}' does not exist in the local time zone"))
    };

    if let Some(clock) = parse_clock_time(s) {
        let time = NaiveTime::from_hms_opt(clock.hour(), clock.minute(), 0)
            .context("Invalid time of day")?;
        let today = now.date_naive();
        let at = resolve(today.and_time(time))?;
        if at <= now.with_timezone(&Utc) {
            return Ok(at);
        }
        let yesterday = today
            .checked_sub_days(Days::new(1))
            .context("Date out of range")?;
        return resolve(yesterday.and_time(time));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M") {
        return resolve(naive);
    }

    bail!("Invalid time '{s}'. Use HH:MM, 'YYYY-MM-DD HH:MM' or RFC 3339")
}

/// `YYYY-MM-DD HH:MM` in the local zone.
pub(crate) fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub(crate) fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(i, _)| &id[..i])
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
