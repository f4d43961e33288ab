use anyhow::Result;
use chrono::{DateTime, Duration, Local, Timelike, Utc};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use buzz_core::models::TimelinePoint;
use buzz_core::service::BuzzService;
use buzz_core::timeline::peak;

use super::helpers::no_neg_zero;

const BAR_WIDTH: u32 = 40;
/// How far back `buzz timeline` draws; the JSON output has the full series.
const CHART_HISTORY_HOURS: i64 = 6;

pub(crate) fn cmd_status(svc: &BuzzService, json: bool) -> Result<()> {
    let status = svc.status(&Local::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let level = no_neg_zero(status.current_level.round());
    println!(
        "Caffeine now: {level:.0} mg (half-life {:.1} h)",
        status.half_life_hours
    );
    println!(
        "Today: {:.0} / {:.0} mg ({:.0} mg left)",
        status.consumed_today, status.daily_limit, status.remaining_allowance
    );

    let sleep = &status.sleep;
    let bedtime = sleep.bedtime.with_timezone(&Local).format("%H:%M");
    if sleep.ready {
        println!(
            "Bedtime {bedtime}: {:.0} mg expected, under your {:.0} mg target",
            sleep.level_at_bedtime, sleep.target
        );
    } else {
        let safe = sleep.safe_at.map_or_else(
            || "no safe time found".to_string(),
            |at| format!("safe after {}", at.with_timezone(&Local).format("%a %H:%M")),
        );
        println!(
            "Bedtime {bedtime}: {:.0} mg expected, over your {:.0} mg target ({safe})",
            sleep.level_at_bedtime, sleep.target
        );
    }

    if status.consumed_today > status.daily_limit {
        eprintln!("Warning: over your daily limit");
    }
    Ok(())
}

pub(crate) fn cmd_history(svc: &BuzzService, days: u32, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct HistoryRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Total mg")]
        total: String,
        #[tabled(rename = "Intakes")]
        count: usize,
        #[tabled(rename = "Limit")]
        limit: String,
    }

    let totals = svc.daily_totals(days, &Local::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&totals)?);
        return Ok(());
    }

    if totals.iter().all(|t| t.count == 0) {
        eprintln!("No intakes in the last {days} days");
        process::exit(2);
    }

    let rows: Vec<HistoryRow> = totals
        .iter()
        .map(|t| HistoryRow {
            date: t.date.format("%Y-%m-%d").to_string(),
            total: format!("{:.0}", no_neg_zero(t.total_mg)),
            count: t.count,
            limit: if t.over_limit { "over" } else { "ok" }.to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

pub(crate) fn cmd_timeline(svc: &BuzzService, json: bool) -> Result<()> {
    // The series carries `now` at millisecond precision.
    let now =
        DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now);
    let points = svc.timeline(now)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }

    let shown = chart_points(&points, now);
    let top = peak(&shown).map_or(0.0, |p| p.level);
    if top <= 0.0 {
        eprintln!("No caffeine in your system over this window");
        process::exit(2);
    }

    for p in &shown {
        let marker = if p.time == now { "<- now" } else { "" };
        println!(
            "{}  {:>5.0} mg  {:<width$} {marker}",
            p.time.with_timezone(&Local).format("%a %H:%M"),
            p.level,
            bar(p.level, top),
            width = BAR_WIDTH as usize,
        );
    }
    Ok(())
}

/// On-the-hour samples from a few hours back onwards, plus `now` itself.
fn chart_points(points: &[TimelinePoint], now: DateTime<Utc>) -> Vec<TimelinePoint> {
    let from = now - Duration::hours(CHART_HISTORY_HOURS);
    points
        .iter()
        .filter(|p| p.time >= from)
        .filter(|p| p.time == now || (p.time.minute() == 0 && p.time.second() == 0))
        .copied()
        .collect()
}

#[allow(clippy::cast_sign_loss)]
fn bar(level: f64, top: f64) -> String {
    let width = f64::from(BAR_WIDTH);
    let len = (level / top * width).round().clamp(0.0, width) as usize;
    "#".repeat(len)
}
