//! Chart series: decay levels sampled on an adaptive grid from the start of
//! history to a fixed horizon past now.

use chrono::{DateTime, Utc};

use crate::decay::{decay_constant_for, level_at_ms};
use crate::models::{Intake, TimelinePoint};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// How far back the series reaches when there is no older intake.
pub const HISTORY_WINDOW_MS: i64 = 12 * HOUR_MS;
/// How far past now the series projects.
pub const FUTURE_HORIZON_MS: i64 = 24 * HOUR_MS;
/// Oldest instant the series reaches back to, however old the log is.
pub const MAX_HISTORY_MS: i64 = 90 * DAY_MS;

/// `(largest span, step)` rows; the first row covering the span applies.
const STEP_TABLE: &[(i64, i64)] = &[
    (36 * HOUR_MS, 15 * MINUTE_MS),
    (3 * DAY_MS, 30 * MINUTE_MS),
    (7 * DAY_MS, HOUR_MS),
    (30 * DAY_MS, 2 * HOUR_MS),
];
const WIDEST_STEP_MS: i64 = 4 * HOUR_MS;

/// Grid step for a series covering `span_ms`.
#[must_use]
pub fn step_for_span(span_ms: i64) -> i64 {
    STEP_TABLE
        .iter()
        .find(|(max_span, _)| span_ms <= *max_span)
        .map_or(WIDEST_STEP_MS, |&(_, step)| step)
}

/// Sample instants (epoch ms), ascending and unique.
///
/// The grid runs from `min(now − 12h, earliest intake)`, no further back than
/// `now − 90d` and floored to a step boundary, up to `now + 24h`. The exact
/// `now` and every intake instant within one step of the range are added so
/// peaks never fall between grid points.
#[must_use]
pub fn sample_instants(intakes: &[Intake], now: DateTime<Utc>) -> Vec<i64> {
    let now_ms = now.timestamp_millis();
    let end_ms = now_ms + FUTURE_HORIZON_MS;
    let history_start = now_ms - HISTORY_WINDOW_MS;
    let raw_start = intakes
        .iter()
        .map(Intake::timestamp_ms)
        .min()
        .map_or(history_start, |earliest| earliest.min(history_start))
        .max(now_ms - MAX_HISTORY_MS);

    let step = step_for_span(end_ms - raw_start);
    let start = raw_start.div_euclid(step) * step;

    let mut samples: Vec<i64> = std::iter::successors(Some(start), |t| Some(t + step))
        .take_while(|t| *t <= end_ms)
        .collect();
    samples.push(now_ms);
    samples.extend(
        intakes
            .iter()
            .map(Intake::timestamp_ms)
            .filter(|t| (start - step..=end_ms + step).contains(t)),
    );

    samples.sort_unstable();
    samples.dedup();
    samples
}

/// Evaluate the decay model at every sample instant. Levels are whole mg.
#[must_use]
pub fn generate_timeline(
    intakes: &[Intake],
    half_life_ms: f64,
    now: DateTime<Utc>,
) -> Vec<TimelinePoint> {
    let k = decay_constant_for(half_life_ms);
    sample_instants(intakes, now)
        .into_iter()
        .filter_map(|t| {
            let level = k.map_or(0.0, |k| level_at_ms(intakes, t, k).round());
            DateTime::from_timestamp_millis(t).map(|time| TimelinePoint { time, level })
        })
        .collect()
}

/// Peak point of a series, if any.
#[must_use]
pub fn peak(points: &[TimelinePoint]) -> Option<TimelinePoint> {
    points
        .iter()
        .copied()
        .max_by(|a, b| a.level.total_cmp(&b.level))
}
