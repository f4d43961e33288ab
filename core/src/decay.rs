//! First-order elimination model: every intake decays independently with the
//! same rate constant and the remaining amounts add up.
//!
//! ```text
//! level(t) = Σ amountᵢ · e^(−k · (t − tᵢ))    for tᵢ ≤ t
//! k        = ln 2 / half_life
//! ```

use std::f64::consts::LN_2;

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::models::{
    ClockTime, Intake, ORAL_CONTRACEPTIVE_FACTOR, PREGNANCY_FACTOR, SMOKER_FACTOR, Settings,
    SleepReadiness,
};

pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// Half-life in hours after applying every active physiological adjustment.
#[must_use]
pub fn half_life_hours(settings: &Settings) -> f64 {
    let mut hours = settings.metabolism_rate.base_half_life_hours();
    if settings.pregnancy_adjustment {
        hours *= PREGNANCY_FACTOR;
    }
    if settings.smoker_adjustment {
        hours *= SMOKER_FACTOR;
    }
    if settings.oral_contraceptive_adjustment {
        hours *= ORAL_CONTRACEPTIVE_FACTOR;
    }
    hours
}

#[must_use]
pub fn half_life_ms(settings: &Settings) -> f64 {
    half_life_hours(settings) * MS_PER_HOUR
}

/// Rate constant per millisecond, or `None` when the half-life is not a
/// positive finite duration.
#[must_use]
pub fn decay_constant_for(half_life_ms: f64) -> Option<f64> {
    (half_life_ms.is_finite() && half_life_ms > 0.0).then(|| LN_2 / half_life_ms)
}

/// `ln 2 / (half_life_hours · 3 600 000)`.
#[must_use]
pub fn decay_constant(settings: &Settings) -> f64 {
    decay_constant_for(half_life_ms(settings)).unwrap_or(0.0)
}

/// Remaining caffeine (mg) at `at`. Intakes later than `at` contribute nothing.
/// An invalid half-life yields 0.
#[must_use]
pub fn level_at(intakes: &[Intake], at: DateTime<Utc>, half_life_ms: f64) -> f64 {
    match decay_constant_for(half_life_ms) {
        Some(k) => level_at_ms(intakes, at.timestamp_millis(), k),
        None => 0.0,
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn level_at_ms(intakes: &[Intake], at_ms: i64, k: f64) -> f64 {
    let total: f64 = intakes
        .iter()
        .filter(|i| i.amount.is_finite() && i.amount > 0.0)
        .filter_map(|i| {
            let elapsed = at_ms - i.timestamp_ms();
            (elapsed >= 0).then(|| i.amount * (-k * elapsed as f64).exp())
        })
        .sum();
    total.max(0.0)
}

#[must_use]
pub fn current_level(intakes: &[Intake], settings: &Settings, now: DateTime<Utc>) -> f64 {
    level_at(intakes, now, half_life_ms(settings))
}

/// Total mg taken with timestamps in `[from, to)`.
#[must_use]
pub fn consumed_between(intakes: &[Intake], from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    intakes
        .iter()
        .filter(|i| i.timestamp >= from && i.timestamp < to)
        .map(|i| i.amount)
        .filter(|a| a.is_finite())
        .sum()
}

/// Next occurrence of `bedtime` in `now`'s time zone, at or after `now`.
#[must_use]
pub fn next_bedtime<Tz: TimeZone>(now: &DateTime<Tz>, bedtime: ClockTime) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(bedtime.hour(), bedtime.minute(), 0)
        .unwrap_or(NaiveTime::MIN);
    let tz = now.timezone();
    let today = now.date_naive();

    for days in 0..=2 {
        let naive = (today + Duration::days(days)).and_time(time);
        if let Some(candidate) = resolve_local(&tz, naive) {
            if candidate >= *now {
                return candidate.with_timezone(&Utc);
            }
        }
    }
    now.with_timezone(&Utc) + Duration::days(1)
}

// Wall-clock times skipped by a DST jump resolve to the same time an hour later.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// First instant at or after `max(from, latest intake)` at which the level is
/// at or below `threshold`.
///
/// All intakes share one rate constant, so past the latest intake the level is
/// a single exponential and the crossing has a closed form. Returns `None` for
/// an invalid half-life, or when a positive level must reach a threshold ≤ 0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn safe_to_sleep_at(
    intakes: &[Intake],
    half_life_ms: f64,
    threshold: f64,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let k = decay_constant_for(half_life_ms)?;
    let from_ms = from.timestamp_millis();
    let reference_ms = intakes
        .iter()
        .map(Intake::timestamp_ms)
        .max()
        .map_or(from_ms, |latest| latest.max(from_ms));

    let level = level_at_ms(intakes, reference_ms, k);
    if level <= threshold {
        return DateTime::from_timestamp_millis(reference_ms);
    }
    if threshold <= 0.0 {
        return None;
    }
    let wait_ms = ((level / threshold).ln() / k).ceil();
    DateTime::from_timestamp_millis(reference_ms.saturating_add(wait_ms as i64))
}

/// Projection of tonight's bedtime level against the sleep target.
#[must_use]
pub fn sleep_readiness<Tz: TimeZone>(
    intakes: &[Intake],
    settings: &Settings,
    now: &DateTime<Tz>,
) -> SleepReadiness {
    let bedtime = next_bedtime(now, settings.bedtime);
    let half_life = half_life_ms(settings);
    let level = level_at(intakes, bedtime, half_life);
    let target = settings.target_sleep_caffeine;

    SleepReadiness {
        bedtime,
        level_at_bedtime: level.round(),
        target,
        ready: level <= target,
        safe_at: safe_to_sleep_at(intakes, half_life, target, now.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetabolismRate;
    use chrono::FixedOffset;

    fn intake(amount: f64, at: &str) -> Intake {
        let timestamp: DateTime<Utc> = at.parse().unwrap();
        Intake {
            id: format!("id-{at}"),
            client_id: format!("c-{at}"),
            cloud_id: None,
            name: "Coffee".to_string(),
            amount,
            category: "coffee".to_string(),
            timestamp,
            updated_at: timestamp.timestamp_millis(),
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    const HOUR_MS: f64 = MS_PER_HOUR;

    #[test]
    fn test_half_life_base_rates() {
        let mut s = Settings::default();
        assert!((half_life_hours(&s) - 5.5).abs() < 1e-12);
        s.metabolism_rate = MetabolismRate::Fast;
        assert!((half_life_hours(&s) - 4.0).abs() < 1e-12);
        s.metabolism_rate = MetabolismRate::Slow;
        assert!((half_life_hours(&s) - 7.5).abs() < 1e-12);
    }

    #[test]
    fn test_pregnancy_adjustment_half_life() {
        let s = Settings {
            pregnancy_adjustment: true,
            ..Settings::default()
        };
        assert!((half_life_hours(&s) - 8.25).abs() < 1e-12);
        let expected = LN_2 / (8.25 * 3_600_000.0);
        assert!((decay_constant(&s) - expected).abs() < 1e-20);
    }

    #[test]
    fn test_adjustments_combine_multiplicatively() {
        let s = Settings {
            pregnancy_adjustment: true,
            smoker_adjustment: true,
            oral_contraceptive_adjustment: true,
            ..Settings::default()
        };
        let expected = 5.5 * 1.5 * 0.7 * 1.3;
        assert!((half_life_hours(&s) - expected).abs() < 1e-9);

        let base = decay_constant(&Settings::default());
        assert!((decay_constant(&s) * (1.5 * 0.7 * 1.3) - base).abs() < 1e-18);
    }

    #[test]
    fn test_decay_constant_invalid_half_life() {
        assert!(decay_constant_for(0.0).is_none());
        assert!(decay_constant_for(-1.0).is_none());
        assert!(decay_constant_for(f64::NAN).is_none());
        assert!(decay_constant_for(f64::INFINITY).is_none());
        assert!(decay_constant_for(1.0).is_some());
    }

    #[test]
    fn test_level_at_intake_time_is_full_dose() {
        let intakes = [intake(120.0, "2024-06-15T08:00:00Z")];
        let level = level_at(&intakes, ts("2024-06-15T08:00:00Z"), 5.5 * HOUR_MS);
        assert!((level - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_level_after_one_half_life() {
        let intakes = [intake(200.0, "2024-06-15T08:00:00Z")];
        let level = level_at(&intakes, ts("2024-06-15T12:00:00Z"), 4.0 * HOUR_MS);
        assert!((level - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_average_metabolism_two_hours() {
        let intakes = [intake(100.0, "2024-06-15T08:00:00Z")];
        let level = current_level(&intakes, &Settings::default(), ts("2024-06-15T10:00:00Z"));
        let expected = 100.0 * 2f64.powf(-2.0 / 5.5);
        assert!((level - expected).abs() < 1e-9);
        assert!((level - 74.6).abs() < 0.05);
        assert!((level.round() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_future_intakes_contribute_nothing() {
        let intakes = [
            intake(100.0, "2024-06-15T08:00:00Z"),
            intake(300.0, "2024-06-15T18:00:00Z"),
        ];
        let at = ts("2024-06-15T08:00:00Z");
        assert!((level_at(&intakes, at, 5.5 * HOUR_MS) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_or_negative_half_life_yields_zero() {
        let intakes = [intake(100.0, "2024-06-15T08:00:00Z")];
        let at = ts("2024-06-15T09:00:00Z");
        assert!(level_at(&intakes, at, 0.0).abs() < f64::EPSILON);
        assert!(level_at(&intakes, at, -3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_level_is_order_independent_and_linear() {
        let a = intake(80.0, "2024-06-15T07:00:00Z");
        let b = intake(150.0, "2024-06-15T09:30:00Z");
        let at = ts("2024-06-15T13:00:00Z");
        let hl = 5.5 * HOUR_MS;

        let ab = level_at(&[a.clone(), b.clone()], at, hl);
        let ba = level_at(&[b.clone(), a.clone()], at, hl);
        assert!((ab - ba).abs() < 1e-9);

        let sum = level_at(std::slice::from_ref(&a), at, hl)
            + level_at(std::slice::from_ref(&b), at, hl);
        assert!((ab - sum).abs() < 1e-9);
    }

    #[test]
    fn test_empty_intakes_level_zero() {
        assert!(level_at(&[], ts("2024-06-15T08:00:00Z"), HOUR_MS).abs() < f64::EPSILON);
    }

    #[test]
    fn test_consumed_between_is_half_open() {
        let intakes = [
            intake(100.0, "2024-06-14T23:59:00Z"),
            intake(80.0, "2024-06-15T00:00:00Z"),
            intake(60.0, "2024-06-15T12:00:00Z"),
            intake(40.0, "2024-06-16T00:00:00Z"),
        ];
        let total = consumed_between(
            &intakes,
            ts("2024-06-15T00:00:00Z"),
            ts("2024-06-16T00:00:00Z"),
        );
        assert!((total - 140.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_next_bedtime_later_today() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap();
        let bedtime = next_bedtime(&now, ClockTime::new(23, 0).unwrap());
        assert_eq!(bedtime, ts("2024-06-15T21:00:00Z"));
    }

    #[test]
    fn test_next_bedtime_rolls_to_tomorrow() {
        let tz = FixedOffset::east_opt(0).unwrap();
        let now = tz.with_ymd_and_hms(2024, 6, 15, 23, 30, 0).unwrap();
        let bedtime = next_bedtime(&now, ClockTime::new(23, 0).unwrap());
        assert_eq!(bedtime, ts("2024-06-16T23:00:00Z"));
    }

    #[test]
    fn test_next_bedtime_after_midnight_setting() {
        let now = ts("2024-06-15T22:00:00Z");
        let bedtime = next_bedtime(&now, ClockTime::new(0, 30).unwrap());
        assert_eq!(bedtime, ts("2024-06-16T00:30:00Z"));
    }

    #[test]
    fn test_safe_to_sleep_at_closed_form() {
        let intakes = [intake(200.0, "2024-06-15T08:00:00Z")];
        let from = ts("2024-06-15T08:00:00Z");
        // 200 → 50 takes two half-lives.
        let safe = safe_to_sleep_at(&intakes, 4.0 * HOUR_MS, 50.0, from).unwrap();
        let diff = (safe - ts("2024-06-15T16:00:00Z")).num_milliseconds().abs();
        assert!(diff <= 1);
    }

    #[test]
    fn test_safe_to_sleep_already_below() {
        let intakes = [intake(20.0, "2024-06-15T08:00:00Z")];
        let from = ts("2024-06-15T09:00:00Z");
        assert_eq!(
            safe_to_sleep_at(&intakes, 5.5 * HOUR_MS, 50.0, from),
            Some(from)
        );
    }

    #[test]
    fn test_safe_to_sleep_waits_for_future_intake() {
        let intakes = [intake(20.0, "2024-06-15T18:00:00Z")];
        let from = ts("2024-06-15T09:00:00Z");
        assert_eq!(
            safe_to_sleep_at(&intakes, 5.5 * HOUR_MS, 50.0, from),
            Some(ts("2024-06-15T18:00:00Z"))
        );
    }

    #[test]
    fn test_safe_to_sleep_unreachable() {
        let intakes = [intake(100.0, "2024-06-15T08:00:00Z")];
        let from = ts("2024-06-15T09:00:00Z");
        assert!(safe_to_sleep_at(&intakes, 5.5 * HOUR_MS, 0.0, from).is_none());
        assert!(safe_to_sleep_at(&intakes, 0.0, 50.0, from).is_none());
    }

    #[test]
    fn test_sleep_readiness() {
        let settings = Settings {
            metabolism_rate: MetabolismRate::Fast,
            target_sleep_caffeine: 50.0,
            bedtime: ClockTime::new(16, 0).unwrap(),
            ..Settings::default()
        };
        let intakes = [intake(200.0, "2024-06-15T08:00:00Z")];
        let now = ts("2024-06-15T09:00:00Z");
        let readiness = sleep_readiness(&intakes, &settings, &now);
        assert_eq!(readiness.bedtime, ts("2024-06-15T16:00:00Z"));
        assert!((readiness.level_at_bedtime - 50.0).abs() < f64::EPSILON);
        assert!(readiness.safe_at.is_some());

        let late = Settings {
            bedtime: ClockTime::new(20, 0).unwrap(),
            ..settings
        };
        let readiness = sleep_readiness(&intakes, &late, &now);
        assert!(readiness.ready);
        assert!(readiness.level_at_bedtime < 50.0);
    }
}
