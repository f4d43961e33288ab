//! Repair of persisted data. Anything read back from storage (or received from
//! a remote) passes through here before the engine sees it. These functions
//! never fail: bad fields fall back to defaults, bad records are dropped.

use std::ops::RangeInclusive;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::models::{
    CAFFEINE_LIMIT_MG, DEFAULT_CATEGORY, DEFAULT_INTAKE_NAME, Intake, MAX_INTAKE_MG,
    SLEEP_TARGET_MG, Settings, parse_clock_time,
};

/// Build a complete settings record from an arbitrary blob. Non-objects
/// (including `null`) give the defaults.
#[must_use]
pub fn normalize_settings(raw: &Value) -> Settings {
    let defaults = Settings::default();
    let Some(obj) = raw.as_object() else {
        return defaults;
    };

    Settings {
        metabolism_rate: obj
            .get("metabolismRate")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.metabolism_rate),
        caffeine_limit: clamped_number(obj, "caffeineLimit", &CAFFEINE_LIMIT_MG)
            .unwrap_or(defaults.caffeine_limit),
        bedtime: obj
            .get("bedtime")
            .and_then(Value::as_str)
            .and_then(parse_clock_time)
            .unwrap_or(defaults.bedtime),
        target_sleep_caffeine: clamped_number(obj, "targetSleepCaffeine", &SLEEP_TARGET_MG)
            .unwrap_or(defaults.target_sleep_caffeine),
        pregnancy_adjustment: flag(obj, "pregnancyAdjustment")
            .unwrap_or(defaults.pregnancy_adjustment),
        smoker_adjustment: flag(obj, "smokerAdjustment").unwrap_or(defaults.smoker_adjustment),
        oral_contraceptive_adjustment: flag(obj, "oralContraceptiveAdjustment")
            .unwrap_or(defaults.oral_contraceptive_adjustment),
    }
}

/// Parse a stored settings string; missing or unparsable text gives the defaults.
#[must_use]
pub fn parse_settings(raw: Option<&str>) -> Settings {
    normalize_settings(&parse_json(raw))
}

/// Keep every element that has an id, a parseable timestamp and a finite
/// amount within `[0, 2000]`, filling defaults for the rest. Input order is kept.
#[must_use]
pub fn normalize_intakes(raw: &Value) -> Vec<Intake> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    let intakes: Vec<Intake> = items.iter().filter_map(normalize_intake).collect();

    let dropped = items.len() - intakes.len();
    if dropped > 0 {
        tracing::debug!(dropped, kept = intakes.len(), "discarded malformed intake records");
    }
    intakes
}

/// Parse a stored intake list string; missing or unparsable text gives an empty list.
#[must_use]
pub fn parse_intakes(raw: Option<&str>) -> Vec<Intake> {
    normalize_intakes(&parse_json(raw))
}

#[must_use]
pub fn normalize_intake(raw: &Value) -> Option<Intake> {
    let obj = raw.as_object()?;

    let id = identifier(obj.get("id")?)?;
    let timestamp = parse_timestamp(obj.get("timestamp")?)?;
    let amount = obj
        .get("amount")
        .and_then(coerce_number)
        .filter(|a| a.is_finite() && (0.0..=MAX_INTAKE_MG).contains(a))?;

    let client_id = obj
        .get("clientId")
        .and_then(identifier)
        .unwrap_or_else(|| id.clone());
    let cloud_id = obj.get("cloudId").and_then(identifier);
    let updated_at = obj
        .get("updatedAt")
        .and_then(coerce_number)
        .filter(|n| n.is_finite())
        .map_or_else(|| timestamp.timestamp_millis(), |n| n.round() as i64);

    Some(Intake {
        id,
        client_id,
        cloud_id,
        name: non_empty(obj.get("name")).unwrap_or_else(|| DEFAULT_INTAKE_NAME.to_string()),
        amount,
        category: non_empty(obj.get("category")).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        timestamp,
        updated_at,
    })
}

/// Accepts RFC 3339, naive ISO date-times (taken as UTC) and epoch milliseconds.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => {
            let ms = n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f.round() as i64)
            })?;
            DateTime::from_timestamp_millis(ms)
        }
        _ => None,
    }
}

fn parse_json(raw: Option<&str>) -> Value {
    let Some(text) = raw else {
        return Value::Null;
    };
    serde_json::from_str(text).unwrap_or_else(|err| {
        tracing::debug!(%err, "stored JSON is unreadable, using defaults");
        Value::Null
    })
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            // Integral floats read like integers: `17.0` is "17".
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => {
                (f as i64).to_string()
            }
            _ => n.to_string(),
        }),
        _ => None,
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn clamped_number(obj: &Map<String, Value>, key: &str, range: &RangeInclusive<f64>) -> Option<f64> {
    obj.get(key)
        .and_then(coerce_number)
        .filter(|n| n.is_finite())
        .map(|n| n.clamp(*range.start(), *range.end()))
}

fn flag(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    }
}
