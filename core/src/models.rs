use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Largest single intake accepted, in mg.
pub const MAX_INTAKE_MG: f64 = 2000.0;

pub const CAFFEINE_LIMIT_MG: RangeInclusive<f64> = 50.0..=1000.0;
pub const SLEEP_TARGET_MG: RangeInclusive<f64> = 0.0..=200.0;

pub const DEFAULT_CAFFEINE_LIMIT_MG: f64 = 400.0;
pub const DEFAULT_SLEEP_TARGET_MG: f64 = 50.0;
pub const DEFAULT_BEDTIME: ClockTime = ClockTime {
    hour: 23,
    minute: 0,
};

pub const PREGNANCY_FACTOR: f64 = 1.5;
pub const SMOKER_FACTOR: f64 = 0.7;
pub const ORAL_CONTRACEPTIVE_FACTOR: f64 = 1.3;

pub const DEFAULT_INTAKE_NAME: &str = "Caffeine";
pub const DEFAULT_CATEGORY: &str = "custom";

pub const INTAKE_CATEGORIES: &[&str] = &[
    "coffee",
    "espresso",
    "tea",
    "energy",
    "soda",
    "chocolate",
    "supplement",
    "custom",
];

// --- Intakes ---

/// One logged drink. `client_id` is the identity used when reconciling with a
/// remote copy; `id` is only meaningful to the store that holds the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intake {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub cloud_id: Option<String>,
    pub name: String,
    pub amount: f64,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    /// Logical clock in epoch milliseconds.
    pub updated_at: i64,
}

impl Intake {
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// True when both records carry the same user-visible content and clock.
    /// Store-local identifiers (`id`, `cloud_id`) are ignored.
    #[must_use]
    pub fn same_content(&self, other: &Intake) -> bool {
        self.client_id == other.client_id
            && self.name == other.name
            && self.amount.to_bits() == other.amount.to_bits()
            && self.category == other.category
            && self.timestamp == other.timestamp
            && self.updated_at == other.updated_at
    }
}

#[derive(Debug, Clone)]
pub struct NewIntake {
    pub name: String,
    pub amount: f64,
    pub category: String,
    /// When the drink was taken; defaults to now.
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub total_mg: f64,
    pub count: usize,
    pub over_limit: bool,
}

// --- Settings ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetabolismRate {
    Fast,
    #[default]
    Average,
    Slow,
}

impl MetabolismRate {
    #[must_use]
    pub fn base_half_life_hours(self) -> f64 {
        match self {
            Self::Fast => 4.0,
            Self::Average => 5.5,
            Self::Slow => 7.5,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Average => "average",
            Self::Slow => "slow",
        }
    }
}

impl FromStr for MetabolismRate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "average" => Ok(Self::Average),
            "slow" => Ok(Self::Slow),
            _ => bail!("Invalid metabolism rate '{s}'. Must be one of: fast, average, slow"),
        }
    }
}

impl fmt::Display for MetabolismRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wall-clock time of day, serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime {
    hour: u32,
    minute: u32,
}

impl ClockTime {
    #[must_use]
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    #[must_use]
    pub fn hour(self) -> u32 {
        self.hour
    }

    #[must_use]
    pub fn minute(self) -> u32 {
        self.minute
    }
}

/// Parse `HH:MM` (24h). A single-digit hour is accepted, minutes need two digits.
#[must_use]
pub fn parse_clock_time(s: &str) -> Option<ClockTime> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().all(|b| b.is_ascii_digit()) || !m.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ClockTime::new(h.parse().ok()?, m.parse().ok()?)
}

impl FromStr for ClockTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_clock_time(s)
            .ok_or_else(|| anyhow::anyhow!("Invalid time '{s}'. Use HH:MM (24h), e.g. 22:30"))
    }
}

impl TryFrom<String> for ClockTime {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ClockTime> for String {
    fn from(t: ClockTime) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct Settings {
    pub metabolism_rate: MetabolismRate,
    pub caffeine_limit: f64,
    pub bedtime: ClockTime,
    pub target_sleep_caffeine: f64,
    pub pregnancy_adjustment: bool,
    pub smoker_adjustment: bool,
    pub oral_contraceptive_adjustment: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metabolism_rate: MetabolismRate::Average,
            caffeine_limit: DEFAULT_CAFFEINE_LIMIT_MG,
            bedtime: DEFAULT_BEDTIME,
            target_sleep_caffeine: DEFAULT_SLEEP_TARGET_MG,
            pregnancy_adjustment: false,
            smoker_adjustment: false,
            oral_contraceptive_adjustment: false,
        }
    }
}

/// Per-field settings update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub metabolism_rate: Option<MetabolismRate>,
    pub caffeine_limit: Option<f64>,
    pub bedtime: Option<ClockTime>,
    pub target_sleep_caffeine: Option<f64>,
    pub pregnancy_adjustment: Option<bool>,
    pub smoker_adjustment: Option<bool>,
    pub oral_contraceptive_adjustment: Option<bool>,
}

impl SettingsPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metabolism_rate.is_none()
            && self.caffeine_limit.is_none()
            && self.bedtime.is_none()
            && self.target_sleep_caffeine.is_none()
            && self.pregnancy_adjustment.is_none()
            && self.smoker_adjustment.is_none()
            && self.oral_contraceptive_adjustment.is_none()
    }

    /// Validate and apply onto `settings`. Nothing is written if any field is invalid.
    pub fn apply(&self, settings: &mut Settings) -> Result<()> {
        if let Some(limit) = self.caffeine_limit {
            validate_range("caffeine limit", limit, &CAFFEINE_LIMIT_MG)?;
        }
        if let Some(target) = self.target_sleep_caffeine {
            validate_range("sleep target", target, &SLEEP_TARGET_MG)?;
        }

        if let Some(rate) = self.metabolism_rate {
            settings.metabolism_rate = rate;
        }
        if let Some(limit) = self.caffeine_limit {
            settings.caffeine_limit = limit;
        }
        if let Some(bedtime) = self.bedtime {
            settings.bedtime = bedtime;
        }
        if let Some(target) = self.target_sleep_caffeine {
            settings.target_sleep_caffeine = target;
        }
        if let Some(v) = self.pregnancy_adjustment {
            settings.pregnancy_adjustment = v;
        }
        if let Some(v) = self.smoker_adjustment {
            settings.smoker_adjustment = v;
        }
        if let Some(v) = self.oral_contraceptive_adjustment {
            settings.oral_contraceptive_adjustment = v;
        }
        Ok(())
    }
}

// --- Derived values ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub time: DateTime<Utc>,
    /// Remaining caffeine in whole mg.
    pub level: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SleepReadiness {
    pub bedtime: DateTime<Utc>,
    pub level_at_bedtime: f64,
    pub target: f64,
    pub ready: bool,
    /// First instant the level drops to the target; `None` if it never does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaffeineStatus {
    pub now: DateTime<Utc>,
    pub current_level: f64,
    pub half_life_hours: f64,
    pub consumed_today: f64,
    pub daily_limit: f64,
    pub remaining_allowance: f64,
    pub sleep: SleepReadiness,
}

// --- Validation ---

pub fn validate_category(category: &str) -> Result<String> {
    let lower = category.trim().to_lowercase();
    if INTAKE_CATEGORIES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid category '{category}'. Must be one of: {}",
            INTAKE_CATEGORIES.join(", ")
        )
    }
}

/// Validate a user-entered dose: finite, positive, at most [`MAX_INTAKE_MG`].
pub fn validate_amount(amount: f64) -> Result<f64> {
    if !amount.is_finite() {
        bail!("Amount must be a number");
    }
    if amount <= 0.0 {
        bail!("Amount must be greater than 0 mg");
    }
    if amount > MAX_INTAKE_MG {
        bail!("Amount must be at most {MAX_INTAKE_MG:.0} mg");
    }
    Ok(amount)
}

fn validate_range(label: &str, value: f64, range: &RangeInclusive<f64>) -> Result<()> {
    if !value.is_finite() || !range.contains(&value) {
        bail!(
            "The {label} must be between {:.0} and {:.0} mg",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_categories() {
        assert_eq!(validate_category("coffee").unwrap(), "coffee");
        assert_eq!(validate_category("Tea").unwrap(), "tea");
        assert_eq!(validate_category(" ENERGY ").unwrap(), "energy");
    }

    #[test]
    fn test_invalid_category() {
        assert!(validate_category("beer").is_err());
        assert!(validate_category("").is_err());
    }

    #[test]
    fn test_validate_amount() {
        assert!((validate_amount(95.0).unwrap() - 95.0).abs() < f64::EPSILON);
        assert!(validate_amount(2000.0).is_ok());
        assert!(validate_amount(0.0).is_err());
        assert!(validate_amount(-5.0).is_err());
        assert!(validate_amount(2000.5).is_err());
        assert!(validate_amount(f64::NAN).is_err());
        assert!(validate_amount(f64::INFINITY).is_err());
    }

    #[test]
    fn test_metabolism_half_lives() {
        assert!((MetabolismRate::Fast.base_half_life_hours() - 4.0).abs() < f64::EPSILON);
        assert!((MetabolismRate::Average.base_half_life_hours() - 5.5).abs() < f64::EPSILON);
        assert!((MetabolismRate::Slow.base_half_life_hours() - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metabolism_from_str() {
        assert_eq!("FAST".parse::<MetabolismRate>().unwrap(), MetabolismRate::Fast);
        assert_eq!(" slow".parse::<MetabolismRate>().unwrap(), MetabolismRate::Slow);
        assert!("medium".parse::<MetabolismRate>().is_err());
    }

    #[test]
    fn test_parse_clock_time() {
        assert_eq!(parse_clock_time("23:00"), ClockTime::new(23, 0));
        assert_eq!(parse_clock_time("7:05"), ClockTime::new(7, 5));
        assert_eq!(parse_clock_time("00:59"), ClockTime::new(0, 59));
        assert!(parse_clock_time("24:00").is_none());
        assert!(parse_clock_time("12:60").is_none());
        assert!(parse_clock_time("12:5").is_none());
        assert!(parse_clock_time("1200").is_none());
        assert!(parse_clock_time("+1:00").is_none());
        assert!(parse_clock_time("").is_none());
    }

    #[test]
    fn test_clock_time_display_and_serde() {
        let t = ClockTime::new(7, 5).unwrap();
        assert_eq!(t.to_string(), "07:05");
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"07:05\"");
        let back: ClockTime = serde_json::from_str("\"22:30\"").unwrap();
        assert_eq!(back, ClockTime::new(22, 30).unwrap());
        assert!(serde_json::from_str::<ClockTime>("\"25:00\"").is_err());
    }

    #[test]
    fn test_settings_default_json_shape() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["metabolismRate"], "average");
        assert_eq!(json["caffeineLimit"], 400.0);
        assert_eq!(json["bedtime"], "23:00");
        assert_eq!(json["targetSleepCaffeine"], 50.0);
        assert_eq!(json["pregnancyAdjustment"], false);
        assert_eq!(json["smokerAdjustment"], false);
        assert_eq!(json["oralContraceptiveAdjustment"], false);
    }

    #[test]
    fn test_settings_patch_applies_fields() {
        let mut settings = Settings::default();
        let patch = SettingsPatch {
            metabolism_rate: Some(MetabolismRate::Slow),
            caffeine_limit: Some(300.0),
            smoker_adjustment: Some(true),
            ..SettingsPatch::default()
        };
        patch.apply(&mut settings).unwrap();
        assert_eq!(settings.metabolism_rate, MetabolismRate::Slow);
        assert!((settings.caffeine_limit - 300.0).abs() < f64::EPSILON);
        assert!(settings.smoker_adjustment);
        assert_eq!(settings.bedtime, DEFAULT_BEDTIME);
    }

    #[test]
    fn test_settings_patch_rejects_out_of_range_atomically() {
        let mut settings = Settings::default();
        let patch = SettingsPatch {
            metabolism_rate: Some(MetabolismRate::Fast),
            target_sleep_caffeine: Some(500.0),
            ..SettingsPatch::default()
        };
        assert!(patch.apply(&mut settings).is_err());
        assert_eq!(settings, Settings::default());

        let low_limit = SettingsPatch {
            caffeine_limit: Some(10.0),
            ..SettingsPatch::default()
        };
        assert!(low_limit.apply(&mut settings).is_err());
    }

    #[test]
    fn test_settings_patch_is_empty() {
        assert!(SettingsPatch::default().is_empty());
        let patch = SettingsPatch {
            pregnancy_adjustment: Some(false),
            ..SettingsPatch::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_intake_json_uses_camel_case() {
        let intake = Intake {
            id: "1".to_string(),
            client_id: "c-1".to_string(),
            cloud_id: None,
            name: "Espresso".to_string(),
            amount: 63.0,
            category: "espresso".to_string(),
            timestamp: "2024-06-15T08:00:00Z".parse().unwrap(),
            updated_at: 1_718_438_400_000,
        };
        let json = serde_json::to_value(&intake).unwrap();
        assert_eq!(json["clientId"], "c-1");
        assert!(json["cloudId"].is_null());
        assert_eq!(json["updatedAt"], 1_718_438_400_000_i64);
        assert_eq!(json["timestamp"], "2024-06-15T08:00:00Z");
    }

    #[test]
    fn test_same_content_ignores_store_ids() {
        let a = Intake {
            id: "local-1".to_string(),
            client_id: "c-1".to_string(),
            cloud_id: None,
            name: "Tea".to_string(),
            amount: 40.0,
            category: "tea".to_string(),
            timestamp: "2024-06-15T08:00:00Z".parse().unwrap(),
            updated_at: 10,
        };
        let mut b = a.clone();
        b.id = "remote-9".to_string();
        b.cloud_id = Some("cloud-9".to_string());
        assert!(a.same_content(&b));
        b.amount = 41.0;
        assert!(!a.same_content(&b));
    }
}
