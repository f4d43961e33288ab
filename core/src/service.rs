use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use uuid::Uuid;

use crate::cloud::CloudStore;
use crate::db::{Database, INTAKES_KEY, SETTINGS_KEY};
use crate::decay::{consumed_between, half_life_hours, half_life_ms, level_at, sleep_readiness};
use crate::models::{
    CaffeineStatus, DEFAULT_INTAKE_NAME, DailyTotal, Intake, NewIntake, Settings, SettingsPatch,
    TimelinePoint, validate_amount, validate_category,
};
use crate::normalize::{parse_intakes, parse_settings};
use crate::sync::{SyncReport, SyncSession};
use crate::timeline::generate_timeline;

/// Shortest id prefix accepted when picking an intake.
const MIN_ID_PREFIX: usize = 4;

pub struct BuzzService {
    db: Database,
}

impl BuzzService {
    pub fn new(db_path: &Path) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self { db })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db })
    }

    // --- Intakes ---

    /// Every stored intake, newest first.
    pub fn intakes(&self) -> Result<Vec<Intake>> {
        let mut intakes = parse_intakes(self.db.get(INTAKES_KEY)?.as_deref());
        intakes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(intakes)
    }

    pub fn list_intakes(&self, limit: Option<usize>) -> Result<Vec<Intake>> {
        let mut intakes = self.intakes()?;
        if let Some(limit) = limit {
            intakes.truncate(limit);
        }
        Ok(intakes)
    }

    fn save_intakes(&self, intakes: &[Intake]) -> Result<()> {
        let json = serde_json::to_string(intakes)?;
        self.db
            .set(INTAKES_KEY, &json)
            .context("Failed to save intakes")
    }

    pub fn log_intake(&self, new: &NewIntake) -> Result<Intake> {
        let amount = validate_amount(new.amount)?;
        let category = validate_category(&new.category)?;
        let name = match new.name.trim() {
            "" => DEFAULT_INTAKE_NAME.to_string(),
            name => name.to_string(),
        };
        let now = Utc::now();

        let intake = Intake {
            id: Uuid::new_v4().to_string(),
            client_id: Uuid::new_v4().to_string(),
            cloud_id: None,
            name,
            amount,
            category,
            timestamp: new.at.unwrap_or(now),
            updated_at: now.timestamp_millis(),
        };

        let mut intakes = self.intakes()?;
        intakes.push(intake.clone());
        intakes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.save_intakes(&intakes)?;
        tracing::debug!(client_id = %intake.client_id, amount, "logged intake");
        Ok(intake)
    }

    /// Find one intake by `id`, `client_id`, or an unambiguous prefix of either.
    pub fn find_intake(&self, key: &str) -> Result<Option<Intake>> {
        let key = key.trim();
        let intakes = self.intakes()?;
        if let Some(exact) = intakes.iter().find(|i| i.id == key || i.client_id == key) {
            return Ok(Some(exact.clone()));
        }
        if key.len() < MIN_ID_PREFIX {
            return Ok(None);
        }
        let mut matches = intakes
            .into_iter()
            .filter(|i| i.id.starts_with(key) || i.client_id.starts_with(key));
        let first = matches.next();
        if matches.next().is_some() {
            bail!("Id prefix '{key}' matches more than one intake");
        }
        Ok(first)
    }

    /// Remove an intake and remember the removal for the next sync.
    pub fn remove_intake(&self, key: &str) -> Result<Option<Intake>> {
        let Some(target) = self.find_intake(key)? else {
            return Ok(None);
        };
        let mut intakes = self.intakes()?;
        intakes.retain(|i| i.client_id != target.client_id);
        self.save_intakes(&intakes)?;
        self.db
            .record_tombstone(&target.client_id, Utc::now().timestamp_millis())?;
        Ok(Some(target))
    }

    // --- Derived values ---

    /// Caffeine snapshot at `now`; "today" is the calendar day in `now`'s zone.
    pub fn status<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<CaffeineStatus> {
        let intakes = self.intakes()?;
        let settings = self.settings()?;
        let now_utc = now.with_timezone(&Utc);
        let (day_start, day_end) = local_day_bounds(now);
        let consumed_today = consumed_between(&intakes, day_start, day_end);

        Ok(CaffeineStatus {
            now: now_utc,
            current_level: level_at(&intakes, now_utc, half_life_ms(&settings)),
            half_life_hours: half_life_hours(&settings),
            consumed_today,
            daily_limit: settings.caffeine_limit,
            remaining_allowance: (settings.caffeine_limit - consumed_today).max(0.0),
            sleep: sleep_readiness(&intakes, &settings, now),
        })
    }

    pub fn timeline(&self, now: DateTime<Utc>) -> Result<Vec<TimelinePoint>> {
        let intakes = self.intakes()?;
        let settings = self.settings()?;
        Ok(generate_timeline(&intakes, half_life_ms(&settings), now))
    }

    /// Per-day totals for the `days` calendar days ending today, newest first.
    /// Days without intakes are included with a zero total.
    pub fn daily_totals<Tz: TimeZone>(
        &self,
        days: u32,
        now: &DateTime<Tz>,
    ) -> Result<Vec<DailyTotal>> {
        let intakes = self.intakes()?;
        let limit = self.settings()?.caffeine_limit;
        let tz = now.timezone();
        let today = now.date_naive();

        let totals = (0..u64::from(days))
            .filter_map(|back| today.checked_sub_days(Days::new(back)))
            .map(|date| {
                let on_day: Vec<&Intake> = intakes
                    .iter()
                    .filter(|i| i.timestamp.with_timezone(&tz).date_naive() == date)
                    .collect();
                let total_mg: f64 = on_day.iter().map(|i| i.amount).sum();
                DailyTotal {
                    date,
                    total_mg,
                    count: on_day.len(),
                    over_limit: total_mg > limit,
                }
            })
            .collect();
        Ok(totals)
    }

    // --- Settings ---

    pub fn settings(&self) -> Result<Settings> {
        Ok(parse_settings(self.db.get(SETTINGS_KEY)?.as_deref()))
    }

    pub fn replace_settings(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.db
            .set(SETTINGS_KEY, &json)
            .context("Failed to save settings")
    }

    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings> {
        let mut settings = self.settings()?;
        patch.apply(&mut settings)?;
        self.replace_settings(&settings)?;
        Ok(settings)
    }

    /// Drop the stored settings so reads fall back to the defaults.
    pub fn reset_settings(&self) -> Result<Settings> {
        self.db
            .delete(SETTINGS_KEY)
            .context("Failed to reset settings")?;
        self.settings()
    }

    // --- Sync ---

    pub fn sync_session(&self) -> Result<SyncSession> {
        SyncSession::load(&self.db)
    }

    pub fn pending_removals(&self) -> Result<usize> {
        Ok(self.db.get_tombstones()?.len())
    }

    /// One sync pass against `store`.
    pub fn sync(&self, store: &dyn CloudStore) -> Result<SyncReport> {
        let mut session = SyncSession::load(&self.db)?;
        session.tick(&self.db, store)
    }

    /// Drop the remote session; local data is kept.
    pub fn sign_out(&self) -> Result<()> {
        let mut session = SyncSession::load(&self.db)?;
        session.log_out();
        session.save(&self.db)
    }
}

// UTC bounds of the calendar day containing `now` in its own zone.
fn local_day_bounds<Tz: TimeZone>(now: &DateTime<Tz>) -> (DateTime<Utc>, DateTime<Utc>) {
    let tz = now.timezone();
    let today = now.date_naive();
    let start_of = |date: NaiveDate| {
        let midnight = date.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&midnight)
            .earliest()
            .map_or_else(|| midnight.and_utc(), |dt| dt.with_timezone(&Utc))
    };
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    (start_of(today), start_of(tomorrow))
}
