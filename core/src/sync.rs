//! Per-session cloud sync. A session starts idle, authenticates by listing the
//! remote log, migrates the local log into the remote once, and from then on
//! runs steady two-way merges. A missing identity or an auth failure drops
//! back to local-only and forgets the migration.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cloud::{CloudError, CloudStore};
use crate::db::{Database, INTAKES_KEY, SETTINGS_KEY, SYNC_SESSION_KEY};
use crate::merge::{merge_intakes_by_client_id, merge_key};
use crate::models::{Intake, Settings};
use crate::normalize::{parse_intakes, parse_settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Authenticating,
    Migrating,
    Steady,
    LoggedOut,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::Migrating => "migrating",
            Self::Steady => "steady",
            Self::LoggedOut => "logged_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsSync {
    #[default]
    Unchanged,
    Pushed,
    Pulled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub phase: SyncPhase,
    /// The local log was folded into the remote on this pass.
    pub migrated: bool,
    pub intakes: usize,
    pub pushed: usize,
    /// Local removals sent to the remote.
    pub removed: usize,
    /// Local copies dropped because another device removed them.
    pub dropped: usize,
    pub settings: SettingsSync,
}

/// Sync bookkeeping, kept in the local store between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSession {
    pub phase: SyncPhase,
    pub migrated: bool,
    /// Fingerprint of the settings last agreed with the remote.
    pub settings_fingerprint: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// SHA-256 hex digest of the canonical JSON form of `settings`.
pub fn settings_fingerprint(settings: &Settings) -> Result<String> {
    let json = serde_json::to_vec(settings)?;
    Ok(Sha256::digest(&json).iter().map(|b| format!("{b:02x}")).collect())
}

impl SyncSession {
    pub fn load(db: &Database) -> Result<Self> {
        let Some(raw) = db.get(SYNC_SESSION_KEY)? else {
            return Ok(Self::default());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "discarding unreadable sync session");
            Self::default()
        }))
    }

    pub fn save(&self, db: &Database) -> Result<()> {
        db.set(SYNC_SESSION_KEY, &serde_json::to_string(self)?)
    }

    /// Forget the remote: local data stays, the next sign-in migrates again.
    pub fn log_out(&mut self) {
        self.phase = SyncPhase::LoggedOut;
        self.migrated = false;
        self.settings_fingerprint = None;
    }

    /// Run one sync pass against `store` and persist the session.
    pub fn tick(&mut self, db: &Database, store: &dyn CloudStore) -> Result<SyncReport> {
        if matches!(self.phase, SyncPhase::Idle | SyncPhase::LoggedOut) {
            self.phase = SyncPhase::Authenticating;
        }

        let mut remote = match store.list_all() {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                tracing::info!("no remote identity; staying local-only");
                self.log_out();
                self.save(db)?;
                return Ok(self.report());
            }
            Err(e) => return Err(self.remote_failure(db, e, "list remote intakes")),
        };

        let flushed = self.flush_tombstones(db, store)?;
        remote.retain(|r| !flushed.iter().any(|id| id == merge_key(r)));
        let removed = flushed.len();

        let removed_remotely: HashSet<String> = match store.list_removed() {
            Ok(ids) => ids.unwrap_or_default().into_iter().collect(),
            Err(e) => return Err(self.remote_failure(db, e, "list remote removals")),
        };
        let mut local = parse_intakes(db.get(INTAKES_KEY)?.as_deref());
        let before = local.len();
        local.retain(|i| !removed_remotely.contains(merge_key(i)));
        let dropped = before - local.len();

        let migrating = !self.migrated;
        let remote = if migrating {
            self.phase = SyncPhase::Migrating;
            match store.merge_from_local(&local) {
                Ok(Some(remote)) => remote,
                Ok(None) => {
                    self.log_out();
                    self.save(db)?;
                    return Ok(self.report());
                }
                Err(e) => return Err(self.remote_failure(db, e, "migrate local intakes")),
            }
        } else {
            remote
        };

        let outcome = merge_intakes_by_client_id(&local, &remote);
        let mut merged = outcome.merged;
        adopt_cloud_ids(&mut merged, &remote);
        db.set(INTAKES_KEY, &serde_json::to_string(&merged)?)
            .context("Failed to save merged intakes")?;

        for intake in &outcome.to_upsert {
            if let Err(e) = store.upsert_intake(intake) {
                return Err(self.remote_failure(db, e, "push intake"));
            }
        }

        let settings = match self.sync_settings(db, store) {
            Ok(settings) => settings,
            Err(e) => return Err(self.remote_failure(db, e, "sync settings")),
        };

        self.migrated = true;
        self.phase = SyncPhase::Steady;
        self.last_synced_at = Some(Utc::now());
        self.save(db)?;

        tracing::info!(
            intakes = merged.len(),
            pushed = outcome.to_upsert.len(),
            removed,
            dropped,
            migrating,
            "sync pass complete"
        );

        Ok(SyncReport {
            migrated: migrating,
            intakes: merged.len(),
            pushed: outcome.to_upsert.len(),
            removed,
            dropped,
            settings,
            ..self.report()
        })
    }

    fn report(&self) -> SyncReport {
        SyncReport {
            phase: self.phase,
            ..SyncReport::default()
        }
    }

    // Returns the client ids whose removal reached the remote.
    fn flush_tombstones(&mut self, db: &Database, store: &dyn CloudStore) -> Result<Vec<String>> {
        let mut flushed = Vec::new();
        for tombstone in db.get_tombstones()? {
            if let Err(e) = store.remove(&tombstone.client_id) {
                return Err(self.remote_failure(db, e, "propagate removal"));
            }
            db.clear_tombstone(&tombstone.client_id)?;
            flushed.push(tombstone.client_id);
        }
        Ok(flushed)
    }

    fn sync_settings(
        &mut self,
        db: &Database,
        store: &dyn CloudStore,
    ) -> Result<SettingsSync, CloudError> {
        let stored = |e: anyhow::Error| CloudError::Rejected(format!("local store: {e:#}"));

        let local = parse_settings(db.get(SETTINGS_KEY).map_err(stored)?.as_deref());
        let local_fp = settings_fingerprint(&local).map_err(stored)?;

        let locally_edited = self
            .settings_fingerprint
            .as_ref()
            .is_some_and(|fp| *fp != local_fp);
        if !locally_edited {
            if let Some(remote) = store.get_settings()? {
                let remote_fp = settings_fingerprint(&remote).map_err(stored)?;
                self.settings_fingerprint = Some(remote_fp);
                if remote == local {
                    return Ok(SettingsSync::Unchanged);
                }
                let json = serde_json::to_string(&remote).map_err(|e| stored(e.into()))?;
                db.set(SETTINGS_KEY, &json).map_err(stored)?;
                return Ok(SettingsSync::Pulled);
            }
        }

        store.save_settings(&local)?;
        self.settings_fingerprint = Some(local_fp);
        Ok(SettingsSync::Pushed)
    }

    // Log a failed remote call; auth failures also end the session.
    fn remote_failure(&mut self, db: &Database, e: CloudError, action: &str) -> anyhow::Error {
        tracing::warn!(error = %e, phase = self.phase.as_str(), "failed to {action}");
        if e.is_auth() {
            self.log_out();
            if let Err(save_err) = self.save(db) {
                tracing::warn!(error = %save_err, "failed to save sync session");
            }
        }
        anyhow::Error::new(e).context(format!("Failed to {action}"))
    }
}

// Local copies learn the remote id of their counterpart.
fn adopt_cloud_ids(merged: &mut [Intake], remote: &[Intake]) {
    for intake in merged.iter_mut().filter(|i| i.cloud_id.is_none()) {
        if let Some(cloud_id) = remote
            .iter()
            .find(|r| merge_key(r) == merge_key(intake))
            .and_then(|r| r.cloud_id.clone())
        {
            intake.cloud_id = Some(cloud_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cloud::LedgerCloud;
    use crate::models::MetabolismRate;

    fn intake(client_id: &str, at: &str, updated_at: i64) -> Intake {
        let timestamp: DateTime<Utc> = at.parse().unwrap();
        Intake {
            id: format!("device-{client_id}"),
            client_id: client_id.to_string(),
            cloud_id: None,
            name: "Cold brew".to_string(),
            amount: 150.0,
            category: "coffee".to_string(),
            timestamp,
            updated_at,
        }
    }

    fn ledger(user: Option<&str>) -> LedgerCloud {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        LedgerCloud::new(db, user.map(str::to_string))
    }

    fn save_local(db: &Database, intakes: &[Intake]) {
        db.set(INTAKES_KEY, &serde_json::to_string(intakes).unwrap())
            .unwrap();
    }

    fn local(db: &Database) -> Vec<Intake> {
        parse_intakes(db.get(INTAKES_KEY).unwrap().as_deref())
    }

    /// Counts migrations and optionally fails them or rejects every call.
    struct Flaky {
        inner: LedgerCloud,
        merges: AtomicUsize,
        fail_merges: AtomicUsize,
        deny: bool,
    }

    impl Flaky {
        fn new(inner: LedgerCloud) -> Self {
            Self {
                inner,
                merges: AtomicUsize::new(0),
                fail_merges: AtomicUsize::new(0),
                deny: false,
            }
        }

        fn check(&self) -> Result<(), CloudError> {
            if self.deny {
                Err(CloudError::NotAuthorized)
            } else {
                Ok(())
            }
        }
    }

    impl CloudStore for Flaky {
        fn list_all(&self) -> Result<Option<Vec<Intake>>, CloudError> {
            self.check()?;
            self.inner.list_all()
        }
        fn add(&self, intake: &Intake) -> Result<Option<String>, CloudError> {
            self.inner.add(intake)
        }
        fn remove(&self, client_id: &str) -> Result<bool, CloudError> {
            self.inner.remove(client_id)
        }
        fn upsert_intake(&self, intake: &Intake) -> Result<(), CloudError> {
            self.inner.upsert_intake(intake)
        }
        fn list_removed(&self) -> Result<Option<Vec<String>>, CloudError> {
            self.inner.list_removed()
        }
        fn merge_from_local(&self, local: &[Intake]) -> Result<Option<Vec<Intake>>, CloudError> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            let result = self.inner.merge_from_local(local);
            if self.fail_merges.load(Ordering::SeqCst) > 0 {
                self.fail_merges.fetch_sub(1, Ordering::SeqCst);
                // Remote applied the write but the reply was lost.
                return Err(CloudError::Transport("connection reset".to_string()));
            }
            result
        }
        fn get_settings(&self) -> Result<Option<Settings>, CloudError> {
            self.inner.get_settings()
        }
        fn save_settings(&self, settings: &Settings) -> Result<(), CloudError> {
            self.inner.save_settings(settings)
        }
    }

    #[test]
    fn test_session_defaults_when_missing_or_corrupt() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(SyncSession::load(&db).unwrap(), SyncSession::default());
        db.set(SYNC_SESSION_KEY, "not json").unwrap();
        assert_eq!(SyncSession::load(&db).unwrap(), SyncSession::default());
    }

    #[test]
    fn test_no_identity_stays_local() {
        let db = Database::open_in_memory().unwrap();
        save_local(&db, &[intake("a", "2024-06-15T08:00:00Z", 1)]);
        let mut session = SyncSession::default();

        let report = session.tick(&db, &ledger(None)).unwrap();
        assert_eq!(report.phase, SyncPhase::LoggedOut);
        assert!(!session.migrated);
        assert_eq!(local(&db).len(), 1);
    }

    #[test]
    fn test_migration_runs_once() {
        let db = Database::open_in_memory().unwrap();
        save_local(&db, &[intake("a", "2024-06-15T08:00:00Z", 1)]);
        let store = Flaky::new(ledger(Some("alice")));
        let mut session = SyncSession::default();

        let first = session.tick(&db, &store).unwrap();
        assert!(first.migrated);
        assert_eq!(first.phase, SyncPhase::Steady);
        let second = session.tick(&db, &store).unwrap();
        assert!(!second.migrated);
        assert_eq!(store.merges.load(Ordering::SeqCst), 1);

        let remote = store.list_all().unwrap().unwrap();
        assert_eq!(remote.len(), 1);
        // The local copy learned its remote id.
        assert_eq!(local(&db)[0].cloud_id, remote[0].cloud_id);
    }

    #[test]
    fn test_session_persists_between_runs() {
        let db = Database::open_in_memory().unwrap();
        let store = Flaky::new(ledger(Some("alice")));
        SyncSession::load(&db).unwrap().tick(&db, &store).unwrap();

        let mut reloaded = SyncSession::load(&db).unwrap();
        assert!(reloaded.migrated);
        assert!(reloaded.last_synced_at.is_some());
        reloaded.tick(&db, &store).unwrap();
        assert_eq!(store.merges.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_logout_resets_migration() {
        let db = Database::open_in_memory().unwrap();
        let cloud_db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let signed_in = LedgerCloud::new(cloud_db.clone(), Some("alice".to_string()));
        let signed_out = LedgerCloud::new(cloud_db, None);
        let mut session = SyncSession::default();

        session.tick(&db, &signed_in).unwrap();
        assert!(session.migrated);
        session.tick(&db, &signed_out).unwrap();
        assert!(!session.migrated);
        assert_eq!(session.phase, SyncPhase::LoggedOut);
        assert!(session.settings_fingerprint.is_none());

        let report = session.tick(&db, &signed_in).unwrap();
        assert!(report.migrated);
    }

    #[test]
    fn test_auth_failure_surfaces_and_logs_out() {
        let db = Database::open_in_memory().unwrap();
        let mut store = Flaky::new(ledger(Some("alice")));
        let mut session = SyncSession::default();
        session.tick(&db, &store).unwrap();

        store.deny = true;
        let err = session.tick(&db, &store).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloudError>(),
            Some(CloudError::NotAuthorized)
        ));
        assert_eq!(session.phase, SyncPhase::LoggedOut);
        assert!(!SyncSession::load(&db).unwrap().migrated);
    }

    #[test]
    fn test_interrupted_migration_creates_no_duplicates() {
        let db = Database::open_in_memory().unwrap();
        save_local(
            &db,
            &[
                intake("a", "2024-06-15T08:00:00Z", 1),
                intake("b", "2024-06-15T09:00:00Z", 1),
            ],
        );
        let store = Flaky::new(ledger(Some("alice")));
        store.fail_merges.store(1, Ordering::SeqCst);
        let mut session = SyncSession::default();

        assert!(session.tick(&db, &store).is_err());
        assert!(!session.migrated);
        assert_eq!(local(&db).len(), 2);

        let report = session.tick(&db, &store).unwrap();
        assert!(report.migrated);
        assert_eq!(store.list_all().unwrap().unwrap().len(), 2);
        assert_eq!(local(&db).len(), 2);
    }

    #[test]
    fn test_steady_state_pushes_and_pulls() {
        let db = Database::open_in_memory().unwrap();
        save_local(&db, &[intake("a", "2024-06-15T08:00:00Z", 1)]);
        let store = ledger(Some("alice"));
        let mut session = SyncSession::default();
        session.tick(&db, &store).unwrap();

        // Another device adds a record; this one edits its own.
        store.add(&intake("remote", "2024-06-15T10:00:00Z", 5)).unwrap();
        let mut edited = local(&db);
        edited[0].amount = 200.0;
        edited[0].updated_at = 10;
        save_local(&db, &edited);

        let report = session.tick(&db, &store).unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.intakes, 2);

        let remote = store.list_all().unwrap().unwrap();
        let a = remote.iter().find(|i| i.client_id == "a").unwrap();
        assert!((a.amount - 200.0).abs() < f64::EPSILON);
        assert_eq!(local(&db)[0].client_id, "remote");
    }

    #[test]
    fn test_tombstones_propagate() {
        let db = Database::open_in_memory().unwrap();
        save_local(&db, &[intake("a", "2024-06-15T08:00:00Z", 1)]);
        let store = ledger(Some("alice"));
        let mut session = SyncSession::default();
        session.tick(&db, &store).unwrap();

        save_local(&db, &[]);
        db.record_tombstone("a", 2).unwrap();

        let report = session.tick(&db, &store).unwrap();
        assert_eq!(report.removed, 1);
        assert!(store.list_all().unwrap().unwrap().is_empty());
        assert!(local(&db).is_empty());
        assert!(db.get_tombstones().unwrap().is_empty());
    }

    #[test]
    fn test_removal_reaches_other_devices() {
        let cloud_db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = LedgerCloud::new(cloud_db, Some("alice".to_string()));
        let phone = Database::open_in_memory().unwrap();
        let laptop = Database::open_in_memory().unwrap();
        let mut phone_session = SyncSession::default();
        let mut laptop_session = SyncSession::default();

        save_local(&phone, &[intake("a", "2024-06-15T08:00:00Z", 1)]);
        phone_session.tick(&phone, &store).unwrap();
        laptop_session.tick(&laptop, &store).unwrap();
        assert_eq!(local(&laptop).len(), 1);

        save_local(&phone, &[]);
        phone.record_tombstone("a", 2).unwrap();
        phone_session.tick(&phone, &store).unwrap();

        let report = laptop_session.tick(&laptop, &store).unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.pushed, 0);
        assert!(local(&laptop).is_empty());
        assert!(store.list_all().unwrap().unwrap().is_empty());

        phone_session.tick(&phone, &store).unwrap();
        assert!(local(&phone).is_empty());
    }

    #[test]
    fn test_removal_applies_before_migration() {
        let store = ledger(Some("alice"));
        store.add(&intake("a", "2024-06-15T08:00:00Z", 1)).unwrap();
        store.remove("a").unwrap();

        // A device joining later still carries its own copy.
        let db = Database::open_in_memory().unwrap();
        save_local(
            &db,
            &[
                intake("a", "2024-06-15T08:00:00Z", 1),
                intake("b", "2024-06-15T09:00:00Z", 1),
            ],
        );
        let report = SyncSession::default().tick(&db, &store).unwrap();

        assert!(report.migrated);
        assert_eq!(report.dropped, 1);
        let kept: Vec<String> = local(&db).into_iter().map(|i| i.client_id).collect();
        assert_eq!(kept, vec!["b".to_string()]);
        assert_eq!(store.list_all().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_first_sync_adopts_remote_settings() {
        let db = Database::open_in_memory().unwrap();
        let store = ledger(Some("alice"));
        let remote = Settings {
            caffeine_limit: 250.0,
            ..Settings::default()
        };
        store.save_settings(&remote).unwrap();

        let report = SyncSession::default().tick(&db, &store).unwrap();
        assert_eq!(report.settings, SettingsSync::Pulled);
        assert_eq!(parse_settings(db.get(SETTINGS_KEY).unwrap().as_deref()), remote);
    }

    #[test]
    fn test_first_sync_pushes_settings_when_remote_empty() {
        let db = Database::open_in_memory().unwrap();
        let store = ledger(Some("alice"));
        let report = SyncSession::default().tick(&db, &store).unwrap();
        assert_eq!(report.settings, SettingsSync::Pushed);
        assert_eq!(store.get_settings().unwrap(), Some(Settings::default()));
    }

    #[test]
    fn test_local_settings_edit_wins() {
        let db = Database::open_in_memory().unwrap();
        let store = ledger(Some("alice"));
        let mut session = SyncSession::default();
        session.tick(&db, &store).unwrap();

        // Both sides change; the local edit must not be overwritten.
        store
            .save_settings(&Settings {
                caffeine_limit: 600.0,
                ..Settings::default()
            })
            .unwrap();
        let mine = Settings {
            metabolism_rate: MetabolismRate::Fast,
            ..Settings::default()
        };
        db.set(SETTINGS_KEY, &serde_json::to_string(&mine).unwrap())
            .unwrap();

        let report = session.tick(&db, &store).unwrap();
        assert_eq!(report.settings, SettingsSync::Pushed);
        assert_eq!(store.get_settings().unwrap(), Some(mine.clone()));
        assert_eq!(parse_settings(db.get(SETTINGS_KEY).unwrap().as_deref()), mine);
    }

    #[test]
    fn test_remote_settings_change_is_pulled() {
        let db = Database::open_in_memory().unwrap();
        let store = ledger(Some("alice"));
        let mut session = SyncSession::default();
        session.tick(&db, &store).unwrap();

        let theirs = Settings {
            smoker_adjustment: true,
            ..Settings::default()
        };
        store.save_settings(&theirs).unwrap();

        let report = session.tick(&db, &store).unwrap();
        assert_eq!(report.settings, SettingsSync::Pulled);
        assert_eq!(parse_settings(db.get(SETTINGS_KEY).unwrap().as_deref()), theirs);

        let report = session.tick(&db, &store).unwrap();
        assert_eq!(report.settings, SettingsSync::Unchanged);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = settings_fingerprint(&Settings::default()).unwrap();
        let b = settings_fingerprint(&Settings::default()).unwrap();
        let c = settings_fingerprint(&Settings {
            pregnancy_adjustment: true,
            ..Settings::default()
        })
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
