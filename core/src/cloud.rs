use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, INTAKES_KEY, REMOVED_KEY, SETTINGS_KEY};
use crate::merge::{merge_intakes_by_client_id, merge_key};
use crate::models::{Intake, Settings};
use crate::normalize::{parse_intakes, parse_settings};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("not signed in to the remote store")]
    NotAuthenticated,
    #[error("access to the remote store was refused")]
    NotAuthorized,
    #[error("remote store unreachable: {0}")]
    Transport(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

impl CloudError {
    /// Errors that mean the session has no usable identity.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::NotAuthorized)
    }
}

/// Remote copy of one user's intake log and settings.
///
/// The CLI talks to `buzz serve` over HTTP, the server answers from a
/// [`LedgerCloud`]. Called synchronously; async implementations should bridge
/// with a runtime handle and be driven from a blocking thread.
///
/// Without an identity every operation is a no-op returning `None`/empty.
pub trait CloudStore: Send + Sync {
    /// `Ok(None)` means there is no signed-in user.
    fn list_all(&self) -> Result<Option<Vec<Intake>>, CloudError>;
    /// Store a new record, returning its remote id. A removed client id is
    /// never stored again.
    fn add(&self, intake: &Intake) -> Result<Option<String>, CloudError>;
    /// Drop a record and remember its client id as removed.
    fn remove(&self, client_id: &str) -> Result<bool, CloudError>;
    fn upsert_intake(&self, intake: &Intake) -> Result<(), CloudError>;
    /// Client ids removed from the remote copy by any device.
    fn list_removed(&self) -> Result<Option<Vec<String>>, CloudError>;
    /// Fold a full local log into the remote copy and return the result.
    fn merge_from_local(&self, local: &[Intake]) -> Result<Option<Vec<Intake>>, CloudError>;
    fn get_settings(&self) -> Result<Option<Settings>, CloudError>;
    fn save_settings(&self, settings: &Settings) -> Result<(), CloudError>;
}

/// [`CloudStore`] kept in a [`Database`], one key namespace per user.
pub struct LedgerCloud {
    db: Arc<Mutex<Database>>,
    user: Option<String>,
}

impl LedgerCloud {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>, user: Option<String>) -> Self {
        Self {
            db,
            user: user.filter(|u| !u.trim().is_empty()),
        }
    }

    fn namespace(&self) -> Option<String> {
        self.user.as_ref().map(|u| format!("user:{u}"))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> anyhow::Result<T>) -> Result<T, CloudError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&db).map_err(|e| CloudError::Rejected(format!("{e:#}")))
    }

    fn load(db: &Database, ns: &str) -> anyhow::Result<Vec<Intake>> {
        Ok(parse_intakes(db.get_in(ns, INTAKES_KEY)?.as_deref()))
    }

    fn load_removed(db: &Database, ns: &str) -> anyhow::Result<Vec<String>> {
        let raw = db.get_in(ns, REMOVED_KEY)?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    fn store(db: &Database, ns: &str, intakes: &mut Vec<Intake>) -> anyhow::Result<()> {
        intakes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        db.set_in(ns, INTAKES_KEY, &serde_json::to_string(intakes)?)
    }
}

// New remote copies get a remote id of their own; the client id is kept.
fn assign_cloud_id(intake: &mut Intake) {
    if intake.cloud_id.is_none() {
        let cloud_id = Uuid::new_v4().to_string();
        intake.id.clone_from(&cloud_id);
        intake.cloud_id = Some(cloud_id);
    }
}

impl CloudStore for LedgerCloud {
    fn list_all(&self) -> Result<Option<Vec<Intake>>, CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(None);
        };
        self.with_db(|db| {
            let mut intakes = Self::load(db, &ns)?;
            intakes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Ok(Some(intakes))
        })
    }

    fn add(&self, intake: &Intake) -> Result<Option<String>, CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(None);
        };
        self.with_db(|db| {
            if Self::load_removed(db, &ns)?.iter().any(|id| id == merge_key(intake)) {
                tracing::debug!(client_id = %intake.client_id, "ignoring add of removed intake");
                return Ok(None);
            }
            let mut intakes = Self::load(db, &ns)?;
            if let Some(existing) = intakes.iter().find(|i| merge_key(i) == merge_key(intake)) {
                return Ok(existing.cloud_id.clone());
            }
            let mut record = intake.clone();
            record.cloud_id = None;
            assign_cloud_id(&mut record);
            let cloud_id = record.cloud_id.clone();
            intakes.push(record);
            Self::store(db, &ns, &mut intakes)?;
            Ok(cloud_id)
        })
    }

    fn remove(&self, client_id: &str) -> Result<bool, CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(false);
        };
        self.with_db(|db| {
            let mut removed = Self::load_removed(db, &ns)?;
            if !removed.iter().any(|id| id == client_id) {
                removed.push(client_id.to_string());
                db.set_in(&ns, REMOVED_KEY, &serde_json::to_string(&removed)?)?;
            }

            let mut intakes = Self::load(db, &ns)?;
            let before = intakes.len();
            intakes.retain(|i| merge_key(i) != client_id);
            if intakes.len() == before {
                return Ok(false);
            }
            Self::store(db, &ns, &mut intakes)?;
            Ok(true)
        })
    }

    fn upsert_intake(&self, intake: &Intake) -> Result<(), CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(());
        };
        self.with_db(|db| {
            if Self::load_removed(db, &ns)?.iter().any(|id| id == merge_key(intake)) {
                tracing::debug!(client_id = %intake.client_id, "ignoring upsert of removed intake");
                return Ok(());
            }
            let mut intakes = Self::load(db, &ns)?;
            match intakes.iter_mut().find(|i| merge_key(i) == merge_key(intake)) {
                Some(existing) if intake.updated_at >= existing.updated_at => {
                    let (id, cloud_id) = (existing.id.clone(), existing.cloud_id.clone());
                    *existing = intake.clone();
                    existing.id = id;
                    existing.cloud_id = cloud_id;
                }
                Some(_) => {
                    tracing::debug!(client_id = %intake.client_id, "ignoring stale upsert");
                    return Ok(());
                }
                None => {
                    let mut record = intake.clone();
                    record.cloud_id = None;
                    assign_cloud_id(&mut record);
                    intakes.push(record);
                }
            }
            Self::store(db, &ns, &mut intakes)
        })
    }

    fn merge_from_local(&self, local: &[Intake]) -> Result<Option<Vec<Intake>>, CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(None);
        };
        self.with_db(|db| {
            let stored = Self::load(db, &ns)?;
            let removed = Self::load_removed(db, &ns)?;
            let incoming: Vec<Intake> = local
                .iter()
                .filter(|i| !removed.iter().any(|id| id == merge_key(i)))
                .cloned()
                .collect();
            // The stored copy plays the local side: it keeps ties.
            let mut merged = merge_intakes_by_client_id(&stored, &incoming).merged;
            for intake in &mut merged {
                assign_cloud_id(intake);
            }
            Self::store(db, &ns, &mut merged)?;
            Ok(Some(merged))
        })
    }

    fn list_removed(&self) -> Result<Option<Vec<String>>, CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(None);
        };
        self.with_db(|db| Ok(Some(Self::load_removed(db, &ns)?)))
    }

    fn get_settings(&self) -> Result<Option<Settings>, CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(None);
        };
        self.with_db(|db| {
            let raw = db.get_in(&ns, SETTINGS_KEY)?;
            Ok(raw.map(|s| parse_settings(Some(&s))))
        })
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), CloudError> {
        let Some(ns) = self.namespace() else {
            return Ok(());
        };
        self.with_db(|db| db.set_in(&ns, SETTINGS_KEY, &serde_json::to_string(settings)?))
    }
}
