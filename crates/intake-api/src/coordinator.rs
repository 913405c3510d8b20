use std::sync::Arc;

use intake_core::{CoreError, Record, RecordId, RecordPatch, RecordStatus, StoreError};
use intake_fallback::{FallbackLog, LocalUpdate, LogError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::availability::PrimaryHandle;

/// Where a write landed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    Primary,
    Fallback,
}

impl StorageLocation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SaveOutcome {
    pub id: RecordId,
    pub location: StorageLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated { location: StorageLocation },
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("record {0} already exists")]
    Duplicate(RecordId),
    #[error("record could not be stored: primary ({primary}), fallback ({fallback})")]
    BothStoresUnavailable { primary: String, fallback: String },
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("record {0} cannot be updated while the primary store is unavailable")]
    PrimaryUnavailable(RecordId),
    #[error("update of {id} failed: {source}")]
    Fallback {
        id: RecordId,
        #[source]
        source: LogError,
    },
}

/// Routes each write to the primary store, or to the local log when the primary is down.
pub struct DualWriteCoordinator {
    primary: Arc<PrimaryHandle>,
    log: Arc<FallbackLog>,
}

impl DualWriteCoordinator {
    #[must_use]
    pub fn new(primary: Arc<PrimaryHandle>, log: Arc<FallbackLog>) -> Self {
        Self { primary, log }
    }

    /// Persists a new record in exactly one store.
    ///
    /// Ids must be unique across both stores, so an id still held by the local log is refused
    /// even when the primary store would accept it.
    ///
    /// # Errors
    /// Returns [`SaveError::Invalid`] or [`SaveError::Duplicate`] for records either store
    /// refuses, and [`SaveError::BothStoresUnavailable`] when neither store could take it.
    pub fn save(&self, record: &Record) -> Result<SaveOutcome, SaveError> {
        record.validate()?;

        let mut primary_error = "marked unavailable".to_string();
        if self.primary.is_available() {
            match self.log.get(&record.id) {
                Ok(Some(_)) => return Err(SaveError::Duplicate(record.id.clone())),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("could not check fallback log for id {}: {err}", record.id);
                }
            }
            match self.primary.store().insert(record) {
                Ok(()) => {
                    self.primary.mark_available();
                    tracing::info!("saved {} {} to primary store", record.kind.as_str(), record.id);
                    return Ok(SaveOutcome { id: record.id.clone(), location: StorageLocation::Primary });
                }
                Err(StoreError::Duplicate(id)) => return Err(SaveError::Duplicate(id)),
                Err(StoreError::Invalid(err)) => return Err(SaveError::Invalid(err)),
                Err(err) => {
                    tracing::warn!("primary insert of {} failed, using fallback: {err}", record.id);
                    self.primary.mark_unavailable(&err);
                    primary_error = err.to_string();
                }
            }
        }

        match self.log.append(record) {
            Ok(_) => {
                tracing::warn!(
                    "saved {} {} to fallback log; it will be synced later",
                    record.kind.as_str(),
                    record.id
                );
                Ok(SaveOutcome { id: record.id.clone(), location: StorageLocation::Fallback })
            }
            Err(LogError::Duplicate(id)) => Err(SaveError::Duplicate(id)),
            Err(LogError::Invalid(err)) => Err(SaveError::Invalid(err)),
            Err(err) => {
                tracing::error!("record {} could not be stored anywhere: {err}", record.id);
                Err(SaveError::BothStoresUnavailable {
                    primary: primary_error,
                    fallback: err.to_string(),
                })
            }
        }
    }

    /// # Errors
    /// See [`DualWriteCoordinator::update`].
    pub fn update_status(
        &self,
        id: &RecordId,
        status: RecordStatus,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.update(id, &RecordPatch::status(status))
    }

    /// Applies a patch where the record lives. The primary store wins when it holds the id; the
    /// local log is only touched for pending records the primary store does not have yet.
    ///
    /// # Errors
    /// Returns [`UpdateError::Invalid`] for patches the record rejects,
    /// [`UpdateError::PrimaryUnavailable`] when the primary store cannot be asked and the log
    /// holds no pending copy, and [`UpdateError::Fallback`] when the local log fails.
    pub fn update(&self, id: &RecordId, patch: &RecordPatch) -> Result<UpdateOutcome, UpdateError> {
        patch.validate()?;

        let mut primary_reachable = false;
        if self.primary.is_available() {
            match self.primary.store().update_one(id, patch, OffsetDateTime::now_utc()) {
                Ok(matched) if matched > 0 => {
                    return Ok(UpdateOutcome::Updated { location: StorageLocation::Primary });
                }
                Ok(_) => primary_reachable = true,
                Err(StoreError::Invalid(err)) => return Err(UpdateError::Invalid(err)),
                Err(err) => {
                    tracing::warn!("primary update of {id} failed, trying fallback: {err}");
                    self.primary.mark_unavailable(&err);
                }
            }
        }

        match self.log.update(id, patch) {
            Ok(LocalUpdate::Applied) => {
                tracing::info!("updated {id} in fallback log");
                Ok(UpdateOutcome::Updated { location: StorageLocation::Fallback })
            }
            Ok(LocalUpdate::Synced) if primary_reachable => {
                tracing::warn!("{id} is marked synced locally but the primary store lacks it");
                Ok(UpdateOutcome::NotFound)
            }
            Ok(LocalUpdate::NotFound) if primary_reachable => Ok(UpdateOutcome::NotFound),
            Ok(LocalUpdate::Synced | LocalUpdate::NotFound) => {
                Err(UpdateError::PrimaryUnavailable(id.clone()))
            }
            Err(LogError::Invalid(err)) => Err(UpdateError::Invalid(err)),
            Err(source) => Err(UpdateError::Fallback { id: id.clone(), source }),
        }
    }
}
