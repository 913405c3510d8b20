use std::sync::Arc;

use intake_core::{Record, RecordId, StoreError};
use intake_fallback::{FallbackLog, LogError, MarkSynced};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::availability::PrimaryHandle;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub synced_count: usize,
    pub failed_count: usize,
    pub pending_remaining: usize,
}

#[derive(Debug, thiserror::Error)]
enum SyncFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("primary store holds a different record under id {0}")]
    Conflict(RecordId),
}

/// Copies pending local records into the primary store.
///
/// Runs are serialized through `run_lock`. Each record is checked for presence first, so a
/// record that reached the primary store in an earlier, interrupted run is only marked synced.
/// A different record under the same id is a conflict: the local one stays pending and is
/// counted as failed until an operator resolves it.
pub struct Reconciler {
    primary: Arc<PrimaryHandle>,
    log: Arc<FallbackLog>,
    run_lock: Mutex<()>,
}

impl Reconciler {
    #[must_use]
    pub fn new(primary: Arc<PrimaryHandle>, log: Arc<FallbackLog>) -> Self {
        Self { primary, log, run_lock: Mutex::new(()) }
    }

    /// # Errors
    /// Returns [`LogError`] only when the local log cannot be read. Per-record failures are
    /// counted in the summary and left pending for the next run.
    pub fn sync(&self) -> Result<ReconcileSummary, LogError> {
        let _run = self.run_lock.lock();

        let pending = self.log.pending()?;
        if pending.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        if !self.primary.refresh() {
            tracing::warn!(
                "primary store unavailable, {} records stay pending in the fallback log",
                pending.len()
            );
            return Ok(ReconcileSummary {
                synced_count: 0,
                failed_count: pending.len(),
                pending_remaining: pending.len(),
            });
        }

        let mut summary = ReconcileSummary::default();
        for record in &pending {
            match self.sync_one(record) {
                Ok(()) => summary.synced_count += 1,
                Err(err) => {
                    tracing::warn!("failed to sync {} {}: {err}", record.kind.as_str(), record.id);
                    summary.failed_count += 1;
                }
            }
        }
        summary.pending_remaining = self.log.pending()?.len();

        tracing::info!(
            "reconciliation finished: synced={} failed={} pending_remaining={}",
            summary.synced_count,
            summary.failed_count,
            summary.pending_remaining
        );
        Ok(summary)
    }

    fn sync_one(&self, record: &Record) -> Result<(), SyncFailure> {
        let store = self.primary.store();
        match store.find_one(&record.id)? {
            Some(existing) => {
                if existing.created_at != record.created_at || existing.kind != record.kind {
                    return Err(SyncFailure::Conflict(record.id.clone()));
                }
            }
            None => match store.insert(record) {
                Ok(()) | Err(StoreError::Duplicate(_)) => {}
                Err(err) => return Err(err.into()),
            },
        }

        if self.log.mark_synced(&record.id)? == MarkSynced::NotFound {
            tracing::warn!("record {} vanished from the fallback log during sync", record.id);
        }
        Ok(())
    }
}
