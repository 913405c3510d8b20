use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use intake_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

/// Outcome of a schema migration request. In dry-run mode `to_version` equals `from_version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub from_version: i64,
    pub to_version: i64,
    pub target_version: i64,
    pub planned_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

/// Maintenance operations on the `SQLite` primary database file.
#[derive(Debug, Clone)]
pub struct PrimaryDatabase {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl PrimaryDatabase {
    #[must_use]
    pub fn new(db_path: PathBuf, busy_timeout: Duration) -> Self {
        Self { db_path, busy_timeout }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path, self.busy_timeout)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Applies pending migrations unless `dry_run` is set. Either way the plan is reported.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a migration fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let plan = store.schema_status()?;
        let to_version = if dry_run {
            plan.current_version
        } else {
            store.migrate()?;
            let applied = store.schema_status()?;
            tracing::info!(
                "primary schema migrated from v{} to v{}",
                plan.current_version,
                applied.current_version
            );
            applied.current_version
        };
        Ok(MigrateResult {
            dry_run,
            from_version: plan.current_version,
            to_version,
            target_version: plan.target_version,
            planned_versions: plan.pending_versions,
            inferred_from_legacy: plan.inferred_from_legacy,
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TADM-001
    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("intake-admin-{}.sqlite3", ulid::Ulid::new()));
        let database = PrimaryDatabase::new(db_path.clone(), Duration::from_secs(5));

        let plan = database.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!((plan.from_version, plan.to_version), (0, 0));
        assert_eq!(plan.planned_versions, vec![1, 2]);
        assert_eq!(database.schema_status()?.current_version, 0);

        let applied = database.migrate(false)?;
        assert_eq!((applied.from_version, applied.to_version), (0, 2));
        assert!(database.schema_status()?.pending_versions.is_empty());
        assert!(database.integrity_check()?.quick_check_ok);

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }
}
