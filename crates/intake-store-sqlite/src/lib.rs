use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use intake_core::{
    CoreError, Page, PrimaryStore, Record, RecordFilter, RecordId, RecordKind, RecordPatch,
    RecordStatus, StoreError,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('complaint','pickup')),
  status TEXT NOT NULL CHECK (status IN ('Pending','Processing','Resolved','Confirmed','In Progress','Completed','Cancelled')),
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  updated_at TEXT,
  payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_created ON records(created_at_ns DESC, id ASC);
CREATE INDEX IF NOT EXISTS idx_records_kind_status ON records(kind, status);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE records ADD COLUMN search_text TEXT NOT NULL DEFAULT '';
";

const RECORD_COLUMNS: &str = "id, kind, status, created_at, updated_at, payload_json";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: u64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Updated(Record),
    NotFound,
    Rejected(CoreError),
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            busy_timeout.as_millis()
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "records")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "records", "search_text")? {
            // Tables already carry the v2 shape but the migration rows are missing.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "records", "payload_json")? {
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: records has no payload_json column"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "records", "search_text")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to add search_text column")?;

        let records = {
            let mut stmt = tx.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records"))?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(record_from_row(row)?);
            }
            records
        };

        for record in &records {
            tx.execute(
                "UPDATE records SET search_text = ?1 WHERE id = ?2",
                params![record.search_text(), record.id.as_str()],
            )
            .with_context(|| format!("failed to backfill search_text for {}", record.id))?;
        }

        tx.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_records_search ON records(kind, search_text);",
        )
        .context("failed to create search index")?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        tracing::info!("applied migration v2, backfilled {} records", records.len());
        Ok(())
    }

    /// Insert one validated record unless a record with the same id already exists.
    ///
    /// # Errors
    /// Returns an error when validation fails or the write transaction fails.
    pub fn insert_record(&mut self, record: &Record) -> Result<InsertOutcome> {
        record.validate().map_err(|err| anyhow!("record validation failed: {err}"))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        if record_exists(&tx, &record.id)? {
            return Ok(InsertOutcome::AlreadyExists);
        }

        tx.execute(
            "INSERT INTO records(
                id, kind, status, created_at, created_at_ns, updated_at, payload_json, search_text
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.as_str(),
                record.kind.as_str(),
                record.status.as_str(),
                rfc3339(record.created_at)?,
                unix_nanos(record.created_at)?,
                record.updated_at.map(rfc3339).transpose()?,
                serde_json::to_string(&record.payload).context("failed to serialize payload")?,
                record.search_text(),
            ],
        )
        .context("failed to insert record")?;

        tx.commit().context("failed to commit insert transaction")?;
        Ok(InsertOutcome::Inserted)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        let mut stmt =
            self.conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write of a single record inside one immediate transaction.
    ///
    /// # Errors
    /// Returns an error when the transaction fails. Patches the record refuses are reported as
    /// [`PatchOutcome::Rejected`].
    pub fn update_record(
        &mut self,
        id: &RecordId,
        patch: &RecordPatch,
        now: OffsetDateTime,
    ) -> Result<PatchOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let current = {
            let mut stmt =
                tx.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"))?;
            let mut rows = stmt.query(params![id.as_str()])?;
            match rows.next()? {
                Some(row) => Some(record_from_row(row)?),
                None => None,
            }
        };

        let Some(mut record) = current else {
            return Ok(PatchOutcome::NotFound);
        };

        if let Err(err) = record.apply_patch(patch, now) {
            return Ok(PatchOutcome::Rejected(err));
        }

        tx.execute(
            "UPDATE records
             SET status = ?1, updated_at = ?2, payload_json = ?3, search_text = ?4
             WHERE id = ?5",
            params![
                record.status.as_str(),
                record.updated_at.map(rfc3339).transpose()?,
                serde_json::to_string(&record.payload).context("failed to serialize payload")?,
                record.search_text(),
                record.id.as_str(),
            ],
        )
        .context("failed to update record")?;

        tx.commit().context("failed to commit update transaction")?;
        Ok(PatchOutcome::Updated(record))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_records(&self, filter: &RecordFilter) -> Result<u64> {
        let (where_sql, values) = filter_clause(filter)?;
        let count = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM records{where_sql}"),
                params_from_iter(values.iter()),
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count records")?;
        u64::try_from(count).context("negative record count")
    }

    /// Load matching records newest first, optionally restricted to one page.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_records(&self, filter: &RecordFilter, page: Option<Page>) -> Result<Vec<Record>> {
        let (where_sql, mut values) = filter_clause(filter)?;
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records{where_sql} ORDER BY created_at_ns DESC, id ASC"
        );
        if let Some(page) = page {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(SqlValue::Integer(i64::from(page.limit())));
            values.push(SqlValue::Integer(
                i64::try_from(page.offset()).context("page offset out of range")?,
            ));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let record_count = if table_exists(&self.conn, "records")? {
            self.count_records(&RecordFilter::default())?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_count,
            schema_status,
        })
    }
}

/// [`PrimaryStore`] backed by a `SQLite` file. Every call opens its own connection so a database
/// that disappears or comes back is noticed on the next call.
#[derive(Debug, Clone)]
pub struct SqlitePrimary {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqlitePrimary {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self { db_path: db_path.into(), busy_timeout }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore, StoreError> {
        let mut store = SqliteStore::open(&self.db_path, self.busy_timeout)
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        store.migrate().map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        Ok(store)
    }
}

fn backend(err: &anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

impl PrimaryStore for SqlitePrimary {
    fn ping(&self) -> Result<(), StoreError> {
        let store = self.open_store()?;
        store
            .conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    fn insert(&self, record: &Record) -> Result<(), StoreError> {
        record.validate()?;
        let mut store = self.open_store()?;
        match store.insert_record(record).map_err(|err| backend(&err))? {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::AlreadyExists => Err(StoreError::Duplicate(record.id.clone())),
        }
    }

    fn find_one(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        let store = self.open_store()?;
        store.get_record(id).map_err(|err| backend(&err))
    }

    fn update_one(
        &self,
        id: &RecordId,
        patch: &RecordPatch,
        now: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        patch.validate()?;
        let mut store = self.open_store()?;
        match store.update_record(id, patch, now).map_err(|err| backend(&err))? {
            PatchOutcome::Updated(_) => Ok(1),
            PatchOutcome::NotFound => Ok(0),
            PatchOutcome::Rejected(err) => Err(StoreError::Invalid(err)),
        }
    }

    fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let store = self.open_store()?;
        store.count_records(filter).map_err(|err| backend(&err))
    }

    fn find(&self, filter: &RecordFilter, page: Option<Page>) -> Result<Vec<Record>, StoreError> {
        let store = self.open_store()?;
        store.list_records(filter, page).map_err(|err| backend(&err))
    }
}

fn filter_clause(filter: &RecordFilter) -> Result<(String, Vec<SqlValue>)> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(kind) = filter.kind {
        clauses.push("kind = ?");
        values.push(SqlValue::Text(kind.as_str().to_string()));
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(from) = filter.created_from {
        clauses.push("created_at_ns >= ?");
        values.push(SqlValue::Integer(unix_nanos(from)?));
    }
    if let Some(to) = filter.created_to {
        clauses.push("created_at_ns < ?");
        values.push(SqlValue::Integer(unix_nanos(to)?));
    }
    if let Some(term) = filter.search_term() {
        clauses.push("instr(search_text, ?) > 0");
        values.push(SqlValue::Text(term));
    }

    let where_sql =
        if clauses.is_empty() { String::new() } else { format!(" WHERE {}", clauses.join(" AND ")) };
    Ok((where_sql, values))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<Record> {
    let id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let updated_at: Option<String> = row.get(4)?;
    let payload_json: String = row.get(5)?;

    let payload: Map<String, Value> =
        serde_json::from_str(&payload_json).context("failed to deserialize payload")?;

    Ok(Record {
        id: RecordId::parse(&id_raw).map_err(|err| anyhow!("invalid stored id: {err}"))?,
        kind: RecordKind::parse(&kind_raw).ok_or_else(|| anyhow!("unknown kind: {kind_raw}"))?,
        status: RecordStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown status: {status_raw}"))?,
        created_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
        updated_at: updated_at.as_deref().map(parse_rfc3339).transpose()?,
        payload,
    })
}

fn record_exists(conn: &Connection, id: &RecordId) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM records WHERE id = ?1", params![id.as_str()], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .with_context(|| format!("failed to check record existence for {id}"))?;
    Ok(found.is_some())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "records")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "records", "search_text")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "records", "payload_json")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: records has no payload_json column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of range: {value}"))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use intake_core::DEFAULT_PAGE_LIMIT;
    use serde_json::json;
    use ulid::Ulid;

    use super::*;

    fn temp_db(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("intake-{label}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = db_path.as_os_str().to_os_string();
            raw.push(suffix);
            let _ = fs::remove_file(PathBuf::from(raw));
        }
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture payload must be an object, got {other}"),
        }
    }

    fn mk_record(id: &str, kind: RecordKind, offset_secs: i64, name: &str) -> Result<Record> {
        Ok(Record::new(
            RecordId::parse(id).map_err(|err| anyhow!("{err}"))?,
            kind,
            payload(json!({
                "name": name,
                "location": "Ward 7, Market Street",
                "description": "Garbage not collected for a week",
            })),
            fixture_time() + time::Duration::seconds(offset_secs),
        ))
    }

    fn open_migrated(db_path: &Path) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(db_path, DEFAULT_BUSY_TIMEOUT)?;
        store.migrate()?;
        Ok(store)
    }

    // Test IDs: TSTORE-001
    #[test]
    fn migrate_fresh_database_reaches_latest_version() -> Result<()> {
        let db_path = temp_db("migrate-fresh");
        let store = open_migrated(&db_path)?;
        let status = store.schema_status()?;

        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        assert!(table_has_column(&store.conn, "records", "search_text")?);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSTORE-002
    #[test]
    fn legacy_v1_database_is_inferred_and_backfilled() -> Result<()> {
        let db_path = temp_db("migrate-legacy");
        {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(MIGRATION_001_SQL)?;
            conn.execute(
                "INSERT INTO records(id, kind, status, created_at, created_at_ns, updated_at, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
                params![
                    "482913",
                    "complaint",
                    "Pending",
                    rfc3339(fixture_time())?,
                    unix_nanos(fixture_time())?,
                    r#"{"name":"Ravi Kumar","location":"Old Bazaar"}"#,
                ],
            )?;
        }

        let mut store = SqliteStore::open(&db_path, DEFAULT_BUSY_TIMEOUT)?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 1);
        assert!(before.inferred_from_legacy);
        assert_eq!(before.pending_versions, vec![2]);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, 2);
        assert!(!after.inferred_from_legacy);

        let hits = store.list_records(
            &RecordFilter { search: Some("old bazaar".to_string()), ..RecordFilter::default() },
            None,
        )?;
        assert_eq!(hits.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSTORE-003
    #[test]
    fn insert_and_get_round_trip_with_duplicate_detection() -> Result<()> {
        let db_path = temp_db("insert");
        let mut store = open_migrated(&db_path)?;
        let record = mk_record("482913", RecordKind::Complaint, 0, "Asha Verma")?;

        assert_eq!(store.insert_record(&record)?, InsertOutcome::Inserted);
        assert_eq!(store.insert_record(&record)?, InsertOutcome::AlreadyExists);
        assert_eq!(store.get_record(&record.id)?, Some(record.clone()));
        assert_eq!(store.get_record(&RecordId::parse("000000").map_err(|e| anyhow!("{e}"))?)?, None);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSTORE-004
    #[test]
    fn update_record_merges_patch_and_rejects_foreign_status() -> Result<()> {
        let db_path = temp_db("update");
        let mut store = open_migrated(&db_path)?;
        let record = mk_record("PICKUP100200", RecordKind::Pickup, 0, "Meena Iyer")?;
        store.insert_record(&record)?;

        let mut patch = RecordPatch::status(RecordStatus::Confirmed);
        patch.payload.insert("assigned_driver".to_string(), json!("Driver 4"));
        let now = fixture_time() + time::Duration::hours(1);

        let PatchOutcome::Updated(updated) = store.update_record(&record.id, &patch, now)? else {
            return Err(anyhow!("expected update to succeed"));
        };
        assert_eq!(updated.status, RecordStatus::Confirmed);
        assert_eq!(updated.updated_at, Some(now));
        assert_eq!(store.get_record(&record.id)?, Some(updated));

        let hits = store.list_records(
            &RecordFilter { search: Some("driver 4".to_string()), ..RecordFilter::default() },
            None,
        )?;
        assert_eq!(hits.len(), 1);

        let rejected =
            store.update_record(&record.id, &RecordPatch::status(RecordStatus::Resolved), now)?;
        assert!(matches!(rejected, PatchOutcome::Rejected(CoreError::Validation(_))));

        let missing = RecordId::parse("PICKUP999999").map_err(|err| anyhow!("{err}"))?;
        assert_eq!(store.update_record(&missing, &patch, now)?, PatchOutcome::NotFound);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSTORE-005
    #[test]
    fn list_records_orders_filters_and_pages() -> Result<()> {
        let db_path = temp_db("list");
        let mut store = open_migrated(&db_path)?;
        store.insert_record(&mk_record("100001", RecordKind::Complaint, 10, "A")?)?;
        store.insert_record(&mk_record("100002", RecordKind::Complaint, 30, "B")?)?;
        store.insert_record(&mk_record("100003", RecordKind::Complaint, 30, "C")?)?;
        store.insert_record(&mk_record("PICKUP100004", RecordKind::Pickup, 20, "D")?)?;

        let all = store.list_records(&RecordFilter::default(), None)?;
        let ids = all.iter().map(|record| record.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["100002", "100003", "PICKUP100004", "100001"]);

        let complaints = RecordFilter::kind(RecordKind::Complaint);
        assert_eq!(store.count_records(&complaints)?, 3);

        let page = Page::new(2, 2).map_err(|err| anyhow!("{err}"))?;
        let second = store.list_records(&complaints, Some(page))?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id.as_str(), "100001");

        let window = RecordFilter {
            created_from: Some(fixture_time() + time::Duration::seconds(20)),
            created_to: Some(fixture_time() + time::Duration::seconds(30)),
            ..RecordFilter::default()
        };
        let windowed = store.list_records(&window, None)?;
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].id.as_str(), "PICKUP100004");

        let default_page = store.list_records(&RecordFilter::default(), Some(Page::default()))?;
        assert!(default_page.len() <= usize::try_from(DEFAULT_PAGE_LIMIT)?);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSTORE-006
    #[test]
    fn sqlite_primary_maps_missing_directory_to_unavailable() {
        let missing_dir = std::env::temp_dir().join(format!("intake-missing-{}", Ulid::new()));
        let primary = SqlitePrimary::new(missing_dir.join("primary.sqlite3"), DEFAULT_BUSY_TIMEOUT);

        assert!(matches!(primary.ping(), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            primary.count(&RecordFilter::default()),
            Err(StoreError::Unavailable(_))
        ));
    }

    // Test IDs: TSTORE-007
    #[test]
    fn sqlite_primary_reports_duplicates_and_update_counts() -> Result<()> {
        let db_path = temp_db("primary");
        let primary = SqlitePrimary::new(&db_path, DEFAULT_BUSY_TIMEOUT);
        let record = mk_record("482913", RecordKind::Complaint, 0, "Asha Verma")?;

        primary.ping().map_err(|err| anyhow!("{err}"))?;
        primary.insert(&record).map_err(|err| anyhow!("{err}"))?;
        assert!(matches!(primary.insert(&record), Err(StoreError::Duplicate(_))));

        let patch = RecordPatch::status(RecordStatus::Resolved);
        assert_eq!(primary.update_one(&record.id, &patch, fixture_time()).ok(), Some(1));
        let missing = RecordId::parse("999999").map_err(|err| anyhow!("{err}"))?;
        assert_eq!(primary.update_one(&missing, &patch, fixture_time()).ok(), Some(0));
        assert!(matches!(
            primary.update_one(&record.id, &RecordPatch::status(RecordStatus::Cancelled), fixture_time()),
            Err(StoreError::Invalid(_))
        ));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSTORE-008
    #[test]
    fn backup_database_produces_readable_copy() -> Result<()> {
        let db_path = temp_db("backup-src");
        let backup_path = temp_db("backup-dst");
        let mut store = open_migrated(&db_path)?;
        store.insert_record(&mk_record("482913", RecordKind::Complaint, 0, "Asha Verma")?)?;

        store.backup_database(&backup_path)?;
        let restored = SqliteStore::open(&backup_path, DEFAULT_BUSY_TIMEOUT)?;
        assert_eq!(restored.count_records(&RecordFilter::default())?, 1);

        cleanup(&db_path);
        cleanup(&backup_path);
        Ok(())
    }

    // Test IDs: TSTORE-009
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let db_path = temp_db("integrity");
        let store = open_migrated(&db_path)?;
        let report = store.integrity_check()?;

        assert!(report.quick_check_ok);
        assert_eq!(report.record_count, 0);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_inserts_and_reads_preserve_integrity() -> Result<()> {
        let db_path = temp_db("concurrency");
        {
            open_migrated(&db_path)?;
        }

        let writer_threads = 4_usize;
        let writes_per_thread = 20_usize;
        let reader_threads = 2;
        let read_iterations = 30;

        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let primary = SqlitePrimary::new(writer_path, DEFAULT_BUSY_TIMEOUT);
                for index in 0..writes_per_thread {
                    let id = format!("{}", 100_000 + writer * 1_000 + index);
                    let offset = i64::try_from(index)?;
                    let record = mk_record(&id, RecordKind::Complaint, offset, "thread-writer")?;
                    primary.insert(&record).map_err(|err| anyhow!("{err}"))?;
                }
                Ok(())
            }));
        }

        for _ in 0..reader_threads {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&reader_path, DEFAULT_BUSY_TIMEOUT)?;
                for _ in 0..read_iterations {
                    let _ = store.list_records(&RecordFilter::default(), None)?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path, DEFAULT_BUSY_TIMEOUT)?;
        let records = store.list_records(&RecordFilter::default(), None)?;
        assert_eq!(records.len(), writer_threads * writes_per_thread);
        assert!(store.integrity_check()?.quick_check_ok);

        cleanup(&db_path);
        Ok(())
    }
}
