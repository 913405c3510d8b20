//! Durable local log used when the primary store cannot take a write.
//!
//! The log is a single pretty-printed JSON array. Every entry is a record with its sync
//! envelope (`_sync_status`, `_fallback_saved_at`, `_synced_at`) inlined next to the record
//! fields. Each mutation reads the whole file, changes it in memory, and atomically replaces it.
//!
//! Writers are serialized twice: a process-local mutex orders threads sharing one
//! [`FallbackLog`], and an advisory lock on `<log>.lock` orders separate processes pointing at the
//! same file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use intake_core::{
    sort_newest_first, CoreError, Record, RecordId, RecordPatch, RecordStatus, SyncEnvelope,
    ENVELOPE_KEY_PREFIX,
};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("fallback log I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode fallback log: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record already present in fallback log: {0}")]
    Duplicate(RecordId),
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LogError + '_ {
    move |source| LogError::Io { path: path.to_path_buf(), source }
}

/// A record together with the bookkeeping the log keeps for it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub record: Record,
    pub envelope: SyncEnvelope,
}

impl LogEntry {
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(&self.record)?;
        if let (Value::Object(fields), Value::Object(envelope)) =
            (&mut value, serde_json::to_value(self.envelope)?)
        {
            fields.extend(envelope);
        }
        Ok(value)
    }

    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(fields) = value else {
            return Err(serde::de::Error::custom("log entry must be a JSON object"));
        };
        let (envelope, record): (Map<String, Value>, Map<String, Value>) =
            fields.into_iter().partition(|(key, _)| key.starts_with(ENVELOPE_KEY_PREFIX));
        Ok(Self {
            record: serde_json::from_value(Value::Object(record))?,
            envelope: serde_json::from_value(Value::Object(envelope))?,
        })
    }
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().map_err(serde::ser::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::from_value(Value::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSynced {
    Synced,
    AlreadySynced,
    NotFound,
}

/// Result of patching the local copy of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalUpdate {
    Applied,
    /// The entry already reached the primary store; its local copy was left untouched.
    Synced,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub path: String,
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest_pending_saved_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct Loaded {
    entries: Vec<LogEntry>,
    corrupt: bool,
}

pub struct FallbackLog {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl FallbackLog {
    /// The file is created on first write. Its directory must already exist.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_os_string();
        lock_name.push(".lock");
        Self { path, lock_path: PathBuf::from(lock_name), guard: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record as pending.
    ///
    /// # Errors
    /// Returns [`LogError::Duplicate`] if the id is already in the log, [`LogError::Invalid`] for
    /// records that fail validation, and [`LogError::Io`] when the log cannot be made durable.
    pub fn append(&self, record: &Record) -> Result<SyncEnvelope, LogError> {
        record.validate()?;
        let envelope = SyncEnvelope::pending(OffsetDateTime::now_utc());
        self.modify(|entries| {
            if entries.iter().any(|entry| entry.record.id == record.id) {
                return Err(LogError::Duplicate(record.id.clone()));
            }
            entries.push(LogEntry { record: record.clone(), envelope });
            Ok(((), true))
        })?;
        tracing::info!("fallback log accepted {} {}", record.kind.as_str(), record.id);
        Ok(envelope)
    }

    /// Records still waiting for the primary store, oldest first.
    ///
    /// # Errors
    /// Returns [`LogError::Io`] when the log exists but cannot be read.
    pub fn pending(&self) -> Result<Vec<Record>, LogError> {
        Ok(self
            .read()?
            .into_iter()
            .filter(|entry| entry.envelope.is_pending())
            .map(|entry| entry.record)
            .collect())
    }

    /// Flags a record as copied to the primary store. Marking twice keeps the first timestamp.
    ///
    /// # Errors
    /// Returns [`LogError::Io`] when the change cannot be made durable.
    pub fn mark_synced(&self, id: &RecordId) -> Result<MarkSynced, LogError> {
        let now = OffsetDateTime::now_utc();
        self.modify(|entries| {
            let mut outcome = MarkSynced::NotFound;
            for entry in entries.iter_mut().filter(|entry| &entry.record.id == id) {
                if entry.envelope.mark_synced(now) {
                    outcome = MarkSynced::Synced;
                } else if outcome == MarkSynced::NotFound {
                    outcome = MarkSynced::AlreadySynced;
                }
            }
            Ok((outcome, outcome == MarkSynced::Synced))
        })
    }

    /// Every record in the log with the envelope stripped, newest first.
    ///
    /// # Errors
    /// Returns [`LogError::Io`] when the log exists but cannot be read.
    pub fn all(&self) -> Result<Vec<Record>, LogError> {
        let mut records = self.read()?.into_iter().map(|entry| entry.record).collect::<Vec<_>>();
        sort_newest_first(&mut records);
        Ok(records)
    }

    /// Every entry with its envelope, in log order.
    ///
    /// # Errors
    /// Returns [`LogError::Io`] when the log exists but cannot be read.
    pub fn entries(&self) -> Result<Vec<LogEntry>, LogError> {
        self.read()
    }

    /// # Errors
    /// Returns [`LogError::Io`] when the log exists but cannot be read.
    pub fn get(&self, id: &RecordId) -> Result<Option<Record>, LogError> {
        Ok(self.read()?.into_iter().rev().find(|entry| &entry.record.id == id).map(|e| e.record))
    }

    /// # Errors
    /// Returns [`LogError::Invalid`] if the status does not fit the record kind.
    pub fn update_status(
        &self,
        id: &RecordId,
        status: RecordStatus,
    ) -> Result<LocalUpdate, LogError> {
        self.update(id, &RecordPatch::status(status))
    }

    /// Applies a patch to the local copy of a pending record. Synced entries are audit copies
    /// and are never patched, since no later sync would carry the change over.
    ///
    /// # Errors
    /// Returns [`LogError::Invalid`] for patches the record rejects and [`LogError::Io`] when the
    /// change cannot be made durable.
    pub fn update(&self, id: &RecordId, patch: &RecordPatch) -> Result<LocalUpdate, LogError> {
        patch.validate()?;
        let now = OffsetDateTime::now_utc();
        self.modify(|entries| {
            let Some(entry) = entries.iter_mut().rev().find(|entry| &entry.record.id == id) else {
                return Ok((LocalUpdate::NotFound, false));
            };
            if !entry.envelope.is_pending() {
                return Ok((LocalUpdate::Synced, false));
            }
            entry.record.apply_patch(patch, now)?;
            Ok((LocalUpdate::Applied, true))
        })
    }

    /// # Errors
    /// Returns [`LogError::Io`] when the log exists but cannot be read.
    pub fn stats(&self) -> Result<LogStats, LogError> {
        let entries = self.read()?;
        let pending = entries.iter().filter(|entry| entry.envelope.is_pending()).count();
        let oldest_pending_saved_at = entries
            .iter()
            .filter(|entry| entry.envelope.is_pending())
            .map(|entry| entry.envelope.fallback_saved_at)
            .min();
        Ok(LogStats {
            path: self.path.display().to_string(),
            total: entries.len(),
            pending,
            synced: entries.len() - pending,
            oldest_pending_saved_at,
        })
    }

    fn read(&self) -> Result<Vec<LogEntry>, LogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.guard.lock();
        let lock_file = self.open_lock_file()?;
        FileExt::lock_shared(&lock_file).map_err(io_error(&self.lock_path))?;
        let loaded = self.load()?;
        drop(lock_file);
        Ok(loaded.entries)
    }

    fn modify<T>(
        &self,
        operation: impl FnOnce(&mut Vec<LogEntry>) -> Result<(T, bool), LogError>,
    ) -> Result<T, LogError> {
        let _guard = self.guard.lock();
        let lock_file = self.open_lock_file()?;
        FileExt::lock_exclusive(&lock_file).map_err(io_error(&self.lock_path))?;

        let mut loaded = self.load()?;
        let (result, dirty) = operation(&mut loaded.entries)?;
        if dirty {
            if loaded.corrupt {
                self.quarantine()?;
            }
            self.persist(&loaded.entries)?;
        }
        drop(lock_file);
        Ok(result)
    }

    fn open_lock_file(&self) -> Result<File, LogError> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(io_error(&self.lock_path))
    }

    fn load(&self) -> Result<Loaded, LogError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::default()),
            Err(source) => return Err(LogError::Io { path: self.path.clone(), source }),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Loaded::default());
        }

        let values = match serde_json::from_slice::<Vec<Value>>(&raw) {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(
                    "fallback log {} is unreadable, treating as empty: {err}",
                    self.path.display()
                );
                return Ok(Loaded { entries: Vec::new(), corrupt: true });
            }
        };

        let mut loaded = Loaded::default();
        for (index, value) in values.into_iter().enumerate() {
            match LogEntry::from_value(value) {
                Ok(entry) => loaded.entries.push(entry),
                Err(err) => {
                    tracing::warn!(
                        "skipping malformed entry {index} in fallback log {}: {err}",
                        self.path.display()
                    );
                    loaded.corrupt = true;
                }
            }
        }
        Ok(loaded)
    }

    /// Keeps a copy of a damaged log before it gets rewritten.
    fn quarantine(&self) -> Result<(), LogError> {
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".corrupt-{stamp}"));
        let target = PathBuf::from(name);
        match fs::copy(&self.path, &target) {
            Ok(_) => {
                tracing::warn!(
                    "preserved damaged fallback log {} as {}",
                    self.path.display(),
                    target.display()
                );
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LogError::Io { path: target, source }),
        }
    }

    fn persist(&self, entries: &[LogEntry]) -> Result<(), LogError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_error(parent))?;
        serde_json::to_writer_pretty(&mut temp, entries)?;
        temp.write_all(b"\n").map_err(io_error(&self.path))?;
        temp.as_file().sync_all().map_err(io_error(&self.path))?;
        temp.persist(&self.path).map_err(|err| LogError::Io {
            path: self.path.clone(),
            source: err.error,
        })?;
        Ok(())
    }
}
