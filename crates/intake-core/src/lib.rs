use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Payload keys owned by the record itself. Callers cannot smuggle them in through the payload.
pub const RESERVED_PAYLOAD_KEYS: [&str; 5] = ["id", "kind", "status", "created_at", "updated_at"];

/// Keys starting with this prefix belong to the sync envelope of the local log.
pub const ENVELOPE_KEY_PREFIX: char = '_';

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const TOKEN_LENGTH: usize = 12;

/// Payload key holding the submitter's tracking token. It is never searchable.
pub const TOKEN_KEY: &str = "token";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Failures surfaced by a primary store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("primary store unavailable: {0}")]
    Unavailable(String),
    #[error("record already exists in primary store: {0}")]
    Duplicate(RecordId),
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("primary store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the failure means the store cannot be trusted right now, as opposed to the
    /// request itself being wrong.
    #[must_use]
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Backend(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// # Errors
    /// Returns [`CoreError::Validation`] for blank identifiers or identifiers with whitespace.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Validation("record id MUST be non-empty".to_string()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "record id MUST NOT contain whitespace: {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Complaint,
    Pickup,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complaint => "complaint",
            Self::Pickup => "pickup",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complaint" => Some(Self::Complaint),
            "pickup" => Some(Self::Pickup),
            _ => None,
        }
    }

    #[must_use]
    pub fn statuses(self) -> &'static [RecordStatus] {
        match self {
            Self::Complaint => {
                &[RecordStatus::Pending, RecordStatus::Processing, RecordStatus::Resolved]
            }
            Self::Pickup => &[
                RecordStatus::Pending,
                RecordStatus::Confirmed,
                RecordStatus::InProgress,
                RecordStatus::Completed,
                RecordStatus::Cancelled,
            ],
        }
    }

    #[must_use]
    pub fn allows(self, status: RecordStatus) -> bool {
        self.statuses().contains(&status)
    }

    /// Complaints get a six digit number, pickups a `PICKUP` prefixed six digit number.
    #[must_use]
    pub fn generate_id(self) -> RecordId {
        let number: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        match self {
            Self::Complaint => RecordId(number.to_string()),
            Self::Pickup => RecordId(format!("PICKUP{number}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordStatus {
    Pending,
    Processing,
    Resolved,
    Confirmed,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Cancelled,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Resolved => "Resolved",
            Self::Confirmed => "Confirmed",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Processing" => Some(Self::Processing),
            "Resolved" => Some(Self::Resolved),
            "Confirmed" => Some(Self::Confirmed),
            "In Progress" => Some(Self::InProgress),
            "Completed" => Some(Self::Completed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Twelve alphanumeric characters handed back to the submitter for status lookups.
#[must_use]
pub fn generate_token() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(TOKEN_LENGTH).map(char::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub status: RecordStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<OffsetDateTime>,
    /// Domain fields. Serialized inline next to the fixed fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new(
        id: RecordId,
        kind: RecordKind,
        payload: Map<String, Value>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self { id, kind, status: RecordStatus::Pending, created_at, updated_at: None, payload }
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when the status does not belong to the record kind or
    /// the payload carries reserved or envelope keys.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::Validation("record id MUST be non-empty".to_string()));
        }
        if !self.kind.allows(self.status) {
            return Err(CoreError::Validation(format!(
                "status {:?} is not valid for {} records",
                self.status.as_str(),
                self.kind.as_str()
            )));
        }
        validate_payload_keys(&self.payload)
    }

    /// Applies a partial update in place. Payload keys are merged shallowly.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] if the patch is malformed or its status is not valid for
    /// this record's kind. The record is left untouched on error.
    pub fn apply_patch(
        &mut self,
        patch: &RecordPatch,
        now: OffsetDateTime,
    ) -> Result<(), CoreError> {
        patch.validate()?;
        if let Some(status) = patch.status {
            if !self.kind.allows(status) {
                return Err(CoreError::Validation(format!(
                    "status {:?} is not valid for {} records",
                    status.as_str(),
                    self.kind.as_str()
                )));
            }
            self.status = status;
        }
        for (key, value) in &patch.payload {
            self.payload.insert(key.clone(), value.clone());
        }
        self.updated_at = Some(now);
        Ok(())
    }

    /// Lowercased haystack used for free-text search: the id plus every string in the payload
    /// except the tracking token.
    #[must_use]
    pub fn search_text(&self) -> String {
        let mut parts = vec![self.id.as_str().to_lowercase()];
        for (_, value) in self.payload.iter().filter(|(key, _)| key.as_str() != TOKEN_KEY) {
            collect_strings(value, &mut parts);
        }
        parts.join("\n")
    }

    #[must_use]
    pub fn matches(&self, filter: &RecordFilter) -> bool {
        if filter.kind.is_some_and(|kind| kind != self.kind) {
            return false;
        }
        if filter.status.is_some_and(|status| status != self.status) {
            return false;
        }
        if filter.created_from.is_some_and(|from| self.created_at < from) {
            return false;
        }
        if filter.created_to.is_some_and(|to| self.created_at >= to) {
            return false;
        }
        match filter.search_term() {
            Some(term) => self.search_text().contains(&term),
            None => true,
        }
    }

    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.push(text.to_lowercase()),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn validate_payload_keys(payload: &Map<String, Value>) -> Result<(), CoreError> {
    for key in payload.keys() {
        if RESERVED_PAYLOAD_KEYS.contains(&key.as_str()) {
            return Err(CoreError::Validation(format!(
                "payload key {key:?} is reserved for the record itself"
            )));
        }
        if key.starts_with(ENVELOPE_KEY_PREFIX) {
            return Err(CoreError::Validation(format!(
                "payload key {key:?} MUST NOT start with {ENVELOPE_KEY_PREFIX:?}"
            )));
        }
    }
    Ok(())
}

/// Newest first, ties broken by ascending id so listings are stable across stores.
#[must_use]
pub fn newest_first(left: &Record, right: &Record) -> Ordering {
    right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id))
}

pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(newest_first);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl RecordPatch {
    #[must_use]
    pub fn status(status: RecordStatus) -> Self {
        Self { status: Some(status), payload: Map::new() }
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] for empty patches or patches touching reserved keys.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.status.is_none() && self.payload.is_empty() {
            return Err(CoreError::Validation("patch MUST change at least one field".to_string()));
        }
        validate_payload_keys(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }
}

/// Bookkeeping the local log keeps next to every record it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    #[serde(rename = "_sync_status")]
    pub sync_status: SyncStatus,
    #[serde(rename = "_fallback_saved_at", with = "time::serde::rfc3339")]
    pub fallback_saved_at: OffsetDateTime,
    #[serde(
        rename = "_synced_at",
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub synced_at: Option<OffsetDateTime>,
}

impl SyncEnvelope {
    #[must_use]
    pub fn pending(saved_at: OffsetDateTime) -> Self {
        Self { sync_status: SyncStatus::Pending, fallback_saved_at: saved_at, synced_at: None }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Returns `true` when this call moved the envelope from pending to synced. Marking an
    /// already synced envelope keeps the first `synced_at`.
    pub fn mark_synced(&mut self, now: OffsetDateTime) -> bool {
        if self.sync_status == SyncStatus::Synced {
            return false;
        }
        self.sync_status = SyncStatus::Synced;
        self.synced_at = Some(now);
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Inclusive lower bound on `created_at`.
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_from: Option<OffsetDateTime>,
    /// Exclusive upper bound on `created_at`.
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_to: Option<OffsetDateTime>,
}

impl RecordFilter {
    #[must_use]
    pub fn kind(kind: RecordKind) -> Self {
        Self { kind: Some(kind), ..Self::default() }
    }

    /// Normalized search term, or `None` when the search is absent or blank.
    #[must_use]
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }
}

/// A validated 1-based page. Deserialization goes through [`Page::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPage")]
pub struct Page {
    page: u32,
    limit: u32,
}

#[derive(Deserialize)]
struct RawPage {
    page: u32,
    limit: u32,
}

impl TryFrom<RawPage> for Page {
    type Error = CoreError;

    fn try_from(raw: RawPage) -> Result<Self, Self::Error> {
        Self::new(raw.page, raw.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: DEFAULT_PAGE_LIMIT }
    }
}

impl Page {
    /// # Errors
    /// Returns [`CoreError::Validation`] unless `page >= 1` and `1 <= limit <= 100`.
    pub fn new(page: u32, limit: u32) -> Result<Self, CoreError> {
        if page == 0 {
            return Err(CoreError::Validation("page MUST be >= 1".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(CoreError::Validation(format!(
                "limit MUST be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        Ok(Self { page, limit })
    }

    #[must_use]
    pub fn number(self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn limit(self) -> u32 {
        self.limit
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    #[must_use]
    pub fn pages(self, total: u64) -> u64 {
        total.div_ceil(u64::from(self.limit))
    }

    /// Slices an already ordered, already filtered list down to this page.
    #[must_use]
    pub fn slice(self, records: Vec<Record>) -> Vec<Record> {
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(self.limit).unwrap_or(usize::MAX);
        records.into_iter().skip(offset).take(limit).collect()
    }
}

/// The authoritative store. Implementations are shared across request threads.
pub trait PrimaryStore: Send + Sync {
    /// Cheap liveness check.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot be reached.
    fn ping(&self) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::Duplicate`] when the id is already present.
    fn insert(&self, record: &Record) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn find_one(&self, id: &RecordId) -> Result<Option<Record>, StoreError>;

    /// Returns the number of records matched (0 or 1).
    ///
    /// # Errors
    /// Returns [`StoreError::Invalid`] for patches the record rejects.
    fn update_one(
        &self,
        id: &RecordId,
        patch: &RecordPatch,
        now: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError>;

    /// Matching records ordered by [`newest_first`], optionally restricted to one page.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn find(&self, filter: &RecordFilter, page: Option<Page>) -> Result<Vec<Record>, StoreError>;
}
