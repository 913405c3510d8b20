use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use intake_core::{
    generate_token, CoreError, Page, PrimaryStore, Record, RecordFilter, RecordId, RecordKind,
    RecordPatch, RecordStatus, TOKEN_KEY,
};
use intake_fallback::{FallbackLog, LogEntry, LogError, LogStats};
use intake_store_sqlite::SqlitePrimary;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

mod admin;
mod availability;
mod config;
mod coordinator;
mod reader;
mod reconciler;
mod stats;
mod voice;

pub use admin::{MigrateResult, PrimaryDatabase};
pub use availability::PrimaryHandle;
pub use config::{IntakeConfig, DEFAULT_FALLBACK_LOG, DEFAULT_PRIMARY_DB, FALLBACK_LOG_ENV};
pub use coordinator::{
    DualWriteCoordinator, SaveError, SaveOutcome, StorageLocation, UpdateError, UpdateOutcome,
};
pub use reader::{Listing, Lookup, PagedListing, ReadSource, UnifiedReader};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use stats::PickupStats;
pub use voice::{
    is_allowed_audio, ExtractedFields, FieldExtractor, Transcriber, VoiceOverrides,
    ALLOWED_AUDIO_EXTENSIONS, DEFAULT_DEPARTMENT, DEFAULT_URGENCY, UNKNOWN_FIELD,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const PICKUP_SEARCH_LIMIT: u32 = 20;

/// Fresh ids are retried this many times when they collide with an existing record.
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("could not allocate an unused {0} id")]
    IdsExhausted(&'static str),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Fallback(#[from] LogError),
    #[error("voice pipeline failed: {0:#}")]
    Voice(anyhow::Error),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(message) => Self::Validation(message),
        }
    }
}

impl ApiError {
    /// Errors the caller cannot fix by changing the request; retrying later may succeed.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Save(SaveError::BothStoresUnavailable { .. })
            | Self::Update(UpdateError::PrimaryUnavailable(_) | UpdateError::Fallback { .. })
            | Self::Fallback(_)
            | Self::IdsExhausted(_) => true,
            Self::Save(SaveError::Invalid(_) | SaveError::Duplicate(_))
            | Self::Update(UpdateError::Invalid(_))
            | Self::Validation(_)
            | Self::NotFound(_)
            | Self::Voice(_) => false,
        }
    }

    #[must_use]
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Save(SaveError::Invalid(_) | SaveError::Duplicate(_))
                | Self::Update(UpdateError::Invalid(_))
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComplaintChannel {
    #[default]
    Text,
    Voice,
    Photo,
}

impl ComplaintChannel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Photo => "photo",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubmitComplaintRequest {
    pub name: String,
    pub location: String,
    pub description: String,
    pub department: String,
    pub urgency: String,
    pub phone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
    pub channel: ComplaintChannel,
    pub voice_path: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubmitPickupRequest {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub materials: Vec<String>,
    pub preferred_date: String,
    pub preferred_time: String,
    pub email: Option<String>,
    pub quantity: Option<String>,
    pub special_instructions: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PickupStatusUpdate {
    pub status: RecordStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub pickup_date: Option<String>,
    #[serde(default)]
    pub pickup_time: Option<String>,
    #[serde(default)]
    pub assigned_driver: Option<String>,
}

/// Receipt handed back to whoever submitted a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub id: RecordId,
    pub token: String,
    pub kind: RecordKind,
    pub status: RecordStatus,
    pub storage: StorageLocation,
    pub degraded: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceSubmission {
    #[serde(flatten)]
    pub submission: Submission,
    pub transcript: String,
    pub extracted_fields: ExtractedFields,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub id: RecordId,
    pub status: RecordStatus,
    pub storage: StorageLocation,
}

/// Entry point used by the HTTP service and the CLI.
#[derive(Clone)]
pub struct IntakeApi {
    primary: Arc<PrimaryHandle>,
    log: Arc<FallbackLog>,
    coordinator: Arc<DualWriteCoordinator>,
    reconciler: Arc<Reconciler>,
    reader: Arc<UnifiedReader>,
}

impl IntakeApi {
    #[must_use]
    pub fn new(primary: Arc<dyn PrimaryStore>, log: FallbackLog, probe_interval: Duration) -> Self {
        let primary = Arc::new(PrimaryHandle::new(primary, probe_interval));
        let log = Arc::new(log);
        Self {
            coordinator: Arc::new(DualWriteCoordinator::new(Arc::clone(&primary), Arc::clone(&log))),
            reconciler: Arc::new(Reconciler::new(Arc::clone(&primary), Arc::clone(&log))),
            reader: Arc::new(UnifiedReader::new(Arc::clone(&primary), Arc::clone(&log))),
            primary,
            log,
        }
    }

    /// `SQLite` primary plus JSON fallback log, both located by `config`.
    #[must_use]
    pub fn from_config(config: &IntakeConfig) -> Self {
        let primary = SqlitePrimary::new(config.primary_db.clone(), config.busy_timeout());
        Self::new(
            Arc::new(primary),
            FallbackLog::new(config.fallback_log.clone()),
            config.probe_interval(),
        )
    }

    #[must_use]
    pub fn primary_available(&self) -> bool {
        self.primary.is_available()
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for missing required fields and
    /// [`ApiError::Save`] when neither store accepts the complaint.
    pub fn submit_complaint(&self, request: SubmitComplaintRequest) -> Result<Submission, ApiError> {
        require_fields(&[
            ("name", &request.name),
            ("description", &request.description),
            ("location", &request.location),
            ("urgency", &request.urgency),
            ("department", &request.department),
        ])?;

        let token = generate_token();
        let mut payload = Map::new();
        payload.insert(TOKEN_KEY.to_string(), json!(token));
        payload.insert("channel".to_string(), json!(request.channel.as_str()));
        payload.insert("name".to_string(), json!(request.name.trim()));
        payload.insert("location".to_string(), json!(request.location.trim()));
        payload.insert("description".to_string(), json!(request.description.trim()));
        payload.insert("department".to_string(), json!(request.department.trim()));
        payload.insert("urgency".to_string(), json!(request.urgency.trim()));
        insert_opt(&mut payload, "phone", request.phone);
        insert_opt(&mut payload, "latitude", request.latitude);
        insert_opt(&mut payload, "longitude", request.longitude);
        insert_opt(&mut payload, "category", request.category);
        insert_opt(&mut payload, "voice_path", request.voice_path);
        insert_opt(&mut payload, "photo_url", request.photo_url);

        self.save_new(RecordKind::Complaint, payload, token)
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for missing required fields and
    /// [`ApiError::Save`] when neither store accepts the request.
    pub fn submit_pickup(&self, request: SubmitPickupRequest) -> Result<Submission, ApiError> {
        require_fields(&[
            ("name", &request.name),
            ("phone", &request.phone),
            ("address", &request.address),
            ("preferred_date", &request.preferred_date),
            ("preferred_time", &request.preferred_time),
        ])?;
        let materials = request
            .materials
            .iter()
            .map(|material| material.trim())
            .filter(|material| !material.is_empty())
            .collect::<Vec<_>>();
        if materials.is_empty() {
            return Err(ApiError::Validation("missing required field: materials".to_string()));
        }

        let token = generate_token();
        let mut payload = Map::new();
        payload.insert(TOKEN_KEY.to_string(), json!(token));
        payload.insert("name".to_string(), json!(request.name.trim()));
        payload.insert("phone".to_string(), json!(request.phone.trim()));
        payload.insert("address".to_string(), json!(request.address.trim()));
        payload.insert("materials".to_string(), json!(materials));
        payload.insert("preferred_date".to_string(), json!(request.preferred_date.trim()));
        payload.insert("preferred_time".to_string(), json!(request.preferred_time.trim()));
        payload.insert(
            "quantity".to_string(),
            json!(voice::non_blank(request.quantity).unwrap_or_else(|| "Medium".to_string())),
        );
        insert_opt(&mut payload, "email", request.email);
        insert_opt(&mut payload, "special_instructions", request.special_instructions);
        insert_opt(&mut payload, "latitude", request.latitude);
        insert_opt(&mut payload, "longitude", request.longitude);
        payload.insert("assigned_driver".to_string(), Value::Null);
        payload.insert("pickup_date".to_string(), Value::Null);
        payload.insert("pickup_time".to_string(), Value::Null);
        payload.insert("notes".to_string(), json!([]));

        self.save_new(RecordKind::Pickup, payload, token)
    }

    /// Transcribes `audio`, extracts complaint fields from the transcript, and files the
    /// complaint. Extraction failures fall back to default field values.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for unsupported audio files, [`ApiError::Voice`] when
    /// transcription fails, and [`ApiError::Save`] when neither store accepts the complaint.
    pub fn submit_voice_complaint(
        &self,
        audio: &Path,
        transcriber: &dyn Transcriber,
        extractor: &dyn FieldExtractor,
        overrides: VoiceOverrides,
    ) -> Result<VoiceSubmission, ApiError> {
        if !is_allowed_audio(audio) {
            return Err(ApiError::Validation(format!(
                "audio file type not allowed; expected one of {}",
                ALLOWED_AUDIO_EXTENSIONS.join(", ")
            )));
        }

        let transcript = transcriber.transcribe(audio).map_err(ApiError::Voice)?;
        let fields = extractor.extract_fields(&transcript).unwrap_or_else(|err| {
            tracing::warn!("field extraction failed, using defaults: {err:#}");
            ExtractedFields::default()
        });

        let resolved = ExtractedFields {
            name: Some(
                voice::non_blank(overrides.name)
                    .or_else(|| voice::non_blank(fields.name))
                    .unwrap_or_else(|| UNKNOWN_FIELD.to_string()),
            ),
            phone: voice::non_blank(overrides.phone).or_else(|| voice::non_blank(fields.phone)),
            location: Some(
                voice::non_blank(fields.location).unwrap_or_else(|| UNKNOWN_FIELD.to_string()),
            ),
            department: Some(
                voice::non_blank(fields.department)
                    .unwrap_or_else(|| DEFAULT_DEPARTMENT.to_string()),
            ),
            description: Some(
                voice::non_blank(fields.description).unwrap_or_else(|| transcript.clone()),
            ),
            urgency: Some(
                voice::non_blank(fields.urgency).unwrap_or_else(|| DEFAULT_URGENCY.to_string()),
            ),
        };

        let token = generate_token();
        let mut payload = Map::new();
        payload.insert(TOKEN_KEY.to_string(), json!(token));
        payload.insert("channel".to_string(), json!(ComplaintChannel::Voice.as_str()));
        insert_opt(&mut payload, "name", resolved.name.clone());
        insert_opt(&mut payload, "phone", resolved.phone.clone());
        insert_opt(&mut payload, "location", resolved.location.clone());
        insert_opt(&mut payload, "department", resolved.department.clone());
        insert_opt(&mut payload, "description", resolved.description.clone());
        insert_opt(&mut payload, "urgency", resolved.urgency.clone());
        payload.insert("transcript".to_string(), json!(transcript));
        payload.insert("audio_path".to_string(), json!(audio.display().to_string()));

        let submission = self.save_new(RecordKind::Complaint, payload, token)?;
        Ok(VoiceSubmission { submission, transcript, extracted_fields: resolved })
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when neither store holds `id`, and
    /// [`ApiError::Validation`] when the status does not fit the record kind.
    pub fn update_status(&self, id: &str, status: RecordStatus) -> Result<StatusChange, ApiError> {
        let id = RecordId::parse(id)?;
        match self.coordinator.update_status(&id, status)? {
            UpdateOutcome::Updated { location } => {
                Ok(StatusChange { id, status, storage: location })
            }
            UpdateOutcome::NotFound => Err(ApiError::NotFound(id)),
        }
    }

    /// Moves a pickup request along its lifecycle. Notes are appended to the request history;
    /// confirmation details are recorded when the status becomes `Confirmed`.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] for unknown ids and [`ApiError::Validation`] when the id is
    /// not a pickup or the status is not a pickup status.
    pub fn update_pickup_status(
        &self,
        id: &str,
        update: PickupStatusUpdate,
    ) -> Result<StatusChange, ApiError> {
        let id = RecordId::parse(id)?;
        if !RecordKind::Pickup.allows(update.status) {
            return Err(ApiError::Validation(format!(
                "invalid pickup status {:?}",
                update.status.as_str()
            )));
        }
        let lookup = self.reader.get(&id)?.ok_or_else(|| ApiError::NotFound(id.clone()))?;
        if lookup.record.kind != RecordKind::Pickup {
            return Err(ApiError::Validation(format!("{id} is not a pickup request")));
        }

        let now = OffsetDateTime::now_utc();
        let mut patch = RecordPatch::status(update.status);
        if let Some(text) = voice::non_blank(update.notes) {
            let mut notes = match lookup.record.payload.get("notes") {
                Some(Value::Array(existing)) => existing.clone(),
                _ => Vec::new(),
            };
            notes.push(json!({
                "text": text,
                "timestamp": timestamp(now),
                "status": update.status.as_str(),
            }));
            patch.payload.insert("notes".to_string(), Value::Array(notes));
        }
        if update.status == RecordStatus::Confirmed {
            insert_opt(&mut patch.payload, "pickup_date", update.pickup_date);
            insert_opt(&mut patch.payload, "pickup_time", update.pickup_time);
            insert_opt(&mut patch.payload, "assigned_driver", update.assigned_driver);
        }

        match self.coordinator.update(&id, &patch)? {
            UpdateOutcome::Updated { location } => {
                Ok(StatusChange { id, status: update.status, storage: location })
            }
            UpdateOutcome::NotFound => Err(ApiError::NotFound(id)),
        }
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when neither store holds `id`.
    pub fn get(&self, id: &str) -> Result<Lookup, ApiError> {
        let id = RecordId::parse(id)?;
        self.reader.get(&id)?.ok_or(ApiError::NotFound(id))
    }

    /// # Errors
    /// Returns [`ApiError::Fallback`] when the primary store is down and the local log cannot be
    /// read.
    pub fn list_all(&self) -> Result<Listing, ApiError> {
        Ok(self.reader.list_all()?)
    }

    /// # Errors
    /// Returns [`ApiError::Fallback`] when the primary store is down and the local log cannot be
    /// read.
    pub fn list(&self, filter: &RecordFilter, page: Page) -> Result<PagedListing, ApiError> {
        Ok(self.reader.list(filter, page)?)
    }

    /// Free-text search over pickup requests, capped at [`PICKUP_SEARCH_LIMIT`] hits.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for a blank query.
    pub fn search_pickups(&self, query: &str) -> Result<PagedListing, ApiError> {
        if query.trim().is_empty() {
            return Err(ApiError::Validation("search query is required".to_string()));
        }
        let filter = RecordFilter {
            kind: Some(RecordKind::Pickup),
            search: Some(query.to_string()),
            ..RecordFilter::default()
        };
        let page = Page::new(1, PICKUP_SEARCH_LIMIT)?;
        Ok(self.reader.list(&filter, page)?)
    }

    /// # Errors
    /// Returns [`ApiError::Fallback`] when the primary store is down and the local log cannot be
    /// read.
    pub fn pickup_stats(&self) -> Result<PickupStats, ApiError> {
        let listing = self.reader.find_all(&RecordFilter::kind(RecordKind::Pickup))?;
        Ok(PickupStats::from_records(&listing.records, OffsetDateTime::now_utc(), listing.source))
    }

    /// # Errors
    /// Returns [`ApiError::Fallback`] when the local log cannot be read.
    pub fn reconcile(&self) -> Result<ReconcileSummary, ApiError> {
        Ok(self.reconciler.sync()?)
    }

    /// # Errors
    /// Returns [`ApiError::Fallback`] when the local log cannot be read.
    pub fn fallback_stats(&self) -> Result<LogStats, ApiError> {
        Ok(self.log.stats()?)
    }

    /// Local log entries including their sync envelopes.
    ///
    /// # Errors
    /// Returns [`ApiError::Fallback`] when the local log cannot be read.
    pub fn fallback_entries(&self) -> Result<Vec<LogEntry>, ApiError> {
        Ok(self.log.entries()?)
    }

    fn save_new(
        &self,
        kind: RecordKind,
        payload: Map<String, Value>,
        token: String,
    ) -> Result<Submission, ApiError> {
        let created_at = OffsetDateTime::now_utc();
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let record = Record::new(kind.generate_id(), kind, payload.clone(), created_at);
            match self.coordinator.save(&record) {
                Ok(outcome) => {
                    let degraded = outcome.location == StorageLocation::Fallback;
                    let message = if degraded {
                        "Submission saved locally; it will be synced to the database later"
                    } else {
                        "Submission registered"
                    };
                    return Ok(Submission {
                        id: outcome.id,
                        token,
                        kind,
                        status: record.status,
                        storage: outcome.location,
                        degraded,
                        message: message.to_string(),
                    });
                }
                Err(SaveError::Duplicate(id)) => {
                    tracing::debug!("generated id {id} is taken (attempt {attempt}), retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ApiError::IdsExhausted(kind.as_str()))
    }
}

fn require_fields(fields: &[(&str, &String)]) -> Result<(), ApiError> {
    let missing = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(format!("missing required fields: {}", missing.join(", "))))
    }
}

fn insert_opt<T: Into<Value>>(payload: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        payload.insert(key.to_string(), value.into());
    }
}

fn timestamp(now: OffsetDateTime) -> String {
    now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string())
}
