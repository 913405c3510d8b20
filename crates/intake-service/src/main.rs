use std::fs;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use intake_api::{
    ApiError, IntakeApi, IntakeConfig, PagedListing, PickupStats, PickupStatusUpdate,
    ReconcileSummary, StatusChange, SubmitComplaintRequest, SubmitPickupRequest, Submission,
    API_CONTRACT_VERSION,
};
use intake_core::{
    Page, Record, RecordFilter, RecordKind, RecordStatus, DEFAULT_PAGE_LIMIT, TOKEN_KEY,
};
use intake_fallback::LogStats;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const UNAVAILABLE_MESSAGE: &str = "storage is temporarily unavailable, try again later";

#[derive(Clone)]
struct ServiceState {
    api: IntakeApi,
    admin_token: Option<Arc<str>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    degraded: bool,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    primary_available: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusRequest {
    status: RecordStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListQuery {
    kind: Option<RecordKind>,
    status: Option<RecordStatus>,
    search: Option<String>,
    created_from: Option<String>,
    created_to: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Parser)]
#[command(name = "intake-service")]
#[command(about = "HTTP intake service with a local fallback log")]
struct Args {
    /// YAML config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    primary_db: Option<PathBuf>,
    #[arg(long)]
    fallback_log: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long)]
    admin_token: Option<String>,
    /// Seconds between background reconciliation runs; `0` disables the timer.
    #[arg(long)]
    reconcile_interval_secs: Option<u64>,
}

impl Args {
    fn resolve_config(&self) -> Result<IntakeConfig> {
        let mut config = IntakeConfig::load(self.config.as_deref())?;
        if let Some(path) = &self.primary_db {
            config.primary_db.clone_from(path);
        }
        if let Some(path) = &self.fallback_log {
            config.fallback_log.clone_from(path);
        }
        if let Some(token) = &self.admin_token {
            config.admin_token = Some(token.clone());
        }
        if let Some(secs) = self.reconcile_interval_secs {
            config.reconcile_interval_secs = secs;
        }
        Ok(config)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        if err.is_unavailable() {
            tracing::error!("request failed, storage unavailable: {err}");
            return ServiceState::error(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_MESSAGE);
        }
        let status = match &err {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            err if err.is_invalid_request() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ServiceState::error(status, err.to_string())
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

fn envelope<T>(data: T, degraded: bool) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        degraded,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    let admin = Router::new()
        .route("/v1/records", get(record_list))
        .route("/v1/records/:id/status", put(record_status_update))
        .route("/v1/pickups/:id/status", put(pickup_status_update))
        .route("/v1/admin/reconcile", post(admin_reconcile))
        .route("/v1/admin/fallback", get(admin_fallback_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/complaints", post(complaint_submit))
        .route("/v1/pickups", post(pickup_submit))
        .route("/v1/pickups/search", get(pickup_search))
        .route("/v1/pickups/stats", get(pickup_stats))
        .route("/v1/records/:id", get(record_show))
        .merge(admin)
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// The fallback log never creates directories itself.
fn prepare_fallback_dir(path: &FsPath) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create fallback directory {}", parent.display()))?;
    }
    Ok(())
}

fn spawn_reconcile_timer(api: IntakeApi, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let api = api.clone();
            match tokio::task::spawn_blocking(move || api.reconcile()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!("scheduled reconcile failed: {err}"),
                Err(err) => tracing::error!("scheduled reconcile task aborted: {err}"),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.resolve_config()?;
    prepare_fallback_dir(&config.fallback_log)?;

    let api = IntakeApi::from_config(&config);
    if let Some(every) = config.reconcile_interval() {
        spawn_reconcile_timer(api.clone(), every);
    }
    if config.admin_token.is_none() {
        tracing::warn!("no admin token configured, admin routes are open");
    }

    let state = ServiceState { api, admin_token: config.admin_token.map(Arc::from) };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(
        "listening on {} (primary {}, fallback {})",
        args.bind,
        config.primary_db.display(),
        config.fallback_log.display()
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn require_admin(State(state): State<ServiceState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => next.run(request).await,
        Some(_) => ServiceState::error(StatusCode::FORBIDDEN, "invalid admin token").into_response(),
        None => {
            ServiceState::error(StatusCode::UNAUTHORIZED, "admin token required").into_response()
        }
    }
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let primary_available = state.api.primary_available();
    Json(envelope(HealthResponse { status: "ok", primary_available }, !primary_available))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn complaint_submit(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitComplaintRequest>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Submission>>), ServiceError> {
    let submission = state.api.submit_complaint(request)?;
    let degraded = submission.degraded;
    Ok((StatusCode::CREATED, Json(envelope(submission, degraded))))
}

async fn pickup_submit(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitPickupRequest>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Submission>>), ServiceError> {
    let submission = state.api.submit_pickup(request)?;
    let degraded = submission.degraded;
    Ok((StatusCode::CREATED, Json(envelope(submission, degraded))))
}

async fn record_show(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let mut lookup = state.api.get(&id)?;
    lookup.record.payload.remove(TOKEN_KEY);
    Ok(Json(envelope(lookup.record, lookup.source.degraded())))
}

async fn record_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<PagedListing>>, ServiceError> {
    let filter = RecordFilter {
        kind: query.kind,
        status: query.status,
        search: query.search,
        created_from: parse_instant("created_from", query.created_from.as_deref())?,
        created_to: parse_instant("created_to", query.created_to.as_deref())?,
    };
    let page = Page::new(query.page.unwrap_or(1), query.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .map_err(ApiError::from)?;
    let listing = state.api.list(&filter, page)?;
    let degraded = listing.source.degraded();
    Ok(Json(envelope(strip_tokens(listing), degraded)))
}

async fn record_status_update(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<ServiceEnvelope<StatusChange>>, ServiceError> {
    let change = state.api.update_status(&id, request.status)?;
    Ok(Json(envelope(change, false)))
}

async fn pickup_status_update(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(request): Json<PickupStatusUpdate>,
) -> Result<Json<ServiceEnvelope<StatusChange>>, ServiceError> {
    let change = state.api.update_pickup_status(&id, request)?;
    Ok(Json(envelope(change, false)))
}

async fn pickup_search(
    State(state): State<ServiceState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ServiceEnvelope<PagedListing>>, ServiceError> {
    let listing = state.api.search_pickups(&query.q)?;
    let degraded = listing.source.degraded();
    Ok(Json(envelope(strip_tokens(listing), degraded)))
}

async fn pickup_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<PickupStats>>, ServiceError> {
    let stats = state.api.pickup_stats()?;
    let degraded = stats.source.degraded();
    Ok(Json(envelope(stats, degraded)))
}

async fn admin_reconcile(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReconcileSummary>>, ServiceError> {
    let api = state.api.clone();
    let summary = tokio::task::spawn_blocking(move || api.reconcile())
        .await
        .map_err(|err| ServiceState::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;
    Ok(Json(envelope(summary, false)))
}

async fn admin_fallback_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<LogStats>>, ServiceError> {
    let stats = state.api.fallback_stats()?;
    Ok(Json(envelope(stats, false)))
}

fn parse_instant(field: &str, raw: Option<&str>) -> Result<Option<OffsetDateTime>, ServiceError> {
    raw.map(|raw| {
        OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
            ServiceState::error(
                StatusCode::BAD_REQUEST,
                format!("{field} must be an RFC 3339 timestamp: {err}"),
            )
        })
    })
    .transpose()
}

fn strip_tokens(mut listing: PagedListing) -> PagedListing {
    for record in &mut listing.records {
        record.payload.remove(TOKEN_KEY);
    }
    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request as HttpRequest;
    use intake_fallback::FallbackLog;
    use intake_store_sqlite::{SqlitePrimary, DEFAULT_BUSY_TIMEOUT};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn unique_temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("intake-service-{}", ulid::Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp dir: {err}");
        }
        dir
    }

    fn state_in(dir: &FsPath, primary_up: bool, admin_token: Option<&str>) -> ServiceState {
        let db_path = if primary_up {
            dir.join("primary.sqlite3")
        } else {
            dir.join("offline").join("primary.sqlite3")
        };
        let api = IntakeApi::new(
            Arc::new(SqlitePrimary::new(db_path, DEFAULT_BUSY_TIMEOUT)),
            FallbackLog::new(dir.join("fallback.json")),
            Duration::ZERO,
        );
        ServiceState { api, admin_token: admin_token.map(Arc::from) }
    }

    async fn send(router: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => (status, value),
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn admin_get(uri: &str, token: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .method("GET")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn json_request(method: &str, uri: &str, body: &Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn complaint_body() -> Value {
        json!({
            "name": "Asha Verma",
            "location": "Ward 12, Lake Road",
            "description": "Overflowing garbage bin",
            "department": "Sanitation",
            "urgency": "High",
            "latitude": 12.97,
            "longitude": 77.59
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, true, None));

        let (status, value) = send(&router, get_request("/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["service_contract_version"], json!(SERVICE_CONTRACT_VERSION));
        assert_eq!(value["data"]["primary_available"], json!(true));
        assert!(value.get("degraded").is_none());

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, true, None));

        let response = match router.oneshot(get_request("/v1/openapi")).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/complaints"));
        assert!(body.contains("/v1/admin/reconcile"));

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn complaint_submit_show_and_list_flow() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, true, Some("s3cret")));

        let (status, created) =
            send(&router, json_request("POST", "/v1/complaints", &complaint_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["storage"], json!("primary"));
        assert!(created.get("degraded").is_none());
        let id = created["data"]["id"]
            .as_str()
            .unwrap_or_else(|| panic!("missing data.id in {created}"))
            .to_string();

        let (status, shown) = send(&router, get_request(&format!("/v1/records/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shown["data"]["name"], json!("Asha Verma"));
        assert_eq!(shown["data"]["status"], json!("Pending"));
        assert!(shown["data"].get("token").is_none());

        let listing = "/v1/records?kind=complaint&search=garbage&limit=5";
        let (status, _) = send(&router, get_request(listing)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, listed) = send(&router, admin_get(listing, "s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"]["total"], json!(1));
        assert_eq!(listed["data"]["records"][0]["id"], json!(id));

        let token = created["data"]["token"]
            .as_str()
            .unwrap_or_else(|| panic!("missing data.token in {created}"));
        let (status, by_token) =
            send(&router, admin_get(&format!("/v1/records?search={token}"), "s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_token["data"]["total"], json!(0));

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn primary_outage_is_reported_as_degraded() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, false, Some("s3cret")));

        let (status, created) =
            send(&router, json_request("POST", "/v1/complaints", &complaint_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["degraded"], json!(true));
        assert_eq!(created["data"]["storage"], json!("fallback"));

        let (status, listed) = send(&router, admin_get("/v1/records", "s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["degraded"], json!(true));
        assert_eq!(listed["data"]["source"], json!("fallback"));
        assert!(listed["data"]["records"][0].get("_sync_status").is_none());

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn request_errors_map_to_status_codes() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, true, None));

        let (status, value) =
            send(&router, json_request("POST", "/v1/complaints", &json!({"name": "Asha"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value["error"].as_str().is_some_and(|error| error.contains("location")));

        let (status, _) = send(&router, get_request("/v1/records/999999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, get_request("/v1/records?limit=500")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, get_request("/v1/records?created_from=yesterday")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn both_stores_down_returns_service_unavailable() {
        let dir = unique_temp_dir();
        let api = IntakeApi::new(
            Arc::new(SqlitePrimary::new(dir.join("offline").join("db.sqlite3"), DEFAULT_BUSY_TIMEOUT)),
            FallbackLog::new(dir.join("offline").join("fallback.json")),
            Duration::ZERO,
        );
        let router = app(ServiceState { api, admin_token: None });

        let (status, value) =
            send(&router, json_request("POST", "/v1/complaints", &complaint_body())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(value["error"], json!(UNAVAILABLE_MESSAGE));

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn admin_routes_require_bearer_token() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, true, Some("s3cret")));

        let (status, _) = send(&router, json_request("POST", "/v1/admin/reconcile", &json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = HttpRequest::builder()
            .uri("/v1/admin/fallback")
            .method("GET")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let (status, _) = send(&router, wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let authorized = HttpRequest::builder()
            .uri("/v1/admin/reconcile")
            .method("POST")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let (status, value) = send(&router, authorized).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["synced_count"], json!(0));

        let (status, _) = send(&router, get_request("/v1/health")).await;
        assert_eq!(status, StatusCode::OK);

        let _ = fs::remove_dir_all(dir);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn pickup_submit_confirm_and_stats_flow() {
        let dir = unique_temp_dir();
        let router = app(state_in(&dir, true, None));

        let body = json!({
            "name": "Meena Iyer",
            "phone": "9876543210",
            "address": "14 Temple Street",
            "materials": ["Plastic", "Glass"],
            "preferred_date": "2026-10-21",
            "preferred_time": "10:00"
        });
        let (status, created) = send(&router, json_request("POST", "/v1/pickups", &body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["data"]["id"]
            .as_str()
            .unwrap_or_else(|| panic!("missing data.id in {created}"))
            .to_string();

        let confirm = json!({"status": "Confirmed", "notes": "Truck 2", "assigned_driver": "Ravi"});
        let (status, changed) = send(
            &router,
            json_request("PUT", &format!("/v1/pickups/{id}/status"), &confirm),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(changed["data"]["status"], json!("Confirmed"));

        let (status, hits) = send(&router, get_request("/v1/pickups/search?q=temple")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hits["data"]["total"], json!(1));

        let (status, stats) = send(&router, get_request("/v1/pickups/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["data"]["by_status"]["Confirmed"], json!(1));
        assert_eq!(stats["data"]["materials"]["Glass"], json!(1));

        let _ = fs::remove_dir_all(dir);
    }
}
