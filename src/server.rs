//! HTTP ingestion server.
//!
//! Harvesters register, fetch their configuration and send every report
//! through this JSON API. Operators use the file endpoints to inspect a
//! file and trigger a reimport.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/harvesters` | Register a harvester, returns its API key |
//! | `GET`  | `/harvesters/{id}/config` | Harvester configuration |
//! | `POST` | `/harvesters/{id}/report` | Submit one report |
//! | `GET`  | `/files/{id}` | File detail with columns and last error |
//! | `POST` | `/files/{id}/reimport` | Clear a file's data and force RETRY_IMPORT |
//!
//! Harvester endpoints require `Authorization: Harvester <api_key>`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_transition", "message": "cannot begin import of ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `invalid_transition` (409), `type_mismatch` (422), `internal` (500). A chunk
//! that failed ingestion answers with `import_failed` and the status of the
//! underlying error; the file is already IMPORT_FAILED with the error recorded.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use cycler_harvest_core::error::ReportError;
use cycler_harvest_core::handler::{self, FileDetail};
use cycler_harvest_core::models::{Harvester, ObservedFile};
use cycler_harvest_core::store::Store;
use cycler_harvest_core::wire::{
    HarvesterConfig, RegisterRequest, RegisterResponse, Report, ReportResponse,
};

use crate::config::Config;
use crate::db;
use crate::migrate::migrate_pool;
use crate::sqlite_store::SqliteStore;

/// Room above `max_upload_bytes` for headers of the JSON body itself.
const BODY_SLACK_BYTES: usize = 16 * 1024;

/// Scheme prefix of the `Authorization` header harvesters send.
pub const AUTH_SCHEME: &str = "Harvester";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub sleep_time: u64,
    pub max_upload_bytes: usize,
}

/// Build the router over an arbitrary store.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.max_upload_bytes + BODY_SLACK_BYTES;

    Router::new()
        .route("/health", get(handle_health))
        .route("/harvesters", post(handle_register))
        .route("/harvesters/{id}/config", get(handle_config))
        .route("/harvesters/{id}/report", post(handle_report))
        .route("/files/{id}", get(handle_file))
        .route("/files/{id}/reimport", post(handle_reimport))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Starts the ingestion server on `[server].bind`, migrating the database first.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let state = AppState {
        store: Arc::new(SqliteStore::new(pool)),
        sleep_time: config.server.sleep_time,
        max_upload_bytes: config.server.max_upload_bytes,
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    log::info!(
        "ingestion server listening on http://{} (max upload {} bytes)",
        config.server.bind,
        config.server.max_upload_bytes
    );
    axum::serve(listener, router(state)).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ReportError> for AppError {
    fn from(err: ReportError) -> Self {
        if let ReportError::Storage(inner) = &err {
            log::error!("storage failure: {:#}", inner);
        }
        AppError {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

/// Resolve the harvester named in the path and check its API key.
async fn authenticate(state: &AppState, id: i64, headers: &HeaderMap) -> Result<Harvester, AppError> {
    let key = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(AUTH_SCHEME))
        .map(str::trim)
        .ok_or_else(|| unauthorized("missing 'Authorization: Harvester <key>' header"))?;
    let harvester = state
        .store
        .get_harvester(id)
        .await
        .map_err(ReportError::from)?
        .ok_or_else(|| unauthorized(format!("unknown harvester {}", id)))?;
    if harvester.api_key != key {
        return Err(unauthorized("API key does not match harvester"));
    }
    Ok(harvester)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /harvesters ============

async fn handle_register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, AppError> {
    let Json(request) = body?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let api_key = uuid::Uuid::new_v4().simple().to_string();
    let harvester = state
        .store
        .register_harvester(name, &api_key, Utc::now())
        .await
        .map_err(ReportError::from)?;
    log::info!("registered harvester {} ({})", harvester.id, harvester.name);
    Ok(Json(RegisterResponse {
        id: harvester.id,
        name: harvester.name,
        api_key,
    }))
}

// ============ GET /harvesters/{id}/config ============

async fn handle_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<HarvesterConfig>, AppError> {
    let harvester = authenticate(&state, id, &headers).await?;
    let config = handler::harvester_config(
        &*state.store,
        &harvester,
        state.sleep_time,
        state.max_upload_bytes,
    )
    .await?;
    Ok(Json(config))
}

// ============ POST /harvesters/{id}/report ============

async fn handle_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Result<Json<Report>, JsonRejection>,
) -> Result<Json<ReportResponse>, AppError> {
    let harvester = authenticate(&state, id, &headers).await?;
    let Json(report) = body?;
    let response = handler::handle_report(&*state.store, &harvester, &report, Utc::now()).await?;
    Ok(Json(response))
}

// ============ /files/{id} ============

async fn handle_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<FileDetail>, AppError> {
    Ok(Json(handler::file_detail(&*state.store, id).await?))
}

async fn handle_reimport(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ObservedFile>, AppError> {
    Ok(Json(handler::reimport(&*state.store, id).await?))
}
