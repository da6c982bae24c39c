//! Local web UI and JSON API
//!
//! Handlers only translate between HTTP and the [`JobEngine`]: job starts
//! return `{"status":"started"}` straight away and the page polls
//! `/api/status` for progress.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthStatus};
use crate::config::JobsConfig;
use crate::engine::{
    DeleteRequest, DownloadRequest, JobEngine, MarkReadRequest, ScanPurpose, ScanRequest,
};
use crate::error::GmailError;
use crate::filters::FilterSpec;
use crate::models::{CountLimit, JobKind, SenderSummary, UnsubscribeTarget};
use crate::progress::JobStatus;
use crate::unsubscribe::UnsubscribeOutcome;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    engine: JobEngine,
    jobs: JobsConfig,
    token_cache_path: PathBuf,
    /// Job starts and sign-out both hold this lock while touching the slot
    signed_out: Arc<Mutex<bool>>,
}

impl AppState {
    pub fn new(engine: JobEngine, jobs: JobsConfig, token_cache_path: PathBuf) -> Self {
        Self {
            engine,
            jobs,
            token_cache_path,
            signed_out: Arc::new(Mutex::new(false)),
        }
    }

    pub fn engine(&self) -> &JobEngine {
        &self.engine
    }

    pub fn is_signed_out(&self) -> bool {
        *self.session()
    }

    fn session(&self) -> MutexGuard<'_, bool> {
        self.signed_out.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a job unless the session is signed out
    fn start_job<F>(&self, start: F) -> ApiResult<Json<Started>>
    where
        F: FnOnce(&JobEngine) -> crate::error::Result<Uuid>,
    {
        let signed_out = self.session();
        if *signed_out {
            return Err(GmailError::AuthError(
                "signed out; run `gmail-bulk auth` and restart the server".to_string(),
            )
            .into());
        }
        start(&self.engine)?;
        Ok(started())
    }

    /// Reset the slot and mark the session signed out
    ///
    /// # Errors
    /// `JobAlreadyRunning` while a job holds the slot; nothing changes.
    fn claim_sign_out(&self) -> ApiResult<()> {
        let mut signed_out = self.session();
        let store = self.engine.store();
        if !store.reset() {
            let running = store.status().kind.unwrap_or(JobKind::Scan);
            return Err(GmailError::JobAlreadyRunning { running }.into());
        }
        *signed_out = true;
        Ok(())
    }
}

/// Error body returned by every failing handler: `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(GmailError);

impl From<GmailError> for ApiError {
    fn from(err: GmailError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(GmailError::InvalidRequest(rejection.body_text()))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GmailError::JobAlreadyRunning { .. } => StatusCode::CONFLICT,
            GmailError::InvalidFilter(_) | GmailError::InvalidRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            GmailError::AuthError(_) => StatusCode::UNAUTHORIZED,
            GmailError::Unsubscribe(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected ({}): {}", status, self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections come back as 422 in the usual error shape
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(Debug, Serialize)]
struct Started {
    status: &'static str,
}

fn started() -> Json<Started> {
    Json(Started { status: "started" })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ScanBody {
    limit: Option<u64>,
    filters: FilterSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MarkReadBody {
    count: Option<CountLimit>,
    filters: FilterSpec,
}

#[derive(Debug, Deserialize)]
struct DeleteOneBody {
    sender: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeleteBulkBody {
    senders: Vec<String>,
    filters: FilterSpec,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeBulkBody {
    targets: Vec<UnsubscribeTarget>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DownloadBody {
    senders: Vec<String>,
    filters: FilterSpec,
    limit: Option<u64>,
}

/// `{"success": bool, "error"?: ..., "outcome"?: ...}`
#[derive(Debug, Serialize)]
struct UnsubscribeResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    outcome: Option<UnsubscribeOutcome>,
}

impl UnsubscribeResponse {
    fn no_link() -> Self {
        Self {
            success: false,
            error: Some("No link provided".to_string()),
            outcome: None,
        }
    }
}

impl From<UnsubscribeOutcome> for UnsubscribeResponse {
    fn from(outcome: UnsubscribeOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            error: None,
            outcome: Some(outcome),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStatus {
    #[serde(flatten)]
    status: JobStatus,
    csv_ready: bool,
    filename: Option<String>,
    rows: Option<u64>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(status_handler))
        .route("/api/results", get(results_handler))
        .route("/api/delete-scan-results", get(delete_scan_results_handler))
        .route("/api/download-status", get(download_status_handler))
        .route("/api/download-csv", get(download_csv_handler))
        .route("/api/unread-count", get(unread_count_handler))
        .route("/api/auth-status", get(auth_status_handler))
        .route("/api/scan", post(scan_handler))
        .route("/api/delete-scan", post(delete_scan_handler))
        .route("/api/mark-read", post(mark_read_handler))
        .route("/api/delete-emails", post(delete_one_handler))
        .route("/api/delete-emails-bulk", post(delete_bulk_handler))
        .route("/api/download-emails", post(download_handler))
        .route("/api/unsubscribe", post(unsubscribe_handler))
        .route("/api/unsubscribe-bulk", post(unsubscribe_bulk_handler))
        .route("/api/sign-out", post(sign_out_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until the process is stopped
pub async fn serve(state: AppState, addr: &str) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status_handler(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.engine.status())
}

async fn results_handler(State(state): State<AppState>) -> Json<Vec<SenderSummary>> {
    Json(state.engine.results().as_ref().clone())
}

async fn delete_scan_results_handler(State(state): State<AppState>) -> Json<Vec<SenderSummary>> {
    Json(state.engine.delete_scan_results().as_ref().clone())
}

async fn download_status_handler(State(state): State<AppState>) -> Json<DownloadStatus> {
    let export = state.engine.export();
    Json(DownloadStatus {
        status: state.engine.status(),
        csv_ready: export.is_some(),
        filename: export.as_ref().map(|e| e.filename.clone()),
        rows: export.as_ref().map(|e| e.rows),
    })
}

async fn download_csv_handler(State(state): State<AppState>) -> Response {
    let Some(export) = state.engine.export() else {
        return Json(json!({ "error": "No CSV data available" })).into_response();
    };

    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.filename),
            ),
        ],
        export.data.clone(),
    )
        .into_response()
}

async fn unread_count_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    if state.is_signed_out() {
        return Json(json!({ "error": "signed out" }));
    }
    match state.engine.unread_count().await {
        Ok(count) => Json(json!({ "count": count })),
        Err(e) => {
            warn!("Could not read unread count: {}", e);
            Json(json!({ "error": e.to_string() }))
        }
    }
}

async fn auth_status_handler(State(state): State<AppState>) -> Json<AuthStatus> {
    if state.is_signed_out() {
        return Json(AuthStatus::signed_out());
    }
    match state.engine.client().get_profile_email().await {
        Ok(email) => Json(AuthStatus {
            logged_in: true,
            email: Some(email),
        }),
        Err(e) => {
            warn!("Auth check failed: {}", e);
            Json(AuthStatus::signed_out())
        }
    }
}

fn start_scan(state: &AppState, body: ScanBody, purpose: ScanPurpose) -> ApiResult<Json<Started>> {
    let limit = body.limit.unwrap_or(state.jobs.default_scan_limit);
    state.start_job(|engine| {
        engine.start_scan(ScanRequest {
            limit,
            filters: body.filters,
            purpose,
        })
    })
}

async fn scan_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ScanBody>,
) -> ApiResult<Json<Started>> {
    start_scan(&state, body, ScanPurpose::Unsubscribe)
}

async fn delete_scan_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ScanBody>,
) -> ApiResult<Json<Started>> {
    start_scan(&state, body, ScanPurpose::Delete)
}

async fn mark_read_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<MarkReadBody>,
) -> ApiResult<Json<Started>> {
    let count = body
        .count
        .unwrap_or(CountLimit::Count(state.jobs.default_mark_read_count));
    state.start_job(|engine| {
        engine.start_mark_read(MarkReadRequest {
            count,
            filters: body.filters,
        })
    })
}

async fn delete_one_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<DeleteOneBody>,
) -> ApiResult<Json<Started>> {
    if body.sender.trim().is_empty() {
        return Err(GmailError::InvalidRequest("sender is required".to_string()).into());
    }
    state.start_job(|engine| {
        engine.start_delete(DeleteRequest {
            senders: vec![body.sender],
            filters: FilterSpec::default(),
        })
    })
}

async fn delete_bulk_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<DeleteBulkBody>,
) -> ApiResult<Json<Started>> {
    state.start_job(|engine| {
        engine.start_delete(DeleteRequest {
            senders: body.senders,
            filters: body.filters,
        })
    })
}

async fn download_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<DownloadBody>,
) -> ApiResult<Json<Started>> {
    let limit = body.limit.unwrap_or(state.jobs.max_count);
    state.start_job(|engine| {
        engine.start_download(DownloadRequest {
            senders: body.senders,
            filters: body.filters,
            limit,
        })
    })
}

async fn unsubscribe_handler(
    State(state): State<AppState>,
    ApiJson(target): ApiJson<UnsubscribeTarget>,
) -> ApiResult<Json<UnsubscribeResponse>> {
    if target.link.trim().is_empty() {
        return Ok(Json(UnsubscribeResponse::no_link()));
    }
    let outcome = state.engine.unsubscribe_single(&target).await?;
    Ok(Json(outcome.into()))
}

async fn unsubscribe_bulk_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<UnsubscribeBulkBody>,
) -> ApiResult<Json<Started>> {
    state.engine.start_unsubscribe_bulk(body.targets)?;
    Ok(started())
}

async fn sign_out_handler(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.claim_sign_out()?;
    let removed = auth::sign_out(&state.token_cache_path).await?;
    info!("Signed out (token cache removed: {})", removed);

    Ok(Json(json!({ "status": "signedOut", "tokenRemoved": removed })))
}
