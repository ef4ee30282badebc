//! HTTP API server.
//!
//! Exposes the document workflows over JSON. Built on `axum` with CORS and
//! request tracing from `tower-http`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents/upload` | Multipart upload (`file`, optional `processImmediately`) |
//! | `POST` | `/documents/{id}/analyze` | Run analysis now and return the updated record |
//! | `GET`  | `/documents/{id}` | Fetch a document record |
//! | `GET`  | `/documents/{id}/url` | Presigned download URL |
//! | `GET`  | `/documents/{id}/content` | Stream the raw file |
//! | `GET`  | `/health` | Health check |
//!
//! # Error Responses
//!
//! All errors use one envelope:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document ... not found" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `empty_content` | 400 |
//! | `extraction_failed` | 400 |
//! | `not_found` | 404 |
//! | `conflict` | 409 |
//! | `analysis_skipped` | 422 |
//! | `analysis_failed` | 502 |
//! | `internal` | 500 |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::analyzer::AnalyzeError;
use crate::config::Config;
use crate::extract::DocumentFormat;
use crate::models::Document;
use crate::service::{DocumentService, ServiceError};
use crate::storage::StorageError;
use crate::worker::AnalysisWorkers;

/// Multipart framing allowance on top of the file size limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// How long queued background analyses may run after shutdown is requested.
const WORKER_GRACE: Duration = Duration::from_secs(30);

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    service: Arc<DocumentService>,
    workers: Arc<AnalysisWorkers>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        service: Arc<DocumentService>,
        workers: Arc<AnalysisWorkers>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            service,
            workers,
            max_upload_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/documents/upload", post(handle_upload))
        .route("/documents/{id}", get(handle_get))
        .route("/documents/{id}/analyze", post(handle_analyze))
        .route("/documents/{id}/url", get(handle_url))
        .route("/documents/{id}/content", get(handle_content))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server and the background analysis pool.
///
/// Runs until Ctrl-C, then stops accepting connections and lets queued
/// analyses drain.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = crate::app::build_service(config).await?;
    let workers = AnalysisWorkers::start(service.clone(), &config.worker);
    let app = router(AppState::new(
        service,
        workers.clone(),
        config.server.max_upload_bytes,
    ));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "docai server listening");
    println!("docai listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    workers.shutdown(WORKER_GRACE).await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::UnsupportedFormat(_) => bad_request(message),
            ServiceError::EmptyContent => {
                AppError::new(StatusCode::BAD_REQUEST, "empty_content", message)
            }
            ServiceError::Extraction { .. } => {
                AppError::new(StatusCode::BAD_REQUEST, "extraction_failed", message)
            }
            ServiceError::NotFound(_) | ServiceError::Storage(StorageError::NotFound(_)) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            ServiceError::AlreadyProcessing(_)
            | ServiceError::StatusConflict { .. }
            | ServiceError::ConcurrentUpdate(_)
            | ServiceError::InvalidTransition { .. } => {
                AppError::new(StatusCode::CONFLICT, "conflict", message)
            }
            ServiceError::AnalysisSkipped(_) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "analysis_skipped", message)
            }
            ServiceError::Analysis(
                AnalyzeError::Completion(_) | AnalyzeError::MalformedResponse { .. },
            ) => {
                tracing::warn!(error = %message, "analysis failed");
                AppError::new(StatusCode::BAD_GATEWAY, "analysis_failed", message)
            }
            other => {
                tracing::error!(error = %other, "request failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        tracing::debug!(id = raw, "rejecting malformed document id");
        bad_request("Invalid document ID format")
    })
}

// ============ POST /documents/upload ============

struct UploadForm {
    filename: String,
    content_type: String,
    data: Bytes,
    process_immediately: bool,
}

async fn read_upload_form(mut multipart: Multipart, max_bytes: usize) -> Result<UploadForm, AppError> {
    let too_large = || bad_request(format!("File too large (max {} bytes)", max_bytes));
    let form_error = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            too_large()
        } else {
            tracing::debug!(error = %e, "malformed multipart body");
            bad_request(format!("Failed to parse form: {}", e.body_text()))
        }
    };

    let mut file = None;
    let mut process_immediately = false;

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        match field.name() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(base_name)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| bad_request("File is required"))?;
                let content_type = field.content_type().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(form_error)?;
                file = Some((filename, content_type, data));
            }
            Some("processImmediately") => {
                process_immediately = field.text().await.map_err(form_error)?.trim() == "true";
            }
            _ => {}
        }
    }

    let (filename, content_type, data) = file.ok_or_else(|| bad_request("File is required"))?;
    if data.len() > max_bytes {
        return Err(too_large());
    }

    Ok(UploadForm {
        filename,
        content_type,
        data,
        process_immediately,
    })
}

/// Strip any client-side directory components from an uploaded filename.
fn base_name(raw: &str) -> String {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim().to_string()
}

async fn handle_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Document>, AppError> {
    let form = read_upload_form(multipart, state.max_upload_bytes).await?;

    if DocumentFormat::from_filename(&form.filename).is_none() {
        tracing::debug!(filename = %form.filename, "rejecting unsupported file type");
        return Err(bad_request("File type not supported"));
    }

    // The workflow runs in its own task so that a client disconnect cancels
    // it through the guard instead of dropping it midway.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let service = state.service.clone();
    let UploadForm {
        filename,
        content_type,
        data,
        process_immediately,
    } = form;
    let task = tokio::spawn(async move {
        service
            .upload_document(&filename, &data[..], &content_type, &cancel)
            .await
    });
    let joined = task.await;
    guard.disarm();
    let doc = joined.map_err(ServiceError::from)??;

    if process_immediately {
        let (doc, _) = state.workers.submit(doc).await;
        return Ok(Json(doc));
    }
    Ok(Json(doc))
}

// ============ /documents/{id} ============

async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.get_document(id).await?))
}

async fn handle_analyze(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let id = parse_id(&id)?;
    let doc = state
        .service
        .analyze_document(id, &CancellationToken::new())
        .await?;
    Ok(Json(doc))
}

#[derive(Serialize)]
struct UrlResponse {
    url: String,
}

async fn handle_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UrlResponse>, AppError> {
    let id = parse_id(&id)?;
    let url = state.service.get_document_url(id).await?;
    Ok(Json(UrlResponse { url }))
}

async fn handle_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let (doc, stream) = state.service.open_document_content(id).await?;
    Ok((
        [(header::CONTENT_TYPE, doc.content_type)],
        Body::from_stream(stream),
    )
        .into_response())
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
