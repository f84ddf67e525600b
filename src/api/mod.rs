//! HTTP control API.
//!
//! Thin JSON layer over the [`Dispatcher`] plus a content-addressed store
//! for template archives. Job events stream as newline-delimited JSON.

pub mod files;

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::ProvisionerError;
use crate::scheduler::{ArchiveRef, Dispatcher, JobKind, ParameterValue, SubmitJob};

pub use files::FileStore;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub files: Arc<FileStore>,
}

impl ApiState {
    /// State whose archive store enforces the dispatcher's size limit.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let files = Arc::new(FileStore::new(dispatcher.config().max_archive_bytes));
        Self { dispatcher, files }
    }

    /// Remove archives that no tracked job references and that were
    /// uploaded more than `job_retention` ago. Returns the number removed.
    pub async fn collect_archives(&self) -> usize {
        let referenced: HashSet<String> = self
            .dispatcher
            .list_jobs()
            .await
            .into_iter()
            .map(|job| job.input.archive.hash)
            .collect();
        let retention = chrono::Duration::from_std(self.dispatcher.config().job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let removed = self
            .files
            .remove_unreferenced(&referenced, chrono::Utc::now() - retention)
            .await;
        if removed > 0 {
            tracing::debug!(removed, "Removed unreferenced archives");
        }
        removed
    }
}

/// Sweep unreferenced archives every `gc_interval` until `shutdown` fires.
pub async fn run_archive_gc(state: ApiState, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(state.dispatcher.config().gc_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                state.collect_archives().await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    kind: JobKind,
    archive_hash: String,
    #[serde(default)]
    parameters: Vec<ParameterValue>,
    #[serde(default)]
    required_tags: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    from: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// A [`ProvisionerError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ProvisionerError);

impl From<ProvisionerError> for ApiError {
    fn from(e: ProvisionerError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ProvisionerError::InvalidInput(_) | ProvisionerError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            ProvisionerError::JobNotFound(_) | ProvisionerError::WorkerNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ProvisionerError::ArchiveTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProvisionerError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ProvisionerError::Channel(_) | ProvisionerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Leave room above the archive limit so oversized uploads reach the
    // store and get a descriptive error.
    let body_limit = usize::try_from(state.files.max_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    Router::new()
        .route("/api/files", post(upload_file_handler))
        .route("/api/files/{hash}", get(download_file_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/jobs/{id}/events", get(job_events_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/{id}", delete(deregister_worker_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting control API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn upload_file_handler(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let archive = state.files.put(body).await?;
    Ok((StatusCode::CREATED, Json(archive)))
}

async fn download_file_handler(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Response {
    match state.files.get(&hash).await {
        Some(data) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Archive not found: {}", hash),
            }),
        )
            .into_response(),
    }
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> ApiResult<impl IntoResponse> {
    let size_bytes = state
        .files
        .size_of(&payload.archive_hash)
        .await
        .ok_or_else(|| {
            ProvisionerError::InvalidInput(format!("unknown archive: {}", payload.archive_hash))
        })?;

    let job_id = state
        .dispatcher
        .submit_job(SubmitJob {
            kind: payload.kind,
            archive: ArchiveRef {
                hash: payload.archive_hash,
                size_bytes,
            },
            parameters: payload.parameters,
            required_tags: payload.required_tags,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.dispatcher.list_jobs().await)
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.get_job(id).await?))
}

async fn job_events_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Response> {
    let events = state.dispatcher.stream_events(id, query.from).await?;
    let body = events.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.dispatcher.cancel_job(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_workers_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.dispatcher.list_workers().await)
}

async fn deregister_worker_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.dispatcher.deregister(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
