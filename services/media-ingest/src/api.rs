use crate::config::ApiConfig;
use crate::models::{self, DerivativeSpec, IngestionJob};
use crate::object_store::StoreError;
use crate::pipeline::{IngestPipeline, IngestRequest, JobHandle, PipelineError};
use crate::tracker::TrackerError;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub presigned_url_expiry: Duration,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Returned when a job is accepted
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub job_id: Uuid,
    pub media_key: String,
    /// Where to poll for progress
    pub status_url: String,
}

impl From<&JobHandle> for AcceptedResponse {
    fn from(handle: &JobHandle) -> Self {
        Self {
            job_id: handle.job_id,
            media_key: handle.media_key.clone(),
            status_url: format!("/media/{}", handle.job_id),
        }
    }
}

/// Query parameters for uploads
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// Folder placed in front of the media key
    pub folder: Option<String>,
    /// Overrides the thumbnail bounding box
    pub thumbnail_width: Option<u32>,
    pub thumbnail_height: Option<u32>,
}

/// Query parameters for job lookups
#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    /// Include presigned URLs
    #[serde(default)]
    pub include_urls: bool,
}

/// Job snapshot with optional download URLs
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: IngestionJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<MediaUrls>,
}

/// Presigned URLs for an original and its derivatives
#[derive(Debug, Serialize)]
pub struct MediaUrls {
    pub original: Option<String>,
    /// Keyed by derivative kind
    pub derivatives: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

/// Delete response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub media_key: String,
    pub deleted: usize,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/media", post(upload_media))
        .route("/media/:id", get(get_job).delete(delete_media))
        .route("/media/:id/cancel", post(cancel_job))
        .route("/media/:id/retry", post(retry_job))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "media-ingest"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.pipeline.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "reason": "shutting_down"
            })),
        );
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "bucket": state.pipeline.store().bucket(),
            "running_jobs": state.pipeline.running_jobs()
        })),
    )
}

/// Accept an upload. Storing and generation continue in the background.
#[instrument(skip(state, headers, multipart))]
async fn upload_media(
    State(state): State<AppState>,
    Query(params): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let mut file: Option<(Bytes, String, Option<String>)> = None;
    let mut specs: Option<Vec<DerivativeSpec>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "Failed to read multipart body");
        api_error(e.status(), e.body_text(), "INVALID_MULTIPART")
    })? {
        let name = field.name().map(str::to_string);

        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field
                    .content_type()
                    .filter(|ct| *ct != "application/octet-stream")
                    .map(str::to_string)
                    .or_else(|| {
                        filename.as_deref().and_then(extension_of).map(|ext| {
                            models::get_content_type(&ext).to_string()
                        })
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());

                let data = field.bytes().await.map_err(|e| {
                    api_error(e.status(), e.body_text(), "INVALID_MULTIPART")
                })?;

                file = Some((data, content_type, filename));
            }
            Some("specs") => {
                let text = field.text().await.map_err(|e| {
                    api_error(e.status(), e.body_text(), "INVALID_MULTIPART")
                })?;
                let parsed = serde_json::from_str(&text).map_err(|e| {
                    api_error(
                        StatusCode::BAD_REQUEST,
                        format!("Invalid derivative specs: {}", e),
                        "INVALID_SPECS",
                    )
                })?;
                specs = Some(parsed);
            }
            _ => {}
        }
    }

    let (data, content_type, filename) = file.ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Missing file part".to_string(),
            "MISSING_FILE",
        )
    })?;

    let mut specs = specs.unwrap_or_else(|| state.pipeline.default_specs(&content_type));
    for spec in specs.iter_mut() {
        if let DerivativeSpec::Thumbnail(thumbnail) = spec {
            if let Some(width) = params.thumbnail_width {
                thumbnail.width = width;
            }
            if let Some(height) = params.thumbnail_height {
                thumbnail.height = height;
            }
        }
    }

    let acl = headers
        .get("acl")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let handle = state
        .pipeline
        .submit(IngestRequest {
            data,
            content_type,
            filename,
            folder: params.folder,
            acl,
            specs: Some(specs),
        })
        .map_err(pipeline_error)?;

    info!(job_id = %handle.job_id, media_key = %handle.media_key, "Upload accepted");

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(&handle))))
}

/// Get a job snapshot
#[instrument(skip(state))]
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<JobQuery>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.pipeline.job(parse_job_id(&id)?).map_err(pipeline_error)?;

    // Nothing left to link to once the media is deleted
    let urls = if params.include_urls && job.deleted_at.is_none() {
        Some(media_urls(&state, &job).await)
    } else {
        None
    };

    Ok(Json(JobResponse { job, urls }))
}

/// Delete an original and all its derivatives. The key is URL-encoded.
#[instrument(skip(state))]
async fn delete_media(
    State(state): State<AppState>,
    Path(media_key): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = state
        .pipeline
        .delete_media(&media_key)
        .await
        .map_err(pipeline_error)?;

    Ok(Json(DeleteResponse { media_key, deleted }))
}

/// Cancel a running job
#[instrument(skip(state))]
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<IngestionJob>> {
    let job = state
        .pipeline
        .cancel(parse_job_id(&id)?)
        .await
        .map_err(pipeline_error)?;

    Ok(Json(job))
}

/// Retry the failed derivatives of a finished job
#[instrument(skip(state))]
async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let handle = state
        .pipeline
        .resubmit(parse_job_id(&id)?)
        .await
        .map_err(pipeline_error)?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(&handle))))
}

/// Presign every stored object of a job. URLs that fail are left out.
async fn media_urls(state: &AppState, job: &IngestionJob) -> MediaUrls {
    let store = state.pipeline.store();
    let expiry = state.presigned_url_expiry;

    let original = match &job.media {
        Some(media) => match store.presign_get(&media.key, expiry).await {
            Ok(url) => Some(url),
            Err(e) => {
                error!(error = %e, key = %media.key, "Failed to generate presigned URL");
                None
            }
        },
        None => None,
    };

    let mut derivatives = BTreeMap::new();
    for artifact in &job.artifacts {
        let Some(location) = &artifact.location else {
            continue;
        };
        match store.presign_get(&location.key, expiry).await {
            Ok(url) => {
                derivatives.insert(artifact.kind.as_str().to_string(), url);
            }
            Err(e) => {
                error!(error = %e, key = %location.key, "Failed to generate presigned URL");
            }
        }
    }

    let expires_at = Utc::now()
        + chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::zero());

    MediaUrls {
        original,
        derivatives,
        expires_at,
    }
}

fn parse_job_id(id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid job id: {}", id),
            "INVALID_JOB_ID",
        )
    })
}

fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn api_error(status: StatusCode, error: String, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
}

fn pipeline_error(e: PipelineError) -> ApiError {
    let (status, code) = match &e {
        PipelineError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        PipelineError::Tracker(TrackerError::NotFound(_))
        | PipelineError::Store(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        PipelineError::NotRunning(_) => (StatusCode::CONFLICT, "NOT_RUNNING"),
        PipelineError::NotRetryable { .. } => (StatusCode::CONFLICT, "NOT_RETRYABLE"),
        PipelineError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        PipelineError::Store(_) => {
            error!(error = %e, "Store request failed");
            (StatusCode::BAD_GATEWAY, "STORE_ERROR")
        }
    };

    api_error(status, e.to_string(), code)
}

/// Start the media API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting media API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
