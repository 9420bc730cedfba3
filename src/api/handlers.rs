//! Handlers for the chunked upload endpoints
//!
//! Request/response bodies use the protocol's camelCase wire names.
//! Retryable failures on the upload and complete paths attach the
//! RecoveryController's decision as a `recovery` object so clients know
//! whether and when to retry.

use crate::auth::Principal;
use crate::bus::ProgressSink;
use crate::error::{Error, Result};
use crate::pipeline::PipelineSnapshot;
use crate::session::SessionSnapshot;
use crate::types::FileMetadata;
use crate::AppState;
use axum::{
    extract::{Multipart, Path, State},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// POST /init request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub tool_resource: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// POST /init response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub success: bool,
    pub file_id: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub session: InitSessionInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionInfo {
    pub start_time: DateTime<Utc>,
    pub temp_dir: String,
}

/// POST /upload/:fileId/:chunkIndex response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub success: bool,
    pub progress: f64,
    pub received_chunks: u32,
    pub total_chunks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_received: Option<bool>,
}

/// GET /resume/:fileId response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub file_id: String,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub progress: f64,
}

/// POST /complete/:fileId request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub final_path: Option<String>,
    #[serde(default)]
    pub tool_resource: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// POST /complete/:fileId response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    pub file_path: String,
    pub size: u64,
}

/// GET /status/:fileId response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineSnapshot>,
    /// Bus-retained state, still observable for a grace window after the
    /// session itself has been released
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known: Option<crate::bus::SessionInfo>,
}

/// POST /validate/:fileId response
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub valid: bool,
}

/// DELETE /:fileId response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

/// GET /health response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub active_pipelines: usize,
}

/// POST /init — create an upload session
pub async fn init_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<InitRequest>,
) -> Result<Json<InitResponse>> {
    let file_id = request
        .file_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("fileId is required".into()))?;
    let file_name = request
        .file_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("fileName is required".into()))?;
    let file_size = request
        .file_size
        .ok_or_else(|| Error::BadRequest("fileSize is required".into()))?;

    let metadata = FileMetadata {
        name: file_name,
        size: file_size,
        content_type: request.file_type,
        tool_resource: request.tool_resource,
        agent_id: request.agent_id,
    };

    let outcome = state.sessions.init(&principal, &file_id, metadata).await?;
    Ok(Json(InitResponse {
        success: true,
        file_id: outcome.file_id,
        total_chunks: outcome.total_chunks,
        chunk_size: outcome.chunk_size,
        session: InitSessionInfo {
            start_time: outcome.start_time,
            temp_dir: outcome.temp_dir.display().to_string(),
        },
    }))
}

/// POST /upload/:fileId/:chunkIndex — accept one chunk as multipart
pub async fn upload_chunk(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((file_id, chunk_index)): Path<(String, u32)>,
    mut multipart: Multipart,
) -> std::result::Result<Json<UploadChunkResponse>, Response> {
    let mut chunk = None;
    let mut client_digest = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("invalid multipart body: {}", e)).into_response())?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("chunk") => {
                chunk = Some(field.bytes().await.map_err(|e| {
                    Error::BadRequest(format!("failed to read chunk field: {}", e)).into_response()
                })?);
            }
            Some("chunkHash") => {
                client_digest = Some(field.text().await.map_err(|e| {
                    Error::BadRequest(format!("failed to read chunkHash field: {}", e))
                        .into_response()
                })?);
            }
            _ => {}
        }
    }
    let chunk = chunk.ok_or_else(|| {
        Error::BadRequest("multipart field 'chunk' is required".into()).into_response()
    })?;

    match state
        .sessions
        .upload_chunk(&principal, &file_id, chunk_index, chunk, client_digest)
        .await
    {
        Ok(outcome) => Ok(Json(UploadChunkResponse {
            success: true,
            progress: outcome.progress,
            received_chunks: outcome.received,
            total_chunks: outcome.total,
            already_received: outcome.already_received.then_some(true),
        })),
        Err(err) => Err(with_recovery(&state, &file_id, err).await),
    }
}

/// GET /resume/:fileId — report which chunks are still missing
pub async fn resume_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(file_id): Path<String>,
) -> Result<Json<ResumeResponse>> {
    let outcome = state.sessions.resume(&principal, &file_id).await?;
    Ok(Json(ResumeResponse {
        file_id: outcome.file_id,
        total_chunks: outcome.total_chunks,
        received_chunks: outcome.received,
        missing_chunks: outcome.missing,
        progress: outcome.progress,
    }))
}

/// POST /complete/:fileId — assemble and run the processing pipeline
pub async fn complete_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(file_id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> std::result::Result<Json<CompleteResponse>, Response> {
    let final_path = request
        .final_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("finalPath is required".into()).into_response())?;

    if request.tool_resource.is_some() {
        // The stage list is fixed at init; a different resource here is
        // informational only.
        warn!(file_id = %file_id, "toolResource at complete is ignored; stages derive from init metadata");
    }

    match state
        .sessions
        .complete(&principal, &file_id, &final_path)
        .await
    {
        Ok(outcome) => Ok(Json(CompleteResponse {
            success: true,
            file_path: outcome.path.display().to_string(),
            size: outcome.size,
        })),
        Err(err) => Err(with_recovery(&state, &file_id, err).await),
    }
}

/// DELETE /:fileId — cancel the upload
pub async fn cancel_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(file_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    state.sessions.cancel(&principal, &file_id).await?;
    Ok(Json(CancelResponse {
        success: true,
        message: "Upload cancelled".to_string(),
    }))
}

/// GET /status/:fileId — session and pipeline snapshot
pub async fn upload_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(file_id): Path<String>,
) -> Result<Json<StatusResponse>> {
    let session = state.sessions.status(&principal, &file_id).await?;
    let pipeline = state.pipeline.status(&file_id).await;
    let last_known = state
        .bus
        .session_status(&file_id)
        .filter(|info| info.principal_id == principal.id);
    if session.is_none() && pipeline.is_none() && last_known.is_none() {
        return Err(Error::NotFound(format!("no upload state for {}", file_id)));
    }
    Ok(Json(StatusResponse {
        success: true,
        session,
        pipeline,
        last_known,
    }))
}

/// POST /validate/:fileId — re-hash stored chunks against recorded digests
pub async fn validate_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(file_id): Path<String>,
) -> Result<Json<ValidateResponse>> {
    let valid = state.sessions.validate(&principal, &file_id).await?;
    Ok(Json(ValidateResponse {
        success: true,
        valid,
    }))
}

/// GET /health — liveness plus registry gauges (not under the prefix,
/// not authenticated)
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.active_sessions().await,
        active_pipelines: state.pipeline.active_pipelines().await.len(),
    })
}

/// Attach the RecoveryController's latest decision to retryable errors so
/// the client receives `{error, message, recovery}`.
async fn with_recovery(state: &AppState, file_id: &str, err: Error) -> Response {
    if !err.retryable() {
        return err.into_response();
    }
    let recovery = state.recovery.advice(file_id).await;
    let status = err.status();
    let body = json!({
        "error": err.code(),
        "message": err.to_string(),
        "recovery": recovery,
    });
    (status, Json(body)).into_response()
}
