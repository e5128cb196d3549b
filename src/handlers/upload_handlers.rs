//! HTTP handlers for the resumable chunked upload protocol.
//!
//! - POST   /upload/init            -> open a session (`X-Filename`, `X-Total-Size`)
//! - POST   /upload/chunk           -> send one chunk (`X-Upload-Id`, `X-Chunk-Number`)
//! - POST   /upload/finalize/{id}   -> retry assembly of a fully received upload
//! - GET    /upload/progress/{id}   -> session state and missing chunks
//! - DELETE /upload/cancel/{id}     -> drop a session and its scratch data

use super::{
    auth::{Authorized, ClientInfo, header_str},
    object_handlers::{decoded_filename, public_flag, request_metadata, ttl_seconds},
};
use crate::{
    errors::AppError,
    models::{InitUpload, UploadSession},
    routes::AppState,
    services::{ChunkOutcome, ChunkedUploadManager},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    upload_id: String,
    chunk_size: u64,
    total_chunks: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkResponse {
    success: bool,
    chunk_number: u32,
    duplicate: bool,
    progress: f64,
    completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressResponse<'a> {
    #[serde(flatten)]
    session: &'a UploadSession,
    progress: f64,
    uploaded_chunks: usize,
    completed: bool,
    missing_chunks: Vec<u32>,
    missing_chunks_count: usize,
}

fn manager(state: &AppState) -> Result<&ChunkedUploadManager, AppError> {
    state.uploads.as_ref().ok_or_else(|| {
        AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Chunked upload not available",
        )
    })
}

/// `POST /upload/init`
pub async fn init_upload(
    State(state): State<AppState>,
    _auth: Authorized,
    client: ClientInfo,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uploads = manager(&state)?;
    let filename = decoded_filename(&headers)?;
    let total_size = header_str(&headers, "x-total-size")
        .ok_or_else(|| AppError::bad_request("Missing required headers: X-Filename, X-Total-Size"))?;
    let total_size: u64 = total_size
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid total size: {}", total_size)))?;

    let session = uploads
        .initialize_upload(InitUpload {
            filename,
            total_size,
            is_public: public_flag(&headers),
            ttl_seconds: ttl_seconds(&headers),
            metadata: request_metadata(&headers, false),
            uploader_ip: client.ip,
            uploader_agent: client.agent,
        })
        .await?;

    Ok(Json(InitResponse {
        upload_id: session.upload_id,
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks,
        expires_at: session.expires_at,
    })
    .into_response())
}

/// `POST /upload/chunk` - the body is the chunk payload.
pub async fn upload_chunk(
    State(state): State<AppState>,
    _auth: Authorized,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let uploads = manager(&state)?;
    let missing = || AppError::bad_request("Missing required headers: X-Upload-Id, X-Chunk-Number");
    let upload_id = header_str(&headers, "x-upload-id").ok_or_else(missing)?;
    let raw_number = header_str(&headers, "x-chunk-number").ok_or_else(missing)?;
    let chunk_number: u32 = raw_number
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid chunk number: {}", raw_number)))?;

    let outcome = uploads.upload_chunk(upload_id, chunk_number, body).await?;
    let progress = uploads
        .get_upload(upload_id)
        .await
        .map(|session| session.progress())
        .unwrap_or(100.0);

    let (duplicate, file_id) = match outcome {
        ChunkOutcome::Accepted => (false, None),
        ChunkOutcome::Duplicate => (true, None),
        ChunkOutcome::Completed { object_id } => (false, Some(object_id)),
    };
    Ok(Json(ChunkResponse {
        success: true,
        chunk_number,
        duplicate,
        progress,
        completed: file_id.is_some(),
        file_id,
    })
    .into_response())
}

/// `POST /upload/finalize/{id}`
pub async fn finalize_upload(
    State(state): State<AppState>,
    _auth: Authorized,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let file_id = manager(&state)?.finalize_upload(&upload_id).await?;
    Ok(Json(json!({ "success": true, "completed": true, "fileId": file_id })).into_response())
}

/// `GET /upload/progress/{id}`
pub async fn upload_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let session = manager(&state)?
        .get_upload(&upload_id)
        .await
        .ok_or_else(|| AppError::not_found("Upload not found"))?;

    let missing_chunks = session.missing_chunks();
    Ok(Json(ProgressResponse {
        progress: session.progress(),
        uploaded_chunks: session.received_chunks(),
        completed: session.is_completed(),
        missing_chunks_count: missing_chunks.len(),
        missing_chunks,
        session: &session,
    })
    .into_response())
}

/// `DELETE /upload/cancel/{id}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    _auth: Authorized,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let success = manager(&state)?.cancel_upload(&upload_id).await;
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    let body = json!({
        "success": success,
        "message": if success { "Upload cancelled" } else { "Upload not found" },
    });
    Ok((status, Json(body)).into_response())
}
