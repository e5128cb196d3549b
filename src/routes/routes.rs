//! Defines routes for all object, chunked upload and health operations.
//!
//! ## Structure
//! - **Object endpoints**
//!   - `POST   /upload`          - store the body as a new object
//!   - `GET    /blob/{id}`       - download (credentials required)
//!   - `GET    /public/{id}`     - download a public object
//!   - `GET    /metadata/{id}`   - object metadata
//!   - `GET    /list`            - paged listing (`page`, `pageSize`, `ext`, `search`)
//!   - `DELETE /delete/{id}`     - delete object
//!
//! - **Chunked upload endpoints** (503 when disabled)
//!   - `POST   /upload/init`, `POST /upload/chunk`, `POST /upload/finalize/{id}`
//!   - `GET    /upload/progress/{id}`, `DELETE /upload/cancel/{id}`
//!
//! - **Health**: `GET /health`, `GET /readyz`, `GET /api/stats`

use crate::{
    handlers::{
        health_handlers::{health, readyz, stats},
        object_handlers::{
            delete_object, get_object, get_object_metadata, get_public_object, list_objects,
            upload_object,
        },
        upload_handlers::{cancel_upload, finalize_upload, init_upload, upload_chunk, upload_progress},
    },
    services::{BlobStore, ChunkedUploadManager},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use std::sync::Arc;

/// Headroom above the chunk size for chunk request bodies.
const CHUNK_BODY_SLACK: u64 = 64 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: BlobStore,
    /// `None` when chunked uploads are disabled.
    pub uploads: Option<ChunkedUploadManager>,
    /// `None` disables access checks.
    pub access_key: Option<Arc<str>>,
    pub max_request_size: u64,
}

impl AppState {
    /// Largest body any route accepts.
    pub fn body_limit(&self) -> usize {
        let chunk_limit = self
            .uploads
            .as_ref()
            .map(|u| u.chunk_size().saturating_add(CHUNK_BODY_SLACK))
            .unwrap_or(0);
        usize::try_from(self.max_request_size.max(chunk_limit)).unwrap_or(usize::MAX)
    }
}

/// Build the application router with its state attached.
pub fn router(state: AppState) -> Router {
    let body_limit = state.body_limit();
    Router::new()
        // health endpoints
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .route("/api/stats", get(stats))
        // object routes
        .route("/upload", post(upload_object))
        .route("/blob/{id}", get(get_object))
        .route("/public/{id}", get(get_public_object))
        .route("/metadata/{id}", get(get_object_metadata))
        .route("/list", get(list_objects))
        .route("/delete/{id}", delete(delete_object))
        // chunked upload routes
        .route("/upload/init", post(init_upload))
        .route("/upload/chunk", post(upload_chunk))
        .route("/upload/finalize/{id}", post(finalize_upload))
        .route("/upload/progress/{id}", get(upload_progress))
        .route("/upload/cancel/{id}", delete(cancel_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
