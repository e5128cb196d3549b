//! Health, readiness and statistics handlers.
//!
//! - GET /health     -> liveness plus headline counters
//! - GET /readyz     -> readiness that checks disk I/O in the storage dir
//! - GET /api/stats  -> quota usage for the store and chunked uploads

use crate::routes::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    files: usize,
    memory_used: u64,
    storage_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_uploads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uploading_bytes: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_files: usize,
    cached_files: usize,
    used_memory: u64,
    used_storage: u64,
    max_memory: u64,
    max_storage: u64,
    memory_usage_percent: f64,
    storage_usage_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_uploads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uploading_bytes: Option<u64>,
}

/// `GET /health`
///
/// Cheap liveness probe; reads counters only, never touches the disk.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = &state.store;
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        files: store.file_count(),
        memory_used: store.used_memory(),
        storage_used: store.used_storage(),
        active_uploads: state.uploads.as_ref().map(|u| u.active_uploads_count()),
        uploading_bytes: state.uploads.as_ref().map(|u| u.total_uploading_bytes()),
    })
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let store = &state.store;
    Json(StatsResponse {
        total_files: store.file_count(),
        cached_files: store.cached_count(),
        used_memory: store.used_memory(),
        used_storage: store.used_storage(),
        max_memory: store.max_ram(),
        max_storage: store.max_storage(),
        memory_usage_percent: percent(store.used_memory(), store.max_ram()),
        storage_usage_percent: percent(store.used_storage(), store.max_storage()),
        active_uploads: state.uploads.as_ref().map(|u| u.active_uploads_count()),
        uploading_bytes: state.uploads.as_ref().map(|u| u.total_uploading_bytes()),
    })
}

/// `GET /readyz`
///
/// Performs a best-effort write/read/delete in the storage directory.
/// HTTP 200 when the check passes, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let tmp_path = state
        .store
        .storage_dir()
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&tmp_path).await {
                Ok(_) => (true, None::<String>),
                Err(e) => (true, Some(format!("could not remove tmp file: {}", e))),
            },
            Ok(_) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some("file content mismatch".to_string()))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("could not read tmp file: {}", e)))
            }
        },
        Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
    };

    let disk_ok = disk_check.0;
    let mut checks = HashMap::new();
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_ok,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if disk_ok { "ok" } else { "error" },
        checks,
    };
    let status = if disk_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Share of `limit` in use; 0 when the limit is unset.
fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64 * 100.0
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
