//! HTTP handlers for direct object operations.
//! Buffers each body in full and delegates storage concerns to `BlobStore`.

use super::auth::{Authorized, ClientInfo, header_str, is_authorized};
use crate::{
    errors::AppError,
    models::StoredObject,
    routes::AppState,
    services::{ListQuery, StoreRequest},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const META_HEADER_PREFIX: &str = "x-meta-";
const MAX_PAGE_SIZE: usize = 1000;

/// Query params accepted by `GET /list`.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<usize>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<usize>,
    pub ext: Option<String>,
    pub search: Option<String>,
}

/// Object description returned by upload, metadata and listing calls.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectView<'a> {
    #[serde(flatten)]
    object: &'a StoredObject,
    mime_type: &'static str,
    url: String,
}

impl<'a> ObjectView<'a> {
    pub fn new(object: &'a StoredObject) -> Self {
        let url = if object.is_public {
            format!("/public/{}", object.id)
        } else {
            format!("/blob/{}", object.id)
        };
        Self {
            mime_type: object.mime_type(),
            object,
            url,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<'a> {
    page: usize,
    page_size: usize,
    total: usize,
    files: Vec<ObjectView<'a>>,
}

/// `POST /upload` - store the request body as a new object.
pub async fn upload_object(
    State(state): State<AppState>,
    _auth: Authorized,
    client: ClientInfo,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let filename = decoded_filename(&headers)?;
    if body.len() as u64 > state.max_request_size {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request too large. Use chunked upload for large files.",
        ));
    }

    let object = state
        .store
        .store(StoreRequest {
            filename,
            data: body,
            is_public: public_flag(&headers),
            ttl_seconds: ttl_seconds(&headers),
            uploader_ip: client.ip,
            uploader_agent: client.agent,
            metadata: request_metadata(&headers, true),
        })
        .await?;

    Ok(Json(ObjectView::new(&object)).into_response())
}

/// `GET /blob/{id}` - download any object.
pub async fn get_object(
    State(state): State<AppState>,
    _auth: Authorized,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let object = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found("File not found"))?;
    Ok(object_response(object))
}

/// `GET /public/{id}` - download an object flagged public, no credentials.
pub async fn get_public_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let meta = state
        .store
        .get_metadata(&id)
        .await
        .ok_or_else(|| AppError::not_found("File not found"))?;
    if !meta.is_public {
        return Err(AppError::forbidden("File is not public"));
    }
    let object = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found("File data not found"))?;
    Ok(object_response(object))
}

/// `GET /metadata/{id}` - credentials are only needed for private objects.
pub async fn get_object_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let object = state
        .store
        .get_metadata(&id)
        .await
        .ok_or_else(|| AppError::not_found("File not found"))?;
    if !object.is_public && !is_authorized(&headers, state.access_key.as_deref()) {
        return Err(AppError::forbidden("Forbidden"));
    }
    Ok(Json(ObjectView::new(&object)).into_response())
}

/// `GET /list?page=&pageSize=&ext=&search=` - newest first.
pub async fn list_objects(
    State(state): State<AppState>,
    _auth: Authorized,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let query = ListQuery {
        page: params.page.unwrap_or(1).max(1),
        page_size: params.page_size.unwrap_or(10).clamp(1, MAX_PAGE_SIZE),
        extension: params.ext,
        search: params.search,
    };

    let objects = state.store.list_files(&query).await;
    let total = state.store.total_files(&query).await;
    let body = ListResponse {
        page: query.page,
        page_size: query.page_size,
        total,
        files: objects.iter().map(ObjectView::new).collect(),
    };
    Ok(Json(body).into_response())
}

/// `DELETE /delete/{id}`
pub async fn delete_object(
    State(state): State<AppState>,
    _auth: Authorized,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if !state.store.delete(&id).await {
        return Err(AppError::not_found("File not found"));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "File deleted successfully"
    }))
    .into_response())
}

fn object_response(object: StoredObject) -> Response {
    let mut headers = HeaderMap::new();
    set_object_headers(&mut headers, &object);
    let mut response = Response::new(Body::from(object.data));
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    response
}

fn set_object_headers(headers: &mut HeaderMap, object: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(object.mime_type()),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(object.data.len() as u64),
    );

    let disposition = format!(
        "attachment; filename=\"{}\"",
        object.filename.replace('"', "'")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let etag = format!("\"{:x}\"", md5::compute(&object.data));
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&object.uploaded_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

/// Required, percent-encoded `X-Filename`.
pub(crate) fn decoded_filename(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = header_str(headers, "x-filename")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Filename header is required"))?;
    urlencoding::decode(raw)
        .map(|name| name.into_owned())
        .map_err(|_| AppError::bad_request("X-Filename is not valid percent-encoded UTF-8"))
}

pub(crate) fn public_flag(headers: &HeaderMap) -> bool {
    header_str(headers, "x-public").is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Unparseable TTLs are ignored.
pub(crate) fn ttl_seconds(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, "x-ttl").and_then(|v| v.parse().ok())
}

/// Well-known metadata headers, plus `X-Meta-*` when `custom` is set.
/// Header names arrive lowercased, so custom keys are lowercase.
pub(crate) fn request_metadata(headers: &HeaderMap, custom: bool) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    for (key, name) in [
        ("tags", "x-tags"),
        ("category", "x-category"),
        ("uploader", "x-uploader"),
        ("description", "x-description"),
    ] {
        if let Some(value) = header_str(headers, name) {
            metadata.insert(key.to_string(), value.to_string());
        }
    }

    if custom {
        for (name, value) in headers {
            let Some(key) = name.as_str().strip_prefix(META_HEADER_PREFIX) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            if let Ok(value) = value.to_str() {
                metadata.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_filename_is_percent_decoded() {
        let h = headers(&[("x-filename", "my%20report%C3%A9.pdf")]);
        assert_eq!(decoded_filename(&h).unwrap(), "my reporté.pdf");
        let err = decoded_filename(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upload_headers_become_metadata() {
        let h = headers(&[
            ("x-public", "TRUE"),
            ("x-ttl", "120"),
            ("x-tags", "a,b"),
            ("x-category", "docs"),
            ("x-meta-project", "apollo"),
        ]);
        assert!(public_flag(&h));
        assert_eq!(ttl_seconds(&h), Some(120));

        let meta = request_metadata(&h, true);
        assert_eq!(meta["tags"], "a,b");
        assert_eq!(meta["category"], "docs");
        assert_eq!(meta["project"], "apollo");
        assert!(!request_metadata(&h, false).contains_key("project"));
    }

    #[test]
    fn test_invalid_ttl_is_ignored() {
        let h = headers(&[("x-ttl", "soon"), ("x-public", "yes")]);
        assert_eq!(ttl_seconds(&h), None);
        assert!(!public_flag(&h));
    }
}
