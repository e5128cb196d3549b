use crate::services::{StoreError, UploadError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            StoreError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Store(inner) => inner.into(),
            err => {
                let status = match &err {
                    UploadError::SessionNotFound(_) | UploadError::SessionExpired(_) => {
                        StatusCode::NOT_FOUND
                    }
                    UploadError::InvalidSize { .. }
                    | UploadError::TooManyChunks { .. }
                    | UploadError::ChunkOutOfRange { .. }
                    | UploadError::EmptyChunk
                    | UploadError::MissingChunk(_) => StatusCode::BAD_REQUEST,
                    UploadError::ChecksumMismatch(_) | UploadError::SizeMismatch { .. } => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    UploadError::Store(_) | UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                AppError::new(status, err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_core_errors_map_to_status_codes() {
        let capacity: AppError = StoreError::CapacityExceeded {
            requested: 10,
            used: 95,
            limit: 100,
        }
        .into();
        assert_eq!(capacity.status, StatusCode::INSUFFICIENT_STORAGE);

        let wrapped: AppError = UploadError::Store(StoreError::InvalidFilename("..".into())).into();
        assert_eq!(wrapped.status, StatusCode::BAD_REQUEST);

        let missing: AppError = UploadError::SessionNotFound("x".into()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let integrity: AppError = UploadError::SizeMismatch {
            expected: 10,
            actual: 9,
        }
        .into();
        assert_eq!(integrity.status, StatusCode::UNPROCESSABLE_ENTITY);

        let io: AppError = UploadError::Io(io::Error::other("disk")).into();
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
