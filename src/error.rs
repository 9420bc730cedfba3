//! Error types for ingestd
//!
//! Defines the core error taxonomy using thiserror. Every kind carries a
//! stable wire code and maps to an HTTP status; the API layer serializes
//! errors as `{"error": code, "message": ...}` with an optional `recovery`
//! object attached by the upload handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Core error type for the ingestion subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// Session or resource does not exist (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Session already exists or is in the wrong state for the operation (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Chunk index outside `[0, total_chunks)` (400)
    #[error("Bad chunk index {index}: session expects indices in [0, {total})")]
    BadIndex { index: u32, total: u32 },

    /// Client-supplied digest does not match the received bytes (400)
    #[error("Checksum mismatch for chunk {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    /// Declared file size exceeds `chunk_size * max_chunks` (413)
    #[error("File size {size} exceeds limit {limit}")]
    SizeExceeded { size: u64, limit: u64 },

    /// Assembled output size differs from the declared file size (500)
    #[error("Size mismatch: expected {expected} bytes, assembled {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Filesystem failures in the chunk store (500)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation aborted by cancellation (499)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Session exceeded its inactivity window (504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Missing or invalid credentials, or principal does not own the session (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed request outside the core taxonomy (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Catch-all for internal failures (500)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable wire code used in JSON error bodies and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::BadIndex { .. } => "bad_index",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::SizeExceeded { .. } => "size_exceeded",
            Error::SizeMismatch { .. } => "size_mismatch",
            Error::Io(_) => "io_error",
            Error::Cancelled(_) => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Unauthorized(_) => "unauthorized",
            Error::BadRequest(_) => "bad_request",
            Error::Internal(_) => "internal",
        }
    }

    /// HTTP status mapping.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::BadIndex { .. } => StatusCode::BAD_REQUEST,
            Error::ChecksumMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::SizeMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // 499 (client closed request) has no StatusCode constant
            Error::Cancelled(_) => StatusCode::from_u16(499)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the RecoveryController may schedule a retry for this kind.
    ///
    /// Terminal kinds are surfaced immediately with no retry.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout(_) | Error::Internal(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Convenience Result type using the ingestd Error
pub type Result<T> = std::result::Result<T, Error>;
