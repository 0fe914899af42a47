//! API error types.
//!
//! Every failure is rendered as the uniform envelope (see [`crate::envelope`])
//! with a stable `code`, a `retriable` flag, and an [`ErrorClass`] used for
//! logging.

use crate::envelope::Envelope;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stash_metadata::MetadataError;
use stash_storage::StorageError;

/// Broad failure category, deciding who is expected to act on an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request itself is wrong; retrying it unchanged will fail again.
    ClientError,
    /// A store was slow or unavailable; the same request may succeed later.
    TransientStorage,
    /// Concurrent writers disagreed; resolved by re-reading state.
    Consistency,
    /// Bytes exist in only one place and could not be moved.
    DataLossRisk,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::TransientStorage => "transient_storage",
            Self::Consistency => "consistency",
            Self::DataLossRisk => "data_loss_risk",
        }
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not logged in")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown upload id")]
    UnknownUpload,

    #[error("upload expired")]
    UploadExpired,

    #[error("upload is being completed by another request")]
    UploadInProgress,

    #[error("missing chunks: {missing:?}")]
    MissingChunks { missing: Vec<u64> },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("file is locked")]
    Locked,

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("{0}")]
    Core(#[from] stash_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::UnknownUpload => "unknown_upload",
            Self::UploadExpired => "upload_expired",
            Self::UploadInProgress => "upload_in_progress",
            Self::MissingChunks { .. } => "missing_chunks",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Conflict(_) => "conflict",
            Self::Locked => "file_locked",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal_error",
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => "not_found",
                StorageError::TooLarge { .. } => "payload_too_large",
                StorageError::InvalidKey(_) => "bad_request",
                _ => "storage_unavailable",
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => "not_found",
                MetadataError::AlreadyExists(_) => "already_exists",
                MetadataError::Conflict(_) | MetadataError::Constraint(_) => "conflict",
                MetadataError::InvalidStateTransition { from, .. } if from == "locked" => {
                    "file_locked"
                }
                MetadataError::InvalidStateTransition { .. } => "invalid_state",
                MetadataError::Database(_) => "metadata_unavailable",
                _ => "internal_error",
            },
            Self::Core(e) => match e {
                stash_core::Error::InvalidHash(_) => "invalid_hash",
                stash_core::Error::InvalidChunkIndex { .. } => "chunk_index_out_of_range",
                stash_core::Error::ChunkLength { .. } => "chunk_length_mismatch",
                stash_core::Error::InvalidFileName(_) => "invalid_file_name",
                stash_core::Error::HashMismatch { .. } => "hash_mismatch",
                stash_core::Error::SizeMismatch { .. } => "size_mismatch",
                _ => "bad_request",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::UnknownUpload => StatusCode::NOT_FOUND,
            Self::UploadExpired => StatusCode::GONE,
            Self::UploadInProgress | Self::MissingChunks { .. } | Self::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Self::HashMismatch { .. } | Self::SizeMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Locked => StatusCode::LOCKED,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                StorageError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_)
                | MetadataError::Conflict(_)
                | MetadataError::Constraint(_) => StatusCode::CONFLICT,
                MetadataError::InvalidStateTransition { from, .. } if from == "locked" => {
                    StatusCode::LOCKED
                }
                MetadataError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
                MetadataError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Failure category of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::TransientStorage,
            Self::Storage(e) if e.is_transient() || matches!(e, StorageError::Config(_)) => {
                ErrorClass::TransientStorage
            }
            Self::Metadata(e) if e.is_transient() => ErrorClass::TransientStorage,
            Self::UploadInProgress | Self::Conflict(_) => ErrorClass::Consistency,
            Self::Metadata(MetadataError::Conflict(_) | MetadataError::AlreadyExists(_)) => {
                ErrorClass::Consistency
            }
            _ => ErrorClass::ClientError,
        }
    }

    /// Whether the same request may succeed if sent again unchanged.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            Self::MissingChunks { .. } | Self::UploadInProgress | Self::Timeout { .. }
        ) || self.status_code() == StatusCode::SERVICE_UNAVAILABLE
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::MissingChunks { missing } => Some(serde_json::json!({ "missing": missing })),
            Self::HashMismatch { expected, actual } => {
                Some(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            Self::SizeMismatch { expected, actual } => {
                Some(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            Self::PayloadTooLarge { limit } => Some(serde_json::json!({ "limit": limit })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(
                code = self.code(),
                error_class = self.class().as_str(),
                error = %self,
                "Request failed"
            );
        }
        let body = Envelope::<()> {
            ok: false,
            code: self.code().to_string(),
            message: self.to_string(),
            data: None,
            details: self.details(),
            retriable: self.retriable(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
