//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid chunk size: {size} (must be between {min} and {max})")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("chunk index {index} out of range (chunk count {count})")]
    InvalidChunkIndex { index: u64, count: u64 },

    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLength {
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("upload session error: {0}")]
    UploadSession(String),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("unknown storage backend: {0}")]
    InvalidBackend(String),

    #[error("unknown status: {0}")]
    InvalidStatus(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
