//! Core domain types for the stash file ingestion service.
//!
//! This crate defines the data model shared by every other crate:
//! - Content hashes (the dedup key)
//! - User identity, binding status and backend tags
//! - Chunked upload sessions
//! - Transfer tasks for local-to-remote migration
//! - Application configuration

pub mod config;
pub mod error;
pub mod file;
pub mod hash;
pub mod transfer;
pub mod upload;

pub use error::{Error, Result};
pub use file::{BackendKind, FileStatus, UserId};
pub use hash::{ContentHash, ContentHasher};
pub use transfer::{QueuedTransfer, TransferState, TransferTask};
pub use upload::{ChunkSession, ChunkSessionState, FileInfo, UploadId};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum chunk size: 64 KiB
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
