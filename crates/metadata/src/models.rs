//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use stash_core::{
    BackendKind, ChunkSession, ChunkSessionState, ContentHash, FileStatus, QueuedTransfer,
    TransferState, TransferTask, UploadId, UserId,
};
use time::OffsetDateTime;
use uuid::Uuid;

fn corrupt(what: &str, err: impl std::fmt::Display) -> MetadataError {
    MetadataError::Internal(format!("corrupt {what} column: {err}"))
}

fn to_u64(value: i64, what: &str) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|e| corrupt(what, e))
}

/// Sizes are stored as SQLite INTEGER (i64).
pub(crate) fn to_i64(value: u64, what: &str) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Constraint(format!("{what} {value} exceeds i64 range")))
}

// =============================================================================
// Files (physical, content-addressed)
// =============================================================================

/// Physical file record. One row per distinct content hash.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: i64,
    pub content_hash: String,
    pub size_bytes: i64,
    /// Which backend holds the bytes; see [`BackendKind`].
    pub storage_backend: String,
    pub storage_path: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Set when the last binding went away; cleared when a binding returns.
    pub deleted_at: Option<OffsetDateTime>,
}

impl FileRow {
    pub fn hash(&self) -> MetadataResult<ContentHash> {
        ContentHash::from_hex(&self.content_hash).map_err(|e| corrupt("files.content_hash", e))
    }

    pub fn backend(&self) -> MetadataResult<BackendKind> {
        BackendKind::parse(&self.storage_backend).map_err(|e| corrupt("files.storage_backend", e))
    }

    pub fn size(&self) -> MetadataResult<u64> {
        to_u64(self.size_bytes, "files.size_bytes")
    }
}

/// Input for creating a physical file.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub content_hash: ContentHash,
    pub size: u64,
    pub storage_backend: BackendKind,
    pub storage_path: String,
}

/// Where a file's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub backend: BackendKind,
    pub path: String,
}

impl Location {
    pub fn new(backend: BackendKind, path: impl Into<String>) -> Self {
        Self {
            backend,
            path: path.into(),
        }
    }
}

/// Outcome of a compare-and-set location update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationUpdate {
    Moved,
    /// The file was already at the destination; nothing changed.
    AlreadyAtDestination,
}

// =============================================================================
// User files (logical bindings)
// =============================================================================

/// A user's binding to a physical file.
#[derive(Debug, Clone, FromRow)]
pub struct UserFileRow {
    pub user_file_id: i64,
    pub user_id: i64,
    pub file_id: i64,
    pub display_name: String,
    pub directory_id: Option<i64>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserFileRow {
    pub fn status(&self) -> MetadataResult<FileStatus> {
        FileStatus::parse(&self.status).map_err(|e| corrupt("user_files.status", e))
    }
}

/// Input for binding a user to a file.
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub user_id: UserId,
    pub display_name: String,
    pub directory_id: Option<i64>,
}

/// A binding joined with its physical file.
#[derive(Debug, Clone, FromRow)]
pub struct UserFileView {
    pub user_file_id: i64,
    pub user_id: i64,
    pub file_id: i64,
    pub display_name: String,
    pub directory_id: Option<i64>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub content_hash: String,
    pub size_bytes: i64,
    pub storage_backend: String,
    pub storage_path: String,
}

impl UserFileView {
    pub fn status(&self) -> MetadataResult<FileStatus> {
        FileStatus::parse(&self.status).map_err(|e| corrupt("user_files.status", e))
    }

    pub fn hash(&self) -> MetadataResult<ContentHash> {
        ContentHash::from_hex(&self.content_hash).map_err(|e| corrupt("files.content_hash", e))
    }

    pub fn backend(&self) -> MetadataResult<BackendKind> {
        BackendKind::parse(&self.storage_backend).map_err(|e| corrupt("files.storage_backend", e))
    }

    pub fn size(&self) -> MetadataResult<u64> {
        to_u64(self.size_bytes, "files.size_bytes")
    }
}

/// Result of soft-deleting a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnbindOutcome {
    pub file_id: i64,
    /// The physical file has no remaining bindings and awaits reclaim.
    pub file_orphaned: bool,
}

// =============================================================================
// Chunk sessions
// =============================================================================

/// Persisted chunk session. Received indices live in `chunk_session_parts`.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkSessionRow {
    pub upload_id: Uuid,
    pub user_id: i64,
    pub content_hash: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub chunk_count: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl TryFrom<ChunkSessionRow> for ChunkSession {
    type Error = MetadataError;

    fn try_from(row: ChunkSessionRow) -> MetadataResult<Self> {
        Ok(ChunkSession {
            upload_id: UploadId::from_uuid(row.upload_id),
            user_id: UserId::new(row.user_id).map_err(|e| corrupt("chunk_sessions.user_id", e))?,
            content_hash: ContentHash::from_hex(&row.content_hash)
                .map_err(|e| corrupt("chunk_sessions.content_hash", e))?,
            total_size: to_u64(row.total_size, "chunk_sessions.total_size")?,
            chunk_size: to_u64(row.chunk_size, "chunk_sessions.chunk_size")?,
            chunk_count: to_u64(row.chunk_count, "chunk_sessions.chunk_count")?,
            state: ChunkSessionState::parse(&row.state)
                .map_err(|e| corrupt("chunk_sessions.state", e))?,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

/// Whether a part mark added a new index or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartMark {
    Inserted,
    Replaced,
}

// =============================================================================
// Transfer queue
// =============================================================================

/// Persisted transfer task with queue bookkeeping.
#[derive(Debug, Clone, FromRow)]
pub struct TransferTaskRow {
    pub task_id: i64,
    pub content_hash: String,
    pub source_location: String,
    pub dest_location: String,
    pub dest_backend: String,
    pub state: String,
    pub attempts: i64,
    pub available_at: OffsetDateTime,
    pub lease_expires_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<TransferTaskRow> for QueuedTransfer {
    type Error = MetadataError;

    fn try_from(row: TransferTaskRow) -> MetadataResult<Self> {
        Ok(QueuedTransfer {
            task_id: row.task_id,
            task: TransferTask {
                content_hash: ContentHash::from_hex(&row.content_hash)
                    .map_err(|e| corrupt("transfer_tasks.content_hash", e))?,
                source_location: row.source_location,
                dest_location: row.dest_location,
                dest_backend: BackendKind::parse(&row.dest_backend)
                    .map_err(|e| corrupt("transfer_tasks.dest_backend", e))?,
            },
            state: TransferState::parse(&row.state)
                .map_err(|e| corrupt("transfer_tasks.state", e))?,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            available_at: row.available_at,
            last_error: row.last_error,
        })
    }
}
