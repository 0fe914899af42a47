//! Chunked upload sessions and the request/response bodies of the upload API.

use crate::file::UserId;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a chunked upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::UploadSession(format!("invalid upload ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk session lifecycle.
///
/// `Initialized -> Receiving -> Completing -> Completed`, with `Abandoned`
/// reached from `Initialized` or `Receiving` when the TTL lapses. Only the
/// first three are ever persisted: a completed session is deleted together
/// with its chunk directory, and an abandoned one is a persisted session
/// whose expiry has passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSessionState {
    Initialized,
    Receiving,
    Completing,
    Completed,
    Abandoned,
}

impl ChunkSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Receiving => "receiving",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "receiving" => Ok(Self::Receiving),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Whether part uploads are accepted in this state.
    pub fn can_accept_parts(&self) -> bool {
        matches!(self, Self::Initialized | Self::Receiving)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

impl fmt::Display for ChunkSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight multipart upload.
///
/// The received set lives beside the session in the session store and is
/// mutated one index at a time; it is not part of this struct so that no
/// caller is tempted to read-modify-write it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkSession {
    pub upload_id: UploadId,
    pub user_id: UserId,
    pub content_hash: ContentHash,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub state: ChunkSessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ChunkSession {
    /// Create a new session. `chunk_size` must be non-zero.
    pub fn new(
        user_id: UserId,
        content_hash: ContentHash,
        total_size: u64,
        chunk_size: u64,
        ttl: time::Duration,
    ) -> crate::Result<Self> {
        if chunk_size == 0 {
            return Err(crate::Error::InvalidChunkSize {
                size: 0,
                min: crate::MIN_CHUNK_SIZE,
                max: crate::MAX_CHUNK_SIZE,
            });
        }
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            upload_id: UploadId::new(),
            user_id,
            content_hash,
            total_size,
            chunk_size,
            chunk_count: chunk_count(total_size, chunk_size),
            state: ChunkSessionState::Initialized,
            created_at: now,
            expires_at: now + ttl,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// State as observed now, folding TTL expiry into `Abandoned`.
    pub fn effective_state(&self) -> ChunkSessionState {
        if self.state.can_accept_parts() && self.is_expired() {
            ChunkSessionState::Abandoned
        } else {
            self.state
        }
    }

    /// Byte length the chunk at `index` must have, or `None` when out of range.
    pub fn expected_chunk_len(&self, index: u64) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        let start = index * self.chunk_size;
        Some((self.total_size - start).min(self.chunk_size))
    }

    /// Validate a part before anything is written.
    pub fn check_part(&self, index: u64, len: u64) -> crate::Result<()> {
        let expected = self
            .expected_chunk_len(index)
            .ok_or(crate::Error::InvalidChunkIndex {
                index,
                count: self.chunk_count,
            })?;
        if expected != len {
            return Err(crate::Error::ChunkLength {
                index,
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    /// Indices in `[0, chunk_count)` absent from `received`, ascending.
    pub fn missing_indices(&self, received: &[u64]) -> Vec<u64> {
        let mut seen = vec![false; self.chunk_count as usize];
        for &i in received {
            if let Some(slot) = seen.get_mut(i as usize) {
                *slot = true;
            }
        }
        seen.iter()
            .enumerate()
            .filter(|(_, present)| !**present)
            .map(|(i, _)| i as u64)
            .collect()
    }
}

/// `ceil(total / chunk_size)`; zero bytes means zero chunks.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Body of `POST /v1/chunk/init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChunkRequest {
    pub content_hash: String,
    pub size: u64,
}

/// Response of `POST /v1/chunk/init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChunkResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    pub chunk_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Response of `POST /v1/chunk/part`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPartResponse {
    pub upload_id: String,
    pub chunk_index: u64,
    /// False when the index had already been received and was overwritten.
    pub newly_received: bool,
}

/// Body of `POST /v1/chunk/complete`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteChunkRequest {
    pub upload_id: String,
    pub file_name: String,
    #[serde(default)]
    pub directory_id: Option<i64>,
}

/// Body of `POST /v1/rapidcheck`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RapidCheckRequest {
    pub file_hash: String,
    pub file_name: String,
    #[serde(default)]
    pub directory_id: Option<i64>,
}

/// Result of every ingestion path: single-shot, chunk completion, rapid upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: i64,
    pub content_hash: ContentHash,
    pub size: u64,
    pub file_name: String,
    /// True when no bytes were stored because the content already existed.
    pub deduplicated: bool,
}
