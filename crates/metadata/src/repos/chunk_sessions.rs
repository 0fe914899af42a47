//! Chunked upload session repository.

use crate::error::MetadataResult;
use crate::models::PartMark;
use async_trait::async_trait;
use stash_core::{ChunkSession, UploadId};
use time::OffsetDateTime;

/// Repository for chunk sessions and their received parts.
#[async_trait]
pub trait ChunkSessionRepo: Send + Sync {
    /// Persist a new session.
    async fn create_chunk_session(&self, session: &ChunkSession) -> MetadataResult<()>;

    /// Get a session by upload ID.
    async fn get_chunk_session(&self, upload_id: UploadId)
    -> MetadataResult<Option<ChunkSession>>;

    /// Record a received chunk index and slide the session expiry.
    ///
    /// Atomic per index: concurrent marks of distinct indices never lose each
    /// other. Moves the session to `receiving`. Fails with `NotFound` for an
    /// unknown session and `InvalidStateTransition` when the session no
    /// longer accepts parts.
    async fn mark_chunk_received(
        &self,
        upload_id: UploadId,
        chunk_index: u64,
        received_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<PartMark>;

    /// Received indices in ascending order.
    async fn received_chunk_indices(&self, upload_id: UploadId) -> MetadataResult<Vec<u64>>;

    /// Atomically move a session into `completing`.
    ///
    /// Returns `false` if the session is not in a state that accepts
    /// completion (already completing, or gone). The expiry is pushed to
    /// `expires_at` so an interrupted completion is eventually swept.
    async fn begin_completing(
        &self,
        upload_id: UploadId,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Return a `completing` session to `receiving` after a failed completion.
    async fn abort_completing(&self, upload_id: UploadId, now: OffsetDateTime)
    -> MetadataResult<()>;

    /// Delete a session and its parts.
    async fn delete_chunk_session(&self, upload_id: UploadId) -> MetadataResult<()>;

    /// Delete a session only if it is still expired at `now`.
    ///
    /// Returns `false` when a concurrent part extended it.
    async fn delete_chunk_session_if_expired(
        &self,
        upload_id: UploadId,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Sessions whose expiry has passed.
    async fn list_expired_chunk_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ChunkSession>>;
}
