//! Resumable chunked uploads.
//!
//! `init` declares the content hash and size and fixes the chunk layout.
//! Each `part` stores one chunk under `{upload_id}/{index}` on the local
//! backend and records the index in the session. Parts may arrive in any
//! order and may be re-sent; the session row is the only authority on which
//! indices are present. `complete` refuses to merge while any index is
//! missing, then concatenates the parts in ascending order, verifies size
//! and hash, and commits the result like a single-shot upload.

use crate::error::{ApiError, ApiResult};
use crate::ingest::IngestService;
use crate::metrics::{CHUNK_PARTS_RECEIVED, record_completion_failure};
use crate::timeouts::bounded;
use stash_core::config::AppConfig;
use stash_core::file::validate_display_name;
use stash_core::upload::{
    ChunkPartResponse, CompleteChunkRequest, InitChunkRequest, InitChunkResponse,
};
use stash_core::{ChunkSession, ChunkSessionState, ContentHash, FileInfo, UploadId, UserId};
use stash_metadata::models::PartMark;
use stash_metadata::repos::ChunkSessionRepo;
use stash_metadata::{MetadataError, MetadataStore};
use stash_storage::{DigestWriter, FilesystemBackend, StorageError};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Local key of one stored part.
pub fn part_key(upload_id: UploadId, index: u64) -> String {
    format!("{upload_id}/{index}")
}

pub struct ChunkUploadCoordinator {
    config: Arc<AppConfig>,
    metadata: Arc<dyn MetadataStore>,
    local: Arc<FilesystemBackend>,
    ingest: Arc<IngestService>,
}

/// One chunk being received. Created by
/// [`ChunkUploadCoordinator::begin_part`] after the session and index were
/// checked, so nothing is read from the body for a request that would be
/// rejected anyway.
pub struct ChunkPartWriter {
    session: ChunkSession,
    index: u64,
    expected_len: u64,
    writer: DigestWriter,
}

impl ChunkPartWriter {
    /// Append the next slice of the chunk body.
    pub async fn write(&mut self, data: &[u8]) -> ApiResult<()> {
        match self.writer.write(data).await {
            Ok(()) => Ok(()),
            Err(StorageError::TooLarge { .. }) => Err(stash_core::Error::ChunkLength {
                index: self.index,
                expected: self.expected_len,
                actual: self.writer.bytes_written() + data.len() as u64,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upload_id(&self) -> UploadId {
        self.session.upload_id
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl ChunkUploadCoordinator {
    pub fn new(
        config: Arc<AppConfig>,
        metadata: Arc<dyn MetadataStore>,
        ingest: Arc<IngestService>,
        local: Arc<FilesystemBackend>,
    ) -> Self {
        Self {
            config,
            metadata,
            local,
            ingest,
        }
    }

    fn op_timeout(&self) -> Duration {
        self.config.server.store_op_timeout()
    }

    /// Open a session for `request.size` bytes hashing to `request.content_hash`.
    pub async fn init(
        &self,
        user_id: UserId,
        request: &InitChunkRequest,
    ) -> ApiResult<InitChunkResponse> {
        let hash = ContentHash::from_hex(request.content_hash.trim())?;
        let limit = self.config.server.max_upload_size;
        if request.size > limit {
            return Err(ApiError::PayloadTooLarge { limit });
        }

        let session = ChunkSession::new(
            user_id,
            hash,
            request.size,
            self.config.ingest.chunk_size,
            self.config.ingest.chunk_session_ttl(),
        )?;
        bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.create_chunk_session(&session),
        )
        .await?;

        tracing::info!(
            upload_id = %session.upload_id,
            content_hash = %hash,
            size = session.total_size,
            chunk_count = session.chunk_count,
            "Chunk session created"
        );
        Ok(InitChunkResponse {
            upload_id: session.upload_id.to_string(),
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count,
            expires_at: session.expires_at,
        })
    }

    /// Load a session owned by `user_id`. Someone else's session is reported
    /// exactly like a missing one.
    async fn load_owned(&self, user_id: UserId, upload_id: UploadId) -> ApiResult<ChunkSession> {
        let session = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.get_chunk_session(upload_id),
        )
        .await?
        .ok_or(ApiError::UnknownUpload)?;
        if session.user_id != user_id {
            return Err(ApiError::UnknownUpload);
        }
        Ok(session)
    }

    /// Check that `index` may be written and prepare to receive it.
    pub async fn begin_part(
        &self,
        user_id: UserId,
        upload_id: UploadId,
        index: u64,
    ) -> ApiResult<ChunkPartWriter> {
        let session = self.load_owned(user_id, upload_id).await?;
        match session.effective_state() {
            ChunkSessionState::Initialized | ChunkSessionState::Receiving => {}
            ChunkSessionState::Abandoned => return Err(ApiError::UploadExpired),
            ChunkSessionState::Completing => return Err(ApiError::UploadInProgress),
            ChunkSessionState::Completed => return Err(ApiError::UnknownUpload),
        }
        let expected_len =
            session
                .expected_chunk_len(index)
                .ok_or(stash_core::Error::InvalidChunkIndex {
                    index,
                    count: session.chunk_count,
                })?;

        let writer = self
            .ingest
            .digester()
            .clone()
            .with_max_size(expected_len)
            .begin()
            .await?;
        Ok(ChunkPartWriter {
            session,
            index,
            expected_len,
            writer,
        })
    }

    /// Store a fully received part and mark its index.
    ///
    /// A failure before the mark leaves the received set untouched, so the
    /// same index can simply be sent again. A part refused at the mark is
    /// rolled back on disk: a replaced chunk gets its previous bytes back.
    pub async fn finish_part(&self, part: ChunkPartWriter) -> ApiResult<ChunkPartResponse> {
        let ChunkPartWriter {
            session,
            index,
            writer,
            ..
        } = part;
        let upload_id = session.upload_id;

        let content = writer.finish().await?;
        session.check_part(index, content.size)?;

        let key = part_key(upload_id, index);
        let previous = self
            .local
            .adopt_keeping_previous(&key, content.into_temp_path())
            .await?;

        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.config.ingest.chunk_session_ttl();
        let marked = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata
                .mark_chunk_received(upload_id, index, now, expires_at),
        )
        .await;
        let mark = match marked {
            Ok(mark) => mark,
            Err(ApiError::Metadata(MetadataError::InvalidStateTransition { .. })) => {
                // Completion started meanwhile and may be reading this chunk.
                if let Err(e) = self.local.restore(&key, previous).await {
                    tracing::warn!(key, error = %e, "Failed to roll back refused part");
                }
                return Err(ApiError::UploadInProgress);
            }
            Err(ApiError::Metadata(MetadataError::NotFound(_))) => {
                // Swept or completed meanwhile; the part has no session left.
                drop(previous);
                if let Err(e) = self.local.delete_prefix(&upload_id.to_string()).await {
                    tracing::warn!(%upload_id, error = %e, "Failed to remove orphaned parts");
                }
                return Err(ApiError::UnknownUpload);
            }
            Err(e) => return Err(e),
        };
        drop(previous);

        CHUNK_PARTS_RECEIVED.inc();
        tracing::debug!(
            %upload_id,
            chunk_index = index,
            replaced = mark == PartMark::Replaced,
            "Chunk part stored"
        );
        Ok(ChunkPartResponse {
            upload_id: upload_id.to_string(),
            chunk_index: index,
            newly_received: mark == PartMark::Inserted,
        })
    }

    /// Merge all parts and commit the result.
    #[tracing::instrument(skip(self, request), fields(upload_id = %request.upload_id))]
    pub async fn complete(
        &self,
        user_id: UserId,
        request: &CompleteChunkRequest,
    ) -> ApiResult<FileInfo> {
        let file_name = validate_display_name(&request.file_name)?;
        let upload_id =
            UploadId::parse(request.upload_id.trim()).map_err(|_| ApiError::UnknownUpload)?;
        let session = self.load_owned(user_id, upload_id).await?;
        match session.effective_state() {
            ChunkSessionState::Initialized | ChunkSessionState::Receiving => {}
            ChunkSessionState::Abandoned => return Err(ApiError::UploadExpired),
            ChunkSessionState::Completing => return Err(ApiError::UploadInProgress),
            ChunkSessionState::Completed => return Err(ApiError::UnknownUpload),
        }

        let received = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.received_chunk_indices(upload_id),
        )
        .await?;
        let missing = session.missing_indices(&received);
        if !missing.is_empty() {
            record_completion_failure("missing_chunks");
            tracing::info!(missing = ?missing, "Completion refused, chunks missing");
            return Err(ApiError::MissingChunks { missing });
        }

        let now = OffsetDateTime::now_utc();
        let claimed = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.begin_completing(
                upload_id,
                now,
                now + self.config.ingest.chunk_session_ttl(),
            ),
        )
        .await?;
        if !claimed {
            record_completion_failure("in_progress");
            return Err(ApiError::UploadInProgress);
        }

        match self
            .merge_and_commit(user_id, &session, file_name, request.directory_id)
            .await
        {
            Ok(info) => {
                self.discard(upload_id).await;
                Ok(info)
            }
            Err(e) => {
                record_completion_failure(e.code());
                if let Err(abort_err) = self
                    .metadata
                    .abort_completing(upload_id, OffsetDateTime::now_utc())
                    .await
                {
                    tracing::warn!(error = %abort_err, "Failed to reopen session after failed completion");
                }
                Err(e)
            }
        }
    }

    async fn merge_and_commit(
        &self,
        user_id: UserId,
        session: &ChunkSession,
        file_name: &str,
        directory_id: Option<i64>,
    ) -> ApiResult<FileInfo> {
        let keys: Vec<String> = (0..session.chunk_count)
            .map(|index| part_key(session.upload_id, index))
            .collect();
        let merged = self.ingest.digester().digest_concat(&keys).await?;

        if merged.size != session.total_size {
            return Err(ApiError::SizeMismatch {
                expected: session.total_size,
                actual: merged.size,
            });
        }
        if self.config.ingest.verify_content_hash && merged.hash != session.content_hash {
            return Err(ApiError::HashMismatch {
                expected: session.content_hash.to_hex(),
                actual: merged.hash.to_hex(),
            });
        }

        self.ingest
            .commit(user_id, file_name, directory_id, merged)
            .await
    }

    /// Remove the parts and the session after a successful commit. Leftovers
    /// are picked up by the sweeper once the session expires.
    async fn discard(&self, upload_id: UploadId) {
        if let Err(e) = self.local.delete_prefix(&upload_id.to_string()).await {
            tracing::warn!(%upload_id, error = %e, "Failed to remove chunk directory");
        }
        if let Err(e) = self.metadata.delete_chunk_session(upload_id).await {
            tracing::warn!(%upload_id, error = %e, "Failed to delete completed session");
        }
    }
}
