//! File ingestion: committing digested content and binding users to it.
//!
//! Content is addressed by its SHA-256. The first upload of some content
//! stores the bytes locally under `{hash}` and writes the file row, its first
//! binding and (for a remote current backend) the transfer task in one
//! transaction. Later uploads of the same content only add a binding.
//!
//! Within one process commits of the same hash are serialized by
//! [`HashLocks`]. Across processes the UNIQUE constraint on the content hash
//! decides the winner; the loser re-reads and binds to the winner's row.

pub mod chunked;

pub use chunked::{ChunkPartWriter, ChunkUploadCoordinator};

use crate::error::{ApiError, ApiResult};
use crate::locks::HashLocks;
use crate::metrics::{DEDUP_HITS, FILES_INGESTED, INGESTED_BYTES};
use crate::migration::Migrator;
use crate::timeouts::bounded;
use stash_core::config::{AppConfig, MigrationMode};
use stash_core::file::validate_display_name;
use stash_core::upload::RapidCheckRequest;
use stash_core::{BackendKind, ContentHash, FileInfo, TransferTask, UserId};
use stash_metadata::models::{FileRow, NewBinding, NewFile};
use stash_metadata::repos::{FileRepo, UserFileRepo};
use stash_metadata::{MetadataError, MetadataStore};
use stash_storage::{BackendSet, ContentDigester, DigestWriter, DigestedContent, ObjectStore};
use std::sync::Arc;
use std::time::Duration;

pub struct IngestService {
    config: Arc<AppConfig>,
    metadata: Arc<dyn MetadataStore>,
    backends: BackendSet,
    digester: ContentDigester,
    locks: HashLocks,
    migrator: Arc<Migrator>,
}

impl IngestService {
    pub fn new(
        config: Arc<AppConfig>,
        metadata: Arc<dyn MetadataStore>,
        backends: BackendSet,
        locks: HashLocks,
        migrator: Arc<Migrator>,
    ) -> Self {
        let digester = ContentDigester::new(backends.local().clone())
            .with_max_size(config.server.max_upload_size);
        Self {
            config,
            metadata,
            backends,
            digester,
            locks,
            migrator,
        }
    }

    pub fn digester(&self) -> &ContentDigester {
        &self.digester
    }

    fn op_timeout(&self) -> Duration {
        self.config.server.store_op_timeout()
    }

    /// Start a single-shot upload. Feed the body through the writer, then
    /// hand the result to [`IngestService::commit`].
    pub async fn begin(&self) -> ApiResult<DigestWriter> {
        Ok(self.digester.begin().await?)
    }

    /// Record digested content as a file bound to `user_id` under `file_name`.
    ///
    /// If the content already exists the staged bytes are discarded and only
    /// a binding is added.
    #[tracing::instrument(skip(self, content), fields(content_hash = %content.hash, size = content.size))]
    pub async fn commit(
        &self,
        user_id: UserId,
        file_name: &str,
        directory_id: Option<i64>,
        content: DigestedContent,
    ) -> ApiResult<FileInfo> {
        let binding = NewBinding {
            user_id,
            display_name: validate_display_name(file_name)?.to_string(),
            directory_id,
        };
        let hash = content.hash;
        let guard = self.locks.lock(hash).await;

        if let Some(existing) = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.find_file_by_hash(&hash),
        )
        .await?
        {
            return self.bind_existing(&existing, &binding).await;
        }

        let size = content.size;
        let local_key = hash.to_hex();
        self.backends
            .local()
            .adopt(&local_key, content.into_temp_path())
            .await?;

        let backend = self.config.ingest.current_backend;
        let transfer = backend
            .is_remote()
            .then(|| TransferTask::for_local_file(hash, &self.config.ingest.remote_root, backend));
        let file = NewFile {
            content_hash: hash,
            size,
            storage_backend: BackendKind::Local,
            storage_path: local_key.clone(),
        };

        let created = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata
                .create_file_with_binding(&file, &binding, transfer.as_ref()),
        )
        .await;
        let (file_row, user_file) = match created {
            Ok(created) => created,
            Err(ApiError::Metadata(MetadataError::AlreadyExists(_))) => {
                drop(guard);
                return self.adopt_winner(&hash, &local_key, &binding).await;
            }
            Err(e) => return Err(e),
        };
        drop(guard);

        FILES_INGESTED.inc();
        INGESTED_BYTES.observe(size as f64);
        tracing::info!(
            file_id = file_row.file_id,
            user_file_id = user_file.user_file_id,
            "File ingested"
        );

        if let Some(task) = transfer
            && self.config.ingest.migration_mode == MigrationMode::Sync
        {
            // Bounded per step by the migrator. The queued task stays behind;
            // the worker acks it as already done.
            if let Err(e) = self.migrator.migrate(&task).await {
                tracing::warn!(
                    error = %e,
                    error_class = "transient_storage",
                    "Inline migration failed, left for the migration worker"
                );
            }
        }

        Ok(FileInfo {
            file_id: user_file.user_file_id,
            content_hash: hash,
            size,
            file_name: user_file.display_name,
            deduplicated: false,
        })
    }

    /// Another writer created the row first; bind to theirs.
    async fn adopt_winner(
        &self,
        hash: &ContentHash,
        local_key: &str,
        binding: &NewBinding,
    ) -> ApiResult<FileInfo> {
        let _guard = self.locks.lock(*hash).await;
        let existing = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.find_file_by_hash(hash),
        )
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("file {hash} vanished during commit")))?;

        if existing.backend()? != BackendKind::Local || existing.storage_path != local_key {
            if let Err(e) = self.backends.local().delete(local_key).await
                && !e.is_not_found()
            {
                tracing::warn!(error = %e, "Failed to drop bytes of a lost commit race");
            }
        }
        tracing::debug!(content_hash = %hash, "Lost commit race, binding to existing file");
        self.bind_existing(&existing, binding).await
    }

    async fn bind_existing(&self, existing: &FileRow, binding: &NewBinding) -> ApiResult<FileInfo> {
        let (user_file, created) = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.bind_file(existing.file_id, binding),
        )
        .await?;
        DEDUP_HITS.inc();
        tracing::info!(
            file_id = existing.file_id,
            user_file_id = user_file.user_file_id,
            created,
            "Bound to existing content"
        );
        Ok(FileInfo {
            file_id: user_file.user_file_id,
            content_hash: existing.hash()?,
            size: existing.size()?,
            file_name: user_file.display_name,
            deduplicated: true,
        })
    }

    /// Bind to existing content by hash without transferring any bytes.
    ///
    /// A miss is `NotFound`; the client then falls back to a full upload.
    pub async fn rapid_check(
        &self,
        user_id: UserId,
        request: &RapidCheckRequest,
    ) -> ApiResult<FileInfo> {
        let hash = ContentHash::from_hex(request.file_hash.trim())?;
        let binding = NewBinding {
            user_id,
            display_name: validate_display_name(&request.file_name)?.to_string(),
            directory_id: request.directory_id,
        };

        let _guard = self.locks.lock(hash).await;
        let existing = bounded(
            self.op_timeout(),
            "metadata",
            self.metadata.find_file_by_hash(&hash),
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("no file with this content hash".to_string()))?;
        self.bind_existing(&existing, &binding).await
    }
}
