//! Periodic cleanup of abandoned uploads and unreferenced files.

use crate::locks::HashLocks;
use crate::metrics::{FILES_RECLAIMED, SESSIONS_SWEPT};
use stash_metadata::models::FileRow;
use stash_metadata::repos::{ChunkSessionRepo, FileRepo};
use stash_metadata::{MetadataResult, MetadataStore};
use stash_storage::{BackendSet, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Rows examined per pass and per kind.
const SWEEP_BATCH: u32 = 256;

/// What a single pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired chunk sessions whose rows and part files were removed.
    pub sessions_removed: u64,
    /// File rows deleted together with their stored bytes.
    pub files_reclaimed: u64,
    pub errors: u64,
}

pub struct Sweeper {
    metadata: Arc<dyn MetadataStore>,
    backends: BackendSet,
    locks: HashLocks,
}

impl Sweeper {
    pub fn new(metadata: Arc<dyn MetadataStore>, backends: BackendSet, locks: HashLocks) -> Self {
        Self {
            metadata,
            backends,
            locks,
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if let Err(e) = self.sweep_sessions(&mut report).await {
            report.errors += 1;
            tracing::warn!(error = %e, "Failed to list expired chunk sessions");
        }
        if let Err(e) = self.reclaim_files(&mut report).await {
            report.errors += 1;
            tracing::warn!(error = %e, "Failed to list reclaimable files");
        }
        report
    }

    async fn sweep_sessions(&self, report: &mut SweepReport) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        for session in self
            .metadata
            .list_expired_chunk_sessions(now, SWEEP_BATCH)
            .await?
        {
            let upload_id = session.upload_id;
            // The row goes first: a part arriving after this sees an unknown
            // upload instead of writing into a directory being removed.
            match self
                .metadata
                .delete_chunk_session_if_expired(upload_id, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(%upload_id, error = %e, "Failed to delete expired session");
                    continue;
                }
            }
            if let Err(e) = self
                .backends
                .local()
                .delete_prefix(&upload_id.to_string())
                .await
            {
                report.errors += 1;
                tracing::warn!(%upload_id, error = %e, "Failed to remove chunk directory");
            }
            report.sessions_removed += 1;
            SESSIONS_SWEPT.inc();
            tracing::info!(
                %upload_id,
                state = %session.state,
                "Abandoned chunk session swept"
            );
        }
        Ok(())
    }

    async fn reclaim_files(&self, report: &mut SweepReport) -> MetadataResult<()> {
        for candidate in self.metadata.list_reclaimable_files(SWEEP_BATCH).await? {
            match self.reclaim(&candidate).await {
                Ok(true) => {
                    report.files_reclaimed += 1;
                    FILES_RECLAIMED.inc();
                }
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        file_id = candidate.file_id,
                        error = %e,
                        "Failed to reclaim file"
                    );
                }
            }
        }
        Ok(())
    }

    async fn reclaim(&self, candidate: &FileRow) -> Result<bool, crate::ApiError> {
        let hash = candidate.hash()?;
        let _guard = self.locks.lock(hash).await;

        // Re-read under the lock; a migration may have moved it since listing.
        let Some(row) = self.metadata.get_file(candidate.file_id).await? else {
            return Ok(false);
        };
        if !self
            .metadata
            .delete_file_if_unreferenced(row.file_id)
            .await?
        {
            return Ok(false);
        }

        let store = self.backends.get(row.backend()?)?;
        match store.delete(&row.storage_path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(
                    content_hash = %hash,
                    backend = %row.storage_backend,
                    storage_path = %row.storage_path,
                    error = %e,
                    "File row deleted but its bytes could not be removed"
                );
                return Err(e.into());
            }
        }
        tracing::info!(
            content_hash = %hash,
            backend = %row.storage_backend,
            "Unreferenced file reclaimed"
        );
        Ok(true)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let report = self.sweep_once().await;
            if report != SweepReport::default() {
                tracing::info!(
                    sessions_removed = report.sessions_removed,
                    files_reclaimed = report.files_reclaimed,
                    errors = report.errors,
                    "Sweep finished"
                );
            }
        }
        tracing::info!("Sweeper stopped");
    }
}
