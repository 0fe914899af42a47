//! Local-to-remote migration.
//!
//! A [`TransferTask`] names a file staged on local disk and the remote key it
//! should end up under. [`Migrator::migrate`] performs one move and is safe
//! to repeat: every step either overwrites with identical content or checks
//! the recorded location first. [`MigrationWorker`] drains the durable queue,
//! retrying failures with backoff and dead-lettering tasks that keep failing.
//!
//! The local copy is removed only after the remote put succeeded and the
//! location update committed, so at every point at least one copy is named
//! by the file row.
//!
//! Every metadata call and remote request is time-bounded. An elapsed step
//! fails the attempt like any other error, so a stuck backend connection
//! costs one retry instead of the consumer.

use crate::locks::HashLocks;
use crate::metrics::{
    MIGRATIONS_DEAD_LETTERED, MIGRATIONS_FAILED, MIGRATIONS_SUCCEEDED, PENDING_TRANSFERS,
    STORE_OP_TIMEOUTS,
};
use stash_core::config::MigrationConfig;
use stash_core::{BackendKind, QueuedTransfer, TransferState, TransferTask};
use stash_metadata::models::Location;
use stash_metadata::repos::{FileRepo, TransferQueueRepo};
use stash_metadata::{MetadataError, MetadataResult, MetadataStore};
use stash_storage::{BackendSet, ObjectStore, StorageError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Why a migration attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("local source {0} is missing")]
    LocalSourceMissing(String),

    #[error("file {hash} is at {backend}:{path}, not at the task source")]
    Conflict {
        hash: String,
        backend: String,
        path: String,
    },

    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
}

/// Await one migration step, giving up after `limit`.
async fn bounded_step<T, E, F>(
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, MigrationError>
where
    F: Future<Output = Result<T, E>>,
    MigrationError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(MigrationError::from),
        Err(_) => {
            STORE_OP_TIMEOUTS.with_label_values(&[operation]).inc();
            Err(MigrationError::Timeout { operation, limit })
        }
    }
}

/// Metadata bookkeeping for the queue itself, bounded like any store call.
async fn bounded_metadata<T, F>(limit: Duration, fut: F) -> MetadataResult<T>
where
    F: Future<Output = MetadataResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            STORE_OP_TIMEOUTS.with_label_values(&["metadata"]).inc();
            Err(MetadataError::Internal(format!(
                "transfer queue call timed out after {limit:?}"
            )))
        }
    }
}

/// Result of a successful [`Migrator::migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Bytes were uploaded and the file row now points at the destination.
    Migrated { bytes: u64 },
    /// A previous delivery of the same task already finished the move.
    AlreadyMigrated,
    /// The file was reclaimed; there is nothing left to move.
    FileGone,
}

pub struct Migrator {
    metadata: Arc<dyn MetadataStore>,
    backends: BackendSet,
    locks: HashLocks,
    op_timeout: Duration,
    put_timeout: Duration,
}

impl Migrator {
    /// `op_timeout` bounds metadata calls and small remote requests;
    /// `put_timeout` bounds the upload of the file body.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        backends: BackendSet,
        locks: HashLocks,
        op_timeout: Duration,
        put_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            backends,
            locks,
            op_timeout,
            put_timeout,
        }
    }

    #[tracing::instrument(
        skip(self, task),
        fields(content_hash = %task.content_hash, dest_backend = %task.dest_backend)
    )]
    pub async fn migrate(&self, task: &TransferTask) -> Result<MigrationOutcome, MigrationError> {
        let hash = task.content_hash;
        let source = Location::new(BackendKind::Local, task.source_location.clone());
        let dest = Location::new(task.dest_backend, task.dest_location.clone());

        let found = bounded_step(
            self.op_timeout,
            "metadata",
            self.metadata.find_file_by_hash(&hash),
        )
        .await?;
        let Some(row) = found else {
            return Ok(MigrationOutcome::FileGone);
        };
        let current = Location::new(row.backend()?, row.storage_path.clone());
        if current == dest {
            self.remove_local_source(&task.source_location).await;
            return Ok(MigrationOutcome::AlreadyMigrated);
        }
        if current != source {
            return Err(MigrationError::Conflict {
                hash: hash.to_hex(),
                backend: current.backend.to_string(),
                path: current.path,
            });
        }

        let local = self.backends.local();
        if !bounded_step(self.op_timeout, "storage", local.exists(&task.source_location)).await? {
            return Err(MigrationError::LocalSourceMissing(
                task.source_location.clone(),
            ));
        }
        let source_path = local.key_path(&task.source_location).await?;
        let remote = self.backends.get(task.dest_backend)?;
        let bytes = bounded_step(
            self.put_timeout,
            "remote_put",
            remote.put_file(&task.dest_location, &source_path),
        )
        .await?;

        let _guard = self.locks.lock(hash).await;
        match bounded_step(
            self.op_timeout,
            "metadata",
            self.metadata.update_file_location(&hash, &source, &dest),
        )
        .await
        {
            Ok(_) => {}
            Err(MigrationError::Metadata(MetadataError::NotFound(_))) => {
                // Reclaimed while uploading; the remote copy has no owner.
                if let Err(e) = bounded_step(
                    self.op_timeout,
                    "storage",
                    remote.delete(&task.dest_location),
                )
                .await
                    && !matches!(&e, MigrationError::Storage(se) if se.is_not_found())
                {
                    tracing::warn!(
                        dest_location = %task.dest_location,
                        error = %e,
                        "Failed to remove remote copy of reclaimed file"
                    );
                }
                return Ok(MigrationOutcome::FileGone);
            }
            Err(e) => return Err(e),
        }
        self.remove_local_source(&task.source_location).await;

        tracing::info!(bytes, dest_location = %task.dest_location, "File migrated");
        Ok(MigrationOutcome::Migrated { bytes })
    }

    async fn remove_local_source(&self, key: &str) {
        match self.backends.local().delete(key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to remove migrated local copy");
            }
        }
    }
}

/// Long-running consumer of the transfer queue.
pub struct MigrationWorker {
    metadata: Arc<dyn MetadataStore>,
    migrator: Arc<Migrator>,
    config: MigrationConfig,
    op_timeout: Duration,
}

impl MigrationWorker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        migrator: Arc<Migrator>,
        config: MigrationConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            migrator,
            config,
            op_timeout,
        }
    }

    /// Claim and process one task. Returns `false` when the queue had nothing
    /// available.
    pub async fn process_next(&self) -> MetadataResult<bool> {
        self.process_next_until(&CancellationToken::new()).await
    }

    /// Like [`process_next`](Self::process_next), but abandons the task when
    /// `shutdown` fires. An abandoned task stays leased and is redelivered
    /// once the lease lapses.
    async fn process_next_until(&self, shutdown: &CancellationToken) -> MetadataResult<bool> {
        let now = OffsetDateTime::now_utc();
        let claimed = bounded_metadata(
            self.op_timeout,
            self.metadata
                .claim_next_transfer(now, now + self.config.lease()),
        )
        .await?;
        let Some(queued) = claimed else {
            return Ok(false);
        };

        // Run in its own task so a panic fails this delivery, not the loop.
        let migrator = self.migrator.clone();
        let task = queued.task.clone();
        let mut handle = tokio::spawn(async move { migrator.migrate(&task).await });
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = shutdown.cancelled() => {
                handle.abort();
                tracing::info!(
                    task_id = queued.task_id,
                    "Shutting down mid-transfer, task left for redelivery"
                );
                return Ok(true);
            }
        };

        match joined {
            Ok(Ok(outcome)) => {
                bounded_metadata(self.op_timeout, self.metadata.ack_transfer(queued.task_id))
                    .await?;
                MIGRATIONS_SUCCEEDED.inc();
                tracing::debug!(task_id = queued.task_id, ?outcome, "Transfer task done");
            }
            Ok(Err(e)) => self.record_failure(&queued, &e.to_string()).await?,
            Err(join_err) => {
                tracing::error!(
                    task_id = queued.task_id,
                    panic = ?join_err,
                    "Migration task panicked"
                );
                self.record_failure(&queued, &format!("migration panicked: {join_err}"))
                    .await?
            }
        }
        Ok(true)
    }

    async fn record_failure(&self, queued: &QueuedTransfer, error: &str) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        if queued.attempts >= self.config.max_attempts {
            bounded_metadata(
                self.op_timeout,
                self.metadata.dead_letter_transfer(queued.task_id, error, now),
            )
            .await?;
            MIGRATIONS_DEAD_LETTERED.inc();
            tracing::error!(
                task_id = queued.task_id,
                content_hash = %queued.task.content_hash,
                attempts = queued.attempts,
                error_class = "data_loss_risk",
                error,
                "Transfer task dead-lettered; file remains only on local disk"
            );
        } else {
            let retry_at = now + self.config.backoff(queued.attempts);
            bounded_metadata(
                self.op_timeout,
                self.metadata.nack_transfer(queued.task_id, error, retry_at),
            )
            .await?;
            MIGRATIONS_FAILED.inc();
            tracing::warn!(
                task_id = queued.task_id,
                content_hash = %queued.task.content_hash,
                attempts = queued.attempts,
                retry_at = %retry_at,
                error_class = "transient_storage",
                error,
                "Transfer task failed, will retry"
            );
        }
        Ok(())
    }

    async fn refresh_pending_gauge(&self) {
        let pending = bounded_metadata(
            self.op_timeout,
            self.metadata.count_transfers(TransferState::Pending),
        )
        .await;
        let leased = bounded_metadata(
            self.op_timeout,
            self.metadata.count_transfers(TransferState::Leased),
        )
        .await;
        if let (Ok(pending), Ok(leased)) = (pending, leased) {
            PENDING_TRANSFERS.set(i64::try_from(pending + leased).unwrap_or(i64::MAX));
        }
    }

    /// Consume tasks until `shutdown` is cancelled. Errors are logged and the
    /// loop continues.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_attempts = self.config.max_attempts,
            "Migration worker started"
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let idle = match self.process_next_until(&shutdown).await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll transfer queue");
                    true
                }
            };
            if idle {
                self.refresh_pending_gauge().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }
        tracing::info!("Migration worker stopped");
    }
}
