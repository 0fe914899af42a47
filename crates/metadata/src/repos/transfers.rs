//! Durable transfer queue repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use stash_core::{QueuedTransfer, TransferState, TransferTask};
use time::OffsetDateTime;

/// Repository for the local-to-remote transfer queue.
///
/// Delivery is at-least-once: a leased task whose lease expires becomes
/// claimable again.
#[async_trait]
pub trait TransferQueueRepo: Send + Sync {
    /// Enqueue a task. At most one task exists per (content hash, destination
    /// backend); returns `false` if one was already queued.
    async fn enqueue_transfer(
        &self,
        task: &TransferTask,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Lease the next available task until `lease_until`, bumping its attempt
    /// count.
    async fn claim_next_transfer(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<QueuedTransfer>>;

    /// Remove a finished task.
    async fn ack_transfer(&self, task_id: i64) -> MetadataResult<()>;

    /// Return a leased task to the queue, available again at `retry_at`.
    async fn nack_transfer(
        &self,
        task_id: i64,
        error: &str,
        retry_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Park a task in the dead-letter state.
    async fn dead_letter_transfer(
        &self,
        task_id: i64,
        error: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Dead-lettered tasks, oldest first.
    async fn list_dead_transfers(&self, limit: u32) -> MetadataResult<Vec<QueuedTransfer>>;

    /// Move a dead-lettered task back to pending with a fresh attempt count.
    /// Returns `false` if no such dead task exists.
    async fn requeue_dead_transfer(
        &self,
        task_id: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Number of tasks in a state.
    async fn count_transfers(&self, state: TransferState) -> MetadataResult<u64>;
}
