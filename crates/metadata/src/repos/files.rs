//! Physical file repository.

use crate::error::MetadataResult;
use crate::models::{FileRow, Location, LocationUpdate, NewBinding, NewFile, UserFileRow};
use async_trait::async_trait;
use stash_core::{ContentHash, TransferTask};

/// Repository for content-addressed file records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Get a file by ID.
    async fn get_file(&self, file_id: i64) -> MetadataResult<Option<FileRow>>;

    /// Look up the file holding the given content, if any.
    ///
    /// Files awaiting reclaim (`deleted_at` set) are returned too; binding to
    /// one of them revives it.
    async fn find_file_by_hash(&self, hash: &ContentHash) -> MetadataResult<Option<FileRow>>;

    /// Create a file, its first binding and an optional transfer task in one
    /// transaction.
    ///
    /// Returns `AlreadyExists` if a file with the same content hash exists;
    /// nothing is written in that case.
    async fn create_file_with_binding(
        &self,
        file: &NewFile,
        binding: &NewBinding,
        transfer: Option<&TransferTask>,
    ) -> MetadataResult<(FileRow, UserFileRow)>;

    /// Move a file's recorded location from `from` to `to`.
    ///
    /// Applies only if the file is currently at `from`. If it is already at
    /// `to` this is a no-op. Any other current location yields `Conflict`.
    async fn update_file_location(
        &self,
        hash: &ContentHash,
        from: &Location,
        to: &Location,
    ) -> MetadataResult<LocationUpdate>;

    /// Files with no referencing binding that were marked for reclaim.
    async fn list_reclaimable_files(&self, limit: u32) -> MetadataResult<Vec<FileRow>>;

    /// Delete a file row if, at the time of deletion, no binding references it.
    ///
    /// Returns `true` when the row was removed.
    async fn delete_file_if_unreferenced(&self, file_id: i64) -> MetadataResult<bool>;
}
