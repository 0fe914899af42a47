//! User file binding repository.

use crate::error::MetadataResult;
use crate::models::{NewBinding, UnbindOutcome, UserFileRow, UserFileView};
use async_trait::async_trait;
use stash_core::{FileStatus, UserId};

/// Repository for per-user logical files.
#[async_trait]
pub trait UserFileRepo: Send + Sync {
    /// Bind a user to an existing file.
    ///
    /// Idempotent on `(user, file, display name)`: an existing live binding is
    /// returned with `false`. Otherwise a new binding is created, the file's
    /// reclaim mark is cleared, and `true` is returned.
    async fn bind_file(
        &self,
        file_id: i64,
        binding: &NewBinding,
    ) -> MetadataResult<(UserFileRow, bool)>;

    /// Get a live (not deleted) binding owned by `user_id`.
    async fn get_user_file(
        &self,
        user_id: UserId,
        user_file_id: i64,
    ) -> MetadataResult<Option<UserFileView>>;

    /// List a user's live bindings, newest first.
    async fn list_user_files(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> MetadataResult<Vec<UserFileView>>;

    /// Count a user's live bindings.
    async fn count_user_files(&self, user_id: UserId) -> MetadataResult<u64>;

    /// Change a binding's display name.
    ///
    /// `NotFound` if the binding is missing or deleted, `InvalidStateTransition`
    /// if it is locked, `AlreadyExists` if the user already has a live binding
    /// to the same file under that name.
    async fn rename_user_file(
        &self,
        user_id: UserId,
        user_file_id: i64,
        display_name: &str,
    ) -> MetadataResult<UserFileView>;

    /// Mark a binding deleted. When no live binding to the file remains, the
    /// file is marked for reclaim in the same transaction.
    async fn soft_delete_user_file(
        &self,
        user_id: UserId,
        user_file_id: i64,
    ) -> MetadataResult<UnbindOutcome>;

    /// Set a binding's status directly.
    async fn set_user_file_status(
        &self,
        user_file_id: i64,
        status: FileStatus,
    ) -> MetadataResult<()>;

    /// Number of bindings that hold a reference to the file.
    async fn count_file_refs(&self, file_id: i64) -> MetadataResult<u64>;
}
