//! Metadata store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::{ChunkSessionRepo, FileRepo, TransferQueueRepo, UserFileRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default SQLite busy timeout, in seconds.
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    FileRepo + UserFileRepo + ChunkSessionRepo + TransferQueueRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(query_timeout_secs));

        // Writers serialize on a single connection; every multi-statement
        // operation below runs in one transaction on it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs,
            "opened sqlite metadata store"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::error::{MetadataError, is_unique_violation};
    use crate::models::*;
    use sqlx::SqliteConnection;
    use stash_core::{
        ChunkSession, ContentHash, FileStatus, QueuedTransfer, TransferState, TransferTask,
        UploadId, UserId,
    };
    use time::OffsetDateTime;

    const USER_FILE_VIEW_SELECT: &str = r#"
        SELECT uf.user_file_id, uf.user_id, uf.file_id, uf.display_name, uf.directory_id,
               uf.status, uf.created_at, uf.updated_at,
               f.content_hash, f.size_bytes, f.storage_backend, f.storage_path
        FROM user_files uf
        JOIN files f ON f.file_id = uf.file_id
    "#;

    async fn insert_binding(
        conn: &mut SqliteConnection,
        file_id: i64,
        binding: &NewBinding,
        now: OffsetDateTime,
    ) -> MetadataResult<UserFileRow> {
        let inserted = sqlx::query_as::<_, UserFileRow>(
            r#"
            INSERT INTO user_files (
                user_id, file_id, display_name, directory_id, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'active', ?, ?)
            RETURNING *
            "#,
        )
        .bind(binding.user_id.get())
        .bind(file_id)
        .bind(&binding.display_name)
        .bind(binding.directory_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                "user {} already has file {} named '{}'",
                binding.user_id, file_id, binding.display_name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_transfer(
        conn: &mut SqliteConnection,
        task: &TransferTask,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_tasks (
                content_hash, source_location, dest_location, dest_backend,
                state, attempts, available_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT (content_hash, dest_backend) DO NOTHING
            "#,
        )
        .bind(task.content_hash.to_hex())
        .bind(&task.source_location)
        .bind(&task.dest_location)
        .bind(task.dest_backend.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load a live binding for mutation, rejecting locked ones.
    async fn mutable_binding(
        conn: &mut SqliteConnection,
        user_id: UserId,
        user_file_id: i64,
        action: &str,
    ) -> MetadataResult<UserFileRow> {
        let row = sqlx::query_as::<_, UserFileRow>(
            "SELECT * FROM user_files WHERE user_file_id = ? AND user_id = ? AND status != 'deleted'",
        )
        .bind(user_file_id)
        .bind(user_id.get())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("file {user_file_id} not found")))?;

        if row.status()? == FileStatus::Locked {
            return Err(MetadataError::InvalidStateTransition {
                from: row.status.clone(),
                to: action.to_string(),
            });
        }
        Ok(row)
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn get_file(&self, file_id: i64) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_file_by_hash(&self, hash: &ContentHash) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE content_hash = ?")
                .bind(hash.to_hex())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn create_file_with_binding(
            &self,
            file: &NewFile,
            binding: &NewBinding,
            transfer: Option<&TransferTask>,
        ) -> MetadataResult<(FileRow, UserFileRow)> {
            let now = OffsetDateTime::now_utc();
            let size = to_i64(file.size, "file size")?;
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query_as::<_, FileRow>(
                r#"
                INSERT INTO files (
                    content_hash, size_bytes, storage_backend, storage_path, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(file.content_hash.to_hex())
            .bind(size)
            .bind(file.storage_backend.as_str())
            .bind(&file.storage_path)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await;

            let file_row = match inserted {
                Ok(row) => row,
                Err(e) if is_unique_violation(&e) => {
                    return Err(MetadataError::AlreadyExists(format!(
                        "file with hash {} already exists",
                        file.content_hash
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            let binding_row = insert_binding(&mut *tx, file_row.file_id, binding, now).await?;

            if let Some(task) = transfer {
                insert_transfer(&mut *tx, task, now).await?;
            }

            tx.commit().await?;
            Ok((file_row, binding_row))
        }

        async fn update_file_location(
            &self,
            hash: &ContentHash,
            from: &Location,
            to: &Location,
        ) -> MetadataResult<LocationUpdate> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE files SET storage_backend = ?, storage_path = ?, updated_at = ?
                WHERE content_hash = ? AND storage_backend = ? AND storage_path = ?
                "#,
            )
            .bind(to.backend.as_str())
            .bind(&to.path)
            .bind(now)
            .bind(hash.to_hex())
            .bind(from.backend.as_str())
            .bind(&from.path)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                tx.commit().await?;
                return Ok(LocationUpdate::Moved);
            }

            let current =
                sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE content_hash = ?")
                    .bind(hash.to_hex())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("file with hash {hash}")))?;
            tx.commit().await?;

            if current.storage_backend == to.backend.as_str() && current.storage_path == to.path {
                return Ok(LocationUpdate::AlreadyAtDestination);
            }

            Err(MetadataError::Conflict(format!(
                "file {hash} is at {}:{}, expected {}:{}",
                current.storage_backend, current.storage_path, from.backend, from.path
            )))
        }

        async fn list_reclaimable_files(&self, limit: u32) -> MetadataResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(
                r#"
                SELECT * FROM files f
                WHERE f.deleted_at IS NOT NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM user_files uf
                      WHERE uf.file_id = f.file_id AND uf.status != 'deleted'
                  )
                ORDER BY f.deleted_at, f.file_id
                LIMIT ?
                "#,
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_file_if_unreferenced(&self, file_id: i64) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let deleted = sqlx::query_as::<_, FileRow>(
                r#"
                DELETE FROM files
                WHERE file_id = ?
                  AND deleted_at IS NOT NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM user_files uf
                      WHERE uf.file_id = files.file_id AND uf.status != 'deleted'
                  )
                RETURNING *
                "#,
            )
            .bind(file_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = deleted else {
                tx.commit().await?;
                return Ok(false);
            };

            // Queued transfers for the content have nothing left to move.
            sqlx::query("DELETE FROM transfer_tasks WHERE content_hash = ?")
                .bind(&row.content_hash)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(true)
        }
    }

    #[async_trait]
    impl UserFileRepo for SqliteStore {
        async fn bind_file(
            &self,
            file_id: i64,
            binding: &NewBinding,
        ) -> MetadataResult<(UserFileRow, bool)> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, UserFileRow>(
                r#"
                SELECT * FROM user_files
                WHERE user_id = ? AND file_id = ? AND display_name = ? AND status != 'deleted'
                "#,
            )
            .bind(binding.user_id.get())
            .bind(file_id)
            .bind(&binding.display_name)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok((row, false));
            }

            let revived =
                sqlx::query("UPDATE files SET deleted_at = NULL, updated_at = ? WHERE file_id = ?")
                    .bind(now)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;
            if revived.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("file {file_id} not found")));
            }

            let row = insert_binding(&mut *tx, file_id, binding, now).await?;
            tx.commit().await?;
            Ok((row, true))
        }

        async fn get_user_file(
            &self,
            user_id: UserId,
            user_file_id: i64,
        ) -> MetadataResult<Option<UserFileView>> {
            let sql = format!(
                "{USER_FILE_VIEW_SELECT} WHERE uf.user_file_id = ? AND uf.user_id = ? AND uf.status != 'deleted'"
            );
            let row = sqlx::query_as::<_, UserFileView>(&sql)
                .bind(user_file_id)
                .bind(user_id.get())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_user_files(
            &self,
            user_id: UserId,
            limit: u32,
            offset: u32,
        ) -> MetadataResult<Vec<UserFileView>> {
            let sql = format!(
                "{USER_FILE_VIEW_SELECT} WHERE uf.user_id = ? AND uf.status != 'deleted' \
                 ORDER BY uf.created_at DESC, uf.user_file_id DESC LIMIT ? OFFSET ?"
            );
            let rows = sqlx::query_as::<_, UserFileView>(&sql)
                .bind(user_id.get())
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn count_user_files(&self, user_id: UserId) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM user_files WHERE user_id = ? AND status != 'deleted'",
            )
            .bind(user_id.get())
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }

        async fn rename_user_file(
            &self,
            user_id: UserId,
            user_file_id: i64,
            display_name: &str,
        ) -> MetadataResult<UserFileView> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let row = mutable_binding(&mut *tx, user_id, user_file_id, "renamed").await?;

            if row.display_name != display_name {
                let updated = sqlx::query(
                    "UPDATE user_files SET display_name = ?, updated_at = ? WHERE user_file_id = ?",
                )
                .bind(display_name)
                .bind(now)
                .bind(user_file_id)
                .execute(&mut *tx)
                .await;

                match updated {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => {
                        return Err(MetadataError::AlreadyExists(format!(
                            "a file named '{display_name}' with the same content already exists"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let sql = format!("{USER_FILE_VIEW_SELECT} WHERE uf.user_file_id = ?");
            let view = sqlx::query_as::<_, UserFileView>(&sql)
                .bind(user_file_id)
                .fetch_one(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(view)
        }

        async fn soft_delete_user_file(
            &self,
            user_id: UserId,
            user_file_id: i64,
        ) -> MetadataResult<UnbindOutcome> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let row = mutable_binding(&mut *tx, user_id, user_file_id, "deleted").await?;

            sqlx::query(
                "UPDATE user_files SET status = 'deleted', updated_at = ? WHERE user_file_id = ?",
            )
            .bind(now)
            .bind(user_file_id)
            .execute(&mut *tx)
            .await?;

            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM user_files WHERE file_id = ? AND status != 'deleted'",
            )
            .bind(row.file_id)
            .fetch_one(&mut *tx)
            .await?;

            let file_orphaned = remaining == 0;
            if file_orphaned {
                sqlx::query("UPDATE files SET deleted_at = ?, updated_at = ? WHERE file_id = ?")
                    .bind(now)
                    .bind(now)
                    .bind(row.file_id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(UnbindOutcome {
                file_id: row.file_id,
                file_orphaned,
            })
        }

        async fn set_user_file_status(
            &self,
            user_file_id: i64,
            status: FileStatus,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE user_files SET status = ?, updated_at = ? WHERE user_file_id = ?",
            )
            .bind(status.as_str())
            .bind(OffsetDateTime::now_utc())
            .bind(user_file_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "file {user_file_id} not found"
                )));
            }
            Ok(())
        }

        async fn count_file_refs(&self, file_id: i64) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM user_files WHERE file_id = ? AND status != 'deleted'",
            )
            .bind(file_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl ChunkSessionRepo for SqliteStore {
        async fn create_chunk_session(&self, session: &ChunkSession) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO chunk_sessions (
                    upload_id, user_id, content_hash, total_size, chunk_size, chunk_count,
                    state, created_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(*session.upload_id.as_uuid())
            .bind(session.user_id.get())
            .bind(session.content_hash.to_hex())
            .bind(to_i64(session.total_size, "total size")?)
            .bind(to_i64(session.chunk_size, "chunk size")?)
            .bind(to_i64(session.chunk_count, "chunk count")?)
            .bind(session.state.as_str())
            .bind(session.created_at)
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                    "upload {} already exists",
                    session.upload_id
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_chunk_session(
            &self,
            upload_id: UploadId,
        ) -> MetadataResult<Option<ChunkSession>> {
            let row = sqlx::query_as::<_, ChunkSessionRow>(
                "SELECT * FROM chunk_sessions WHERE upload_id = ?",
            )
            .bind(*upload_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
            row.map(ChunkSession::try_from).transpose()
        }

        async fn mark_chunk_received(
            &self,
            upload_id: UploadId,
            chunk_index: u64,
            received_at: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<PartMark> {
            let index = to_i64(chunk_index, "chunk index")?;
            let mut tx = self.pool.begin().await?;

            let touched = sqlx::query(
                r#"
                UPDATE chunk_sessions SET state = 'receiving', expires_at = ?, updated_at = ?
                WHERE upload_id = ? AND state IN ('initialized', 'receiving')
                "#,
            )
            .bind(expires_at)
            .bind(received_at)
            .bind(*upload_id.as_uuid())
            .execute(&mut *tx)
            .await?;

            if touched.rows_affected() == 0 {
                let state: Option<String> =
                    sqlx::query_scalar("SELECT state FROM chunk_sessions WHERE upload_id = ?")
                        .bind(*upload_id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await?;
                return Err(match state {
                    None => MetadataError::NotFound(format!("upload {upload_id} not found")),
                    Some(from) => MetadataError::InvalidStateTransition {
                        from,
                        to: "receiving".to_string(),
                    },
                });
            }

            let existed: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM chunk_session_parts WHERE upload_id = ? AND chunk_index = ?)",
            )
            .bind(*upload_id.as_uuid())
            .bind(index)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO chunk_session_parts (upload_id, chunk_index, received_at)
                VALUES (?, ?, ?)
                ON CONFLICT (upload_id, chunk_index) DO UPDATE SET received_at = excluded.received_at
                "#,
            )
            .bind(*upload_id.as_uuid())
            .bind(index)
            .bind(received_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(if existed {
                PartMark::Replaced
            } else {
                PartMark::Inserted
            })
        }

        async fn received_chunk_indices(&self, upload_id: UploadId) -> MetadataResult<Vec<u64>> {
            let indices: Vec<i64> = sqlx::query_scalar(
                "SELECT chunk_index FROM chunk_session_parts WHERE upload_id = ? ORDER BY chunk_index",
            )
            .bind(*upload_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
            Ok(indices.into_iter().map(|i| i as u64).collect())
        }

        async fn begin_completing(
            &self,
            upload_id: UploadId,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE chunk_sessions SET state = 'completing', updated_at = ?, expires_at = ?
                WHERE upload_id = ? AND state IN ('initialized', 'receiving')
                "#,
            )
            .bind(now)
            .bind(expires_at)
            .bind(*upload_id.as_uuid())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn abort_completing(
            &self,
            upload_id: UploadId,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE chunk_sessions SET state = 'receiving', updated_at = ? WHERE upload_id = ? AND state = 'completing'",
            )
            .bind(now)
            .bind(*upload_id.as_uuid())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn delete_chunk_session(&self, upload_id: UploadId) -> MetadataResult<()> {
            sqlx::query("DELETE FROM chunk_sessions WHERE upload_id = ?")
                .bind(*upload_id.as_uuid())
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn delete_chunk_session_if_expired(
            &self,
            upload_id: UploadId,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result =
                sqlx::query("DELETE FROM chunk_sessions WHERE upload_id = ? AND expires_at <= ?")
                    .bind(*upload_id.as_uuid())
                    .bind(now)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_expired_chunk_sessions(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<ChunkSession>> {
            let rows = sqlx::query_as::<_, ChunkSessionRow>(
                "SELECT * FROM chunk_sessions WHERE expires_at <= ? ORDER BY expires_at LIMIT ?",
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(ChunkSession::try_from).collect()
        }
    }

    #[async_trait]
    impl TransferQueueRepo for SqliteStore {
        async fn enqueue_transfer(
            &self,
            task: &TransferTask,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut conn = self.pool.acquire().await?;
            insert_transfer(&mut *conn, task, now).await
        }

        async fn claim_next_transfer(
            &self,
            now: OffsetDateTime,
            lease_until: OffsetDateTime,
        ) -> MetadataResult<Option<QueuedTransfer>> {
            let row = sqlx::query_as::<_, TransferTaskRow>(
                r#"
                UPDATE transfer_tasks
                SET state = 'leased', attempts = attempts + 1, lease_expires_at = ?, updated_at = ?
                WHERE task_id = (
                    SELECT task_id FROM transfer_tasks
                    WHERE (state = 'pending' AND available_at <= ?)
                       OR (state = 'leased' AND lease_expires_at <= ?)
                    ORDER BY available_at, task_id
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(lease_until)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            row.map(QueuedTransfer::try_from).transpose()
        }

        async fn ack_transfer(&self, task_id: i64) -> MetadataResult<()> {
            sqlx::query("DELETE FROM transfer_tasks WHERE task_id = ?")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn nack_transfer(
            &self,
            task_id: i64,
            error: &str,
            retry_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET state = 'pending', available_at = ?, lease_expires_at = NULL,
                    last_error = ?, updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(OffsetDateTime::now_utc())
            .bind(task_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("transfer task {task_id}")));
            }
            Ok(())
        }

        async fn dead_letter_transfer(
            &self,
            task_id: i64,
            error: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET state = 'dead', lease_expires_at = NULL, last_error = ?, updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("transfer task {task_id}")));
            }
            Ok(())
        }

        async fn list_dead_transfers(&self, limit: u32) -> MetadataResult<Vec<QueuedTransfer>> {
            let rows = sqlx::query_as::<_, TransferTaskRow>(
                "SELECT * FROM transfer_tasks WHERE state = 'dead' ORDER BY updated_at, task_id LIMIT ?",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(QueuedTransfer::try_from).collect()
        }

        async fn requeue_dead_transfer(
            &self,
            task_id: i64,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET state = 'pending', attempts = 0, available_at = ?, lease_expires_at = NULL,
                    updated_at = ?
                WHERE task_id = ? AND state = 'dead'
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn count_transfers(&self, state: TransferState) -> MetadataResult<u64> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM transfer_tasks WHERE state = ?")
                    .bind(state.as_str())
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count as u64)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Physical files, one per distinct content hash
CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    size_bytes INTEGER NOT NULL,
    storage_backend TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_deleted ON files(deleted_at) WHERE deleted_at IS NOT NULL;

-- Per-user logical files
CREATE TABLE IF NOT EXISTS user_files (
    user_file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    display_name TEXT NOT NULL,
    directory_id INTEGER,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_user_files_live
    ON user_files(user_id, file_id, display_name) WHERE status != 'deleted';
CREATE INDEX IF NOT EXISTS idx_user_files_user ON user_files(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_user_files_file ON user_files(file_id);

-- Chunked upload sessions
CREATE TABLE IF NOT EXISTS chunk_sessions (
    upload_id BLOB PRIMARY KEY,
    user_id INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunk_sessions_expires ON chunk_sessions(expires_at);

CREATE TABLE IF NOT EXISTS chunk_session_parts (
    upload_id BLOB NOT NULL REFERENCES chunk_sessions(upload_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, chunk_index)
);

-- Durable local-to-remote transfer queue
CREATE TABLE IF NOT EXISTS transfer_tasks (
    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL,
    source_location TEXT NOT NULL,
    dest_location TEXT NOT NULL,
    dest_backend TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at TEXT NOT NULL,
    lease_expires_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (content_hash, dest_backend)
);
CREATE INDEX IF NOT EXISTS idx_transfer_tasks_ready ON transfer_tasks(state, available_at);
"#;
