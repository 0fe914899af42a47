//! Logical file endpoints: list, inspect, rename, delete, download.

use crate::auth::AuthenticatedUser;
use crate::envelope::{self, Envelope};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::timeouts::bounded;
use axum::Json;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use stash_core::file::{RenameRequest, validate_display_name};
use stash_core::{BackendKind, UserId};
use stash_metadata::models::UserFileView;
use stash_metadata::repos::UserFileRepo;
use stash_storage::StorageError;
use time::OffsetDateTime;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;

static DIGEST: HeaderName = HeaderName::from_static("digest");

/// A user's view of one file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_id: i64,
    pub file_name: String,
    pub content_hash: String,
    pub size: u64,
    pub status: String,
    pub directory_id: Option<i64>,
    pub backend: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TryFrom<UserFileView> for FileEntry {
    type Error = ApiError;

    fn try_from(view: UserFileView) -> ApiResult<Self> {
        Ok(Self {
            file_id: view.user_file_id,
            size: view.size()?,
            file_name: view.display_name,
            content_hash: view.content_hash,
            status: view.status,
            directory_id: view.directory_id,
            backend: view.storage_backend,
            created_at: view.created_at,
            updated_at: view.updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<FileEntry>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedFile {
    pub file_id: i64,
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrl {
    pub url: String,
    pub backend: String,
    /// Seconds the URL stays valid; absent for service-relative URLs.
    pub expires_in: Option<u64>,
}

async fn load_view(state: &AppState, user_id: UserId, file_id: i64) -> ApiResult<UserFileView> {
    let timeout = state.config.server.store_op_timeout();
    bounded(
        timeout,
        "metadata",
        state.metadata.get_user_file(user_id, file_id),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("file {file_id}")))
}

/// GET /v1/files - List the caller's files, newest first.
pub async fn list_files(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<Envelope<FileList>>> {
    let Query(params) = params?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);
    let timeout = state.config.server.store_op_timeout();

    let views = bounded(
        timeout,
        "metadata",
        state.metadata.list_user_files(user_id, limit, offset),
    )
    .await?;
    let total = bounded(timeout, "metadata", state.metadata.count_user_files(user_id)).await?;
    let files = views
        .into_iter()
        .map(FileEntry::try_from)
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(envelope::ok(FileList {
        files,
        total,
        limit,
        offset,
    }))
}

/// GET /v1/files/{file_id}
pub async fn get_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<Envelope<FileEntry>>> {
    let view = load_view(&state, user_id, file_id).await?;
    Ok(envelope::ok(FileEntry::try_from(view)?))
}

/// PUT /v1/files/{file_id} - Rename.
pub async fn rename_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(file_id): Path<i64>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<FileEntry>>> {
    let Json(request) = payload?;
    let name = validate_display_name(&request.file_name)?;
    let view = bounded(
        state.config.server.store_op_timeout(),
        "metadata",
        state.metadata.rename_user_file(user_id, file_id, name),
    )
    .await?;

    tracing::info!(user_id = %user_id, file_id, "Renamed file");
    Ok(envelope::ok(FileEntry::try_from(view)?))
}

/// DELETE /v1/files/{file_id} - Drop the caller's binding.
///
/// Content whose last binding goes away is reclaimed by the sweeper.
pub async fn delete_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<Envelope<DeletedFile>>> {
    let outcome = bounded(
        state.config.server.store_op_timeout(),
        "metadata",
        state.metadata.soft_delete_user_file(user_id, file_id),
    )
    .await?;

    tracing::info!(
        user_id = %user_id,
        file_id,
        physical_file_id = outcome.file_id,
        orphaned = outcome.file_orphaned,
        "Deleted file"
    );
    Ok(envelope::ok(DeletedFile {
        file_id,
        deleted: true,
    }))
}

/// GET /v1/files/{file_id}/url - Where to fetch the bytes.
///
/// Remote content gets a presigned URL; local content (or a backend that
/// cannot presign) gets the service's own download route.
pub async fn file_url(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<Envelope<DownloadUrl>>> {
    let view = load_view(&state, user_id, file_id).await?;
    let backend = view.backend()?;

    if backend.is_remote() {
        let ttl = state.config.ingest.presign_ttl();
        match presign(&state, backend, &view.storage_path).await {
            Ok(url) => {
                return Ok(envelope::ok(DownloadUrl {
                    url,
                    backend: backend.to_string(),
                    expires_in: Some(ttl.as_secs()),
                }));
            }
            Err(ApiError::Storage(StorageError::Unsupported { .. })) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(envelope::ok(DownloadUrl {
        url: format!("/v1/files/{file_id}/download"),
        backend: backend.to_string(),
        expires_in: None,
    }))
}

async fn presign(state: &AppState, backend: BackendKind, key: &str) -> ApiResult<String> {
    let store = state.backends.get(backend)?;
    bounded(
        state.config.server.store_op_timeout(),
        "storage",
        store.presign_download_url(key, state.config.ingest.presign_ttl()),
    )
    .await
}

/// GET /v1/files/{file_id}/download - Stream the bytes.
///
/// Remote content redirects to a presigned URL when the backend supports
/// it, otherwise it is proxied.
pub async fn download_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(file_id): Path<i64>,
) -> ApiResult<Response> {
    let mut view = load_view(&state, user_id, file_id).await?;
    let mut backend = view.backend()?;

    if backend.is_remote() {
        match presign(&state, backend, &view.storage_path).await {
            Ok(url) => {
                let location = HeaderValue::from_str(&url)
                    .map_err(|_| ApiError::Internal("presigned URL is not a valid header".into()))?;
                return Ok((StatusCode::TEMPORARY_REDIRECT, [(LOCATION, location)]).into_response());
            }
            Err(ApiError::Storage(StorageError::Unsupported { .. })) => {}
            Err(e) => return Err(e),
        }
    }

    let stream = match open_stream(&state, backend, &view.storage_path).await {
        Ok(stream) => stream,
        // Migration may have moved the bytes after the row was read.
        Err(ApiError::Storage(StorageError::NotFound(_))) if backend == BackendKind::Local => {
            view = load_view(&state, user_id, file_id).await?;
            backend = view.backend()?;
            if backend == BackendKind::Local {
                return Err(ApiError::NotFound(format!("content of file {file_id}")));
            }
            open_stream(&state, backend, &view.storage_path).await?
        }
        Err(e) => return Err(e),
    };

    let hash = view.hash()?;
    let size = view.size()?;
    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        utf8_percent_encode(&view.display_name, NON_ALPHANUMERIC)
    );
    let digest = format!("sha-256={}", hash.to_base64());
    let body_stream = stream.map(|result| result.map_err(|e| std::io::Error::other(e.to_string())));

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_LENGTH, size.to_string()),
            (CONTENT_DISPOSITION, disposition),
            (DIGEST.clone(), digest),
        ],
        Body::from_stream(body_stream),
    )
        .into_response())
}

async fn open_stream(
    state: &AppState,
    backend: BackendKind,
    key: &str,
) -> ApiResult<stash_storage::ByteStream> {
    let store = state.backends.get(backend)?;
    bounded(
        state.config.server.store_op_timeout(),
        "storage",
        store.get_stream(key),
    )
    .await
}
