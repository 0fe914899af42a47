//! Upload endpoints: single-shot, chunked and rapid (hash-only).

use crate::auth::AuthenticatedUser;
use crate::envelope::{self, Envelope};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use stash_core::upload::{
    ChunkPartResponse, CompleteChunkRequest, InitChunkRequest, InitChunkResponse,
    RapidCheckRequest,
};
use stash_core::{FileInfo, UploadId};

fn parse_directory_id(text: &str) -> ApiResult<Option<i64>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<i64>()
        .map(Some)
        .map_err(|_| ApiError::BadRequest(format!("invalid directoryId: {text:?}")))
}

fn parse_chunk_index(text: &str) -> ApiResult<u64> {
    text.trim().parse::<u64>().map_err(|_| {
        ApiError::BadRequest(format!(
            "chunkIndex must be a non-negative integer, got {text:?}"
        ))
    })
}

/// POST /v1/upload - Upload a whole file in one multipart request.
///
/// Fields: `file` (the bytes; its filename is the default display name),
/// optional `fileName` and `directoryId`.
pub async fn upload_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Envelope<FileInfo>>> {
    let mut multipart = multipart?;
    let mut staged = None;
    let mut part_file_name = None;
    let mut file_name = None;
    let mut directory_id = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                if staged.is_some() {
                    return Err(ApiError::BadRequest(
                        "only one file field is allowed".to_string(),
                    ));
                }
                part_file_name = field.file_name().map(str::to_string);
                let mut writer = state.ingest.begin().await?;
                while let Some(bytes) = field.chunk().await? {
                    writer.write(&bytes).await?;
                }
                staged = Some(writer.finish().await?);
            }
            Some("fileName") => file_name = Some(field.text().await?),
            Some("directoryId") => directory_id = parse_directory_id(&field.text().await?)?,
            _ => {}
        }
    }

    let content =
        staged.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;
    let file_name = file_name
        .or(part_file_name)
        .ok_or_else(|| ApiError::BadRequest("missing fileName".to_string()))?;

    let info = state
        .ingest
        .commit(user_id, &file_name, directory_id, content)
        .await?;
    Ok(envelope::ok(info))
}

/// POST /v1/chunk/init - Declare a chunked upload.
pub async fn init_chunk_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<InitChunkRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<InitChunkResponse>>> {
    let Json(request) = payload?;
    let response = state.chunks.init(user_id, &request).await?;
    Ok(envelope::ok(response))
}

/// POST /v1/chunk/part - Send one chunk.
///
/// Multipart fields `uploadId` and `chunkIndex` must precede the `file`
/// field carrying the chunk bytes, so the request can be rejected before
/// its body is read.
pub async fn upload_chunk_part(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Envelope<ChunkPartResponse>>> {
    let mut multipart = multipart?;
    let mut upload_id = None;
    let mut chunk_index = None;
    let mut response = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("uploadId") => {
                let text = field.text().await?;
                upload_id =
                    Some(UploadId::parse(text.trim()).map_err(|_| ApiError::UnknownUpload)?);
            }
            Some("chunkIndex") => chunk_index = Some(parse_chunk_index(&field.text().await?)?),
            Some("file") | Some("chunk") => {
                let (Some(upload_id), Some(index)) = (upload_id, chunk_index) else {
                    return Err(ApiError::BadRequest(
                        "uploadId and chunkIndex must precede the chunk data".to_string(),
                    ));
                };
                if response.is_some() {
                    return Err(ApiError::BadRequest(
                        "only one chunk per request".to_string(),
                    ));
                }
                let mut part = state.chunks.begin_part(user_id, upload_id, index).await?;
                while let Some(bytes) = field.chunk().await? {
                    part.write(&bytes).await?;
                }
                response = Some(state.chunks.finish_part(part).await?);
            }
            _ => {}
        }
    }

    let response =
        response.ok_or_else(|| ApiError::BadRequest("missing chunk data".to_string()))?;
    Ok(envelope::ok(response))
}

/// POST /v1/chunk/complete - Merge all chunks into a file.
pub async fn complete_chunk_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<CompleteChunkRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<FileInfo>>> {
    let Json(request) = payload?;
    let info = state.chunks.complete(user_id, &request).await?;
    Ok(envelope::ok(info))
}

/// POST /v1/rapidcheck - Bind to existing content without uploading it.
pub async fn rapid_check(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<RapidCheckRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<FileInfo>>> {
    let Json(request) = payload?;
    let info = state.ingest.rapid_check(user_id, &request).await?;
    Ok(envelope::ok_with_message("rapid upload succeeded", info))
}
