//! Integration tests for chunked uploads.

mod common;

use axum::http::StatusCode;
use common::fixtures::{seeded_bytes, sha256_hash, split_into_chunks};
use common::{MultipartBody, TestServer};
use serde_json::json;
use stash_core::{UploadId, UserId};
use stash_metadata::repos::ChunkSessionRepo;
use stash_server::ApiError;
use std::time::Duration;

/// Chunk size used by `AppConfig::for_testing`.
const CHUNK: usize = 64 * 1024;

fn upload_id(init: &serde_json::Value) -> String {
    init["uploadId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_parts_in_any_order_reassemble() {
    let server = TestServer::new().await;
    let data = seeded_bytes(11, 2 * CHUNK + 18_928);

    let init = server.init_chunks(5, &data).await;
    assert_eq!(init["chunkCount"], 3);
    assert_eq!(init["chunkSize"], CHUNK);
    let id = upload_id(&init);

    let parts = split_into_chunks(&data, CHUNK);
    for index in [2u64, 0, 1] {
        let (status, body) = server
            .send_chunk(5, &id, index, &parts[index as usize])
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["chunkIndex"], index);
        assert_eq!(body["data"]["newlyReceived"], true);
    }

    let (status, body) = server.complete_chunks(5, &id, "video.mp4").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["contentHash"], sha256_hash(&data));
    assert_eq!(body["data"]["size"], data.len());
    assert_eq!(body["data"]["deduplicated"], false);

    let file_id = body["data"]["fileId"].as_i64().unwrap();
    let download = server.download(5, file_id).await;
    assert_eq!(download.status, StatusCode::OK);
    assert_eq!(download.body.to_vec(), data.to_vec());

    // Parts directory is gone once the file is committed.
    assert!(!server.local_path(&id).exists());
}

#[tokio::test]
async fn test_resending_a_part_is_idempotent() {
    let server = TestServer::new().await;
    let data = seeded_bytes(12, CHUNK + 10);
    let id = upload_id(&server.init_chunks(1, &data).await);
    let parts = split_into_chunks(&data, CHUNK);

    let (_, first) = server.send_chunk(1, &id, 0, &parts[0]).await;
    assert_eq!(first["data"]["newlyReceived"], true);
    let (status, second) = server.send_chunk(1, &id, 0, &parts[0]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["newlyReceived"], false);

    server.send_chunk(1, &id, 1, &parts[1]).await;
    let (status, body) = server.complete_chunks(1, &id, "twice.bin").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["size"], data.len());
}

#[tokio::test]
async fn test_chunk_count_rounds_up() {
    let server = TestServer::with_config(|c| c.ingest.chunk_size = 5_242_880).await;
    let (status, body) = server
        .json(
            "POST",
            "/v1/chunk/init",
            Some(1),
            Some(json!({ "contentHash": "ab".repeat(32), "size": 12_000_000 })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["chunkCount"], 3);
    assert_eq!(body["data"]["chunkSize"], 5_242_880);
}

#[tokio::test]
async fn test_empty_file_needs_no_parts() {
    let server = TestServer::new().await;
    let init = server.init_chunks(1, b"").await;
    assert_eq!(init["chunkCount"], 0);

    let (status, body) = server.complete_chunks(1, &upload_id(&init), "empty.txt").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["size"], 0);
    assert_eq!(body["data"]["contentHash"], sha256_hash(b""));
}

#[tokio::test]
async fn test_complete_reports_missing_parts() {
    let server = TestServer::new().await;
    let data = seeded_bytes(13, 2 * CHUNK + 1);
    let id = upload_id(&server.init_chunks(1, &data).await);
    let parts = split_into_chunks(&data, CHUNK);

    server.send_chunk(1, &id, 0, &parts[0]).await;
    server.send_chunk(1, &id, 1, &parts[1]).await;

    let (status, body) = server.complete_chunks(1, &id, "partial.bin").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "missing_chunks");
    assert_eq!(body["details"]["missing"], json!([2]));
    assert_eq!(body["retriable"], true);

    // The session stays usable.
    server.send_chunk(1, &id, 2, &parts[2]).await;
    let (status, body) = server.complete_chunks(1, &id, "partial.bin").await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_sessions_are_private_to_their_owner() {
    let server = TestServer::new().await;
    let data = seeded_bytes(14, 100);
    let id = upload_id(&server.init_chunks(1, &data).await);

    let (status, body) = server.send_chunk(2, &id, 0, &data).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_upload");

    server.send_chunk(1, &id, 0, &data).await;
    let (status, body) = server.complete_chunks(2, &id, "stolen.bin").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_upload");
}

#[tokio::test]
async fn test_unknown_and_malformed_upload_ids() {
    let server = TestServer::new().await;

    let (status, body) = server
        .send_chunk(1, "00000000-0000-4000-8000-000000000000", 0, b"x")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_upload");

    let (status, body) = server.complete_chunks(1, "not-a-uuid", "x.bin").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_upload");
}

#[tokio::test]
async fn test_part_index_and_length_are_checked() {
    let server = TestServer::new().await;
    let data = seeded_bytes(15, CHUNK + 100);
    let id = upload_id(&server.init_chunks(1, &data).await);

    let (status, body) = server.send_chunk(1, &id, 2, b"beyond").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "chunk_index_out_of_range");

    // Short final part.
    let (status, body) = server.send_chunk(1, &id, 1, &data[CHUNK..CHUNK + 50]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "chunk_length_mismatch");

    // Oversized first part.
    let (status, body) = server.send_chunk(1, &id, 0, &data).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "chunk_length_mismatch");

    // Rejected parts are not recorded.
    let (_, body) = server.complete_chunks(1, &id, "x.bin").await;
    assert_eq!(body["details"]["missing"], json!([0, 1]));
}

#[tokio::test]
async fn test_part_fields_must_precede_data() {
    let server = TestServer::new().await;
    let data = seeded_bytes(16, 10);
    let id = upload_id(&server.init_chunks(1, &data).await);

    let body = MultipartBody::new()
        .file("file", "blob", &data)
        .text("uploadId", &id)
        .text("chunkIndex", "0");
    let (status, body) = server.multipart("/v1/chunk/part", 1, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_hash_mismatch_reopens_the_session() {
    let server = TestServer::new().await;
    let declared = seeded_bytes(17, 500);
    let sent = seeded_bytes(18, 500);
    let id = upload_id(&server.init_chunks(1, &declared).await);

    server.send_chunk(1, &id, 0, &sent).await;
    let (status, body) = server.complete_chunks(1, &id, "wrong.bin").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "hash_mismatch");
    assert_eq!(body["details"]["expected"], sha256_hash(&declared));
    assert_eq!(body["details"]["actual"], sha256_hash(&sent));

    // Replace the bad part and finish.
    server.send_chunk(1, &id, 0, &declared).await;
    let (status, body) = server.complete_chunks(1, &id, "right.bin").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["contentHash"], sha256_hash(&declared));
}

#[tokio::test]
async fn test_hash_verification_can_be_disabled() {
    let server = TestServer::with_config(|c| c.ingest.verify_content_hash = false).await;
    let declared = seeded_bytes(19, 64);
    let sent = seeded_bytes(20, 64);
    let id = upload_id(&server.init_chunks(1, &declared).await);

    server.send_chunk(1, &id, 0, &sent).await;
    let (status, body) = server.complete_chunks(1, &id, "trusted.bin").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    // The file is keyed by what was actually received.
    assert_eq!(body["data"]["contentHash"], sha256_hash(&sent));
}

#[tokio::test]
async fn test_completed_session_cannot_be_reused() {
    let server = TestServer::new().await;
    let data = seeded_bytes(21, 32);
    let id = upload_id(&server.init_chunks(1, &data).await);
    server.send_chunk(1, &id, 0, &data).await;

    let (status, _) = server.complete_chunks(1, &id, "once.bin").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server.complete_chunks(1, &id, "twice.bin").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_upload");

    let (status, _) = server.send_chunk(1, &id, 0, &data).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_expired_session_is_gone() {
    let server = TestServer::with_config(|c| c.ingest.chunk_session_ttl_secs = 1).await;
    let data = seeded_bytes(22, 32);
    let id = upload_id(&server.init_chunks(1, &data).await);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let (status, body) = server.send_chunk(1, &id, 0, &data).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "upload_expired");

    let (status, _) = server.complete_chunks(1, &id, "late.bin").await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_init_rejects_bad_input() {
    let server = TestServer::with_config(|c| c.server.max_upload_size = 1_000_000).await;

    let (status, body) = server
        .json(
            "POST",
            "/v1/chunk/init",
            Some(1),
            Some(json!({ "contentHash": "xyz", "size": 10 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_hash");

    let (status, body) = server
        .json(
            "POST",
            "/v1/chunk/init",
            Some(1),
            Some(json!({ "contentHash": "ab".repeat(32), "size": 2_000_000 })),
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["details"]["limit"], 1_000_000);
}

#[tokio::test]
async fn test_part_refused_during_completion_keeps_previous_bytes() {
    let server = TestServer::new().await;
    let data = seeded_bytes(30, 2 * CHUNK);
    let id = upload_id(&server.init_chunks(4, &data).await);
    let parts = split_into_chunks(&data, CHUNK);
    for index in [0u64, 1] {
        let (status, body) = server.send_chunk(4, &id, index, &parts[index as usize]).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let upload = UploadId::parse(&id).unwrap();
    let user = UserId::new(4).unwrap();
    let mut late = server.state.chunks.begin_part(user, upload, 0).await.unwrap();
    late.write(&seeded_bytes(31, CHUNK)).await.unwrap();

    // A completion claims the session before the late part is marked.
    let now = time::OffsetDateTime::now_utc();
    assert!(
        server
            .metadata()
            .begin_completing(upload, now, now + time::Duration::hours(1))
            .await
            .unwrap()
    );
    let err = server.state.chunks.finish_part(late).await.unwrap_err();
    assert!(matches!(err, ApiError::UploadInProgress), "{err:?}");
    assert_eq!(
        std::fs::read(server.local_path(&format!("{id}/0"))).unwrap(),
        parts[0].to_vec()
    );

    server.metadata().abort_completing(upload, now).await.unwrap();
    let (status, body) = server.complete_chunks(4, &id, "intact.bin").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["contentHash"], sha256_hash(&data));
}

#[tokio::test]
async fn test_part_for_finished_session_leaves_no_directory() {
    let server = TestServer::new().await;
    let data = seeded_bytes(32, CHUNK + 10);
    let id = upload_id(&server.init_chunks(6, &data).await);
    let parts = split_into_chunks(&data, CHUNK);

    let upload = UploadId::parse(&id).unwrap();
    let user = UserId::new(6).unwrap();
    let mut late = server.state.chunks.begin_part(user, upload, 1).await.unwrap();
    late.write(&parts[1]).await.unwrap();

    // The session finishes and its parts directory is discarded meanwhile.
    server.metadata().delete_chunk_session(upload).await.unwrap();
    let _ = std::fs::remove_dir_all(server.local_path(&id));

    let err = server.state.chunks.finish_part(late).await.unwrap_err();
    assert!(matches!(err, ApiError::UnknownUpload), "{err:?}");
    assert!(!server.local_path(&id).exists());
}
