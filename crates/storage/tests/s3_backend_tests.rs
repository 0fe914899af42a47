//! S3 backend behaviour against a mocked S3-compatible endpoint.

mod common;

use bytes::Bytes;
use common::{can_bind_localhost, seeded_bytes};
use httpmock::Method::{DELETE, GET, HEAD, PUT};
use httpmock::MockServer;
use stash_storage::backends::s3::{S3Backend, S3Options};
use stash_storage::{ObjectStore, StorageError};

fn backend_for(server: &MockServer) -> S3Backend {
    S3Backend::new(S3Options {
        bucket: "stash".to_string(),
        endpoint: Some(server.base_url()),
        region: Some("us-east-1".to_string()),
        prefix: None,
        access_key_id: Some("access".to_string()),
        secret_access_key: Some("secret".to_string()),
        force_path_style: true,
    })
    .expect("backend should construct")
}

#[tokio::test]
async fn exists_maps_head_status() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let present = server
        .mock_async(|when, then| {
            when.method(HEAD).path("/stash/files/present");
            then.status(200).header("content-length", "3");
        })
        .await;
    let absent = server
        .mock_async(|when, then| {
            when.method(HEAD).path("/stash/files/absent");
            then.status(404);
        })
        .await;

    let backend = backend_for(&server);
    assert!(backend.exists("files/present").await.unwrap());
    assert!(!backend.exists("files/absent").await.unwrap());
    present.assert_async().await;
    absent.assert_async().await;
}

#[tokio::test]
async fn get_missing_object_is_not_found() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/stash/files/gone");
            then.status(404)
                .header("content-type", "application/xml")
                .body("<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>");
        })
        .await;

    let backend = backend_for(&server);
    match backend.get("files/gone").await {
        Err(StorageError::NotFound(key)) => assert_eq!(key, "files/gone"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn get_returns_body() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/stash/files/abc");
            then.status(200).body("stored bytes");
        })
        .await;

    let backend = backend_for(&server);
    assert_eq!(
        backend.get("files/abc").await.unwrap(),
        Bytes::from_static(b"stored bytes")
    );
}

#[tokio::test]
async fn put_file_sends_single_put() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT).path("/stash/files/abc");
            then.status(200).header("etag", "\"etag-1\"");
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("payload");
    std::fs::write(&source, seeded_bytes(7, 4096)).unwrap();

    let backend = backend_for(&server);
    let written = backend.put_file("files/abc", &source).await.unwrap();
    assert_eq!(written, 4096);
    put.assert_hits_async(1).await;
    assert!(source.exists(), "the source file is never removed by the backend");
}

#[tokio::test]
async fn put_rejection_surfaces_as_backend_error() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/stash/files/abc");
            then.status(403)
                .header("content-type", "application/xml")
                .body("<Error><Code>AccessDenied</Code><Message>denied</Message></Error>");
        })
        .await;

    let backend = backend_for(&server);
    let err = backend
        .put("files/abc", Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::S3(_)), "unexpected error: {err:?}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn delete_probes_then_deletes() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/stash/files/abc");
            then.status(200);
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/stash/files/abc");
            then.status(204);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/stash/files/missing");
            then.status(404);
        })
        .await;

    let backend = backend_for(&server);
    backend.delete("files/abc").await.unwrap();
    delete.assert_async().await;
    assert!(backend.delete("files/missing").await.unwrap_err().is_not_found());
}
