//! Server test utilities.

use super::multipart::MultipartBody;
use super::remote::MemoryStore;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use stash_core::BackendKind;
use stash_core::config::{AppConfig, MetadataConfig, S3Config};
use stash_metadata::{MetadataStore, SqliteStore};
use stash_server::{AppState, create_router};
use stash_storage::{BackendSet, FilesystemBackend, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const USER_HEADER: &str = "x-user-id";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    /// Present when the server was built with a remote current backend.
    pub remote: Option<Arc<MemoryStore>>,
    pub storage_root: PathBuf,
    _temp_dir: TempDir,
}

/// Response status, headers and raw body.
#[allow(dead_code)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl RawResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary local storage.
    pub async fn new() -> Self {
        Self::build(|_| {}, false).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, false).await
    }

    /// Create a test server whose current backend is an in-memory S3 stand-in.
    pub async fn with_remote<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, true).await
    }

    async fn build<F>(modifier: F, remote: bool) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_root = temp_dir.path().join("storage");
        let local = Arc::new(
            FilesystemBackend::new(&storage_root)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage.local_root = storage_root.clone();
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };

        let mut backends = BackendSet::new(local);
        let remote_store = if remote {
            let store = Arc::new(MemoryStore::new());
            config.storage.s3 = Some(S3Config {
                bucket: "test-bucket".to_string(),
                endpoint: None,
                region: None,
                prefix: None,
                access_key_id: None,
                secret_access_key: None,
                force_path_style: false,
            });
            config.ingest.current_backend = BackendKind::S3;
            backends =
                backends.with_remote(BackendKind::S3, store.clone() as Arc<dyn ObjectStore>);
            Some(store)
        } else {
            None
        };

        modifier(&mut config);

        let state = AppState::new(config, backends, metadata).expect("Failed to build state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            remote: remote_store,
            storage_root,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    pub fn remote(&self) -> &MemoryStore {
        self.remote.as_deref().expect("server built without a remote")
    }

    /// Path of a key on the local backend.
    pub fn local_path(&self, key: &str) -> PathBuf {
        self.storage_root.join(key)
    }

    /// Send a request and collect the whole response.
    pub async fn send(&self, request: Request<Body>) -> RawResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        RawResponse {
            status,
            headers,
            body,
        }
    }

    /// JSON request as `user` (anonymous when `None`).
    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        user: Option<i64>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user.to_string());
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        let response = self.send(builder.body(body).unwrap()).await;
        (response.status, response.json())
    }

    /// POST a multipart body as `user`.
    pub async fn multipart(&self, uri: &str, user: i64, body: MultipartBody) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(USER_HEADER, user.to_string())
            .header("Content-Type", MultipartBody::content_type())
            .body(Body::from(body.finish()))
            .unwrap();
        let response = self.send(request).await;
        (response.status, response.json())
    }

    /// Single-shot upload.
    pub async fn upload(&self, user: i64, file_name: &str, data: &[u8]) -> (StatusCode, Value) {
        let body = MultipartBody::new()
            .text("fileName", file_name)
            .file("file", "upload.bin", data);
        self.multipart("/v1/upload", user, body).await
    }

    /// Open a chunk session; returns the response `data`.
    pub async fn init_chunks(&self, user: i64, data: &[u8]) -> Value {
        let (status, body) = self
            .json(
                "POST",
                "/v1/chunk/init",
                Some(user),
                Some(serde_json::json!({
                    "contentHash": super::fixtures::sha256_hash(data),
                    "size": data.len(),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "init failed: {body}");
        body["data"].clone()
    }

    pub async fn send_chunk(
        &self,
        user: i64,
        upload_id: &str,
        index: u64,
        data: &[u8],
    ) -> (StatusCode, Value) {
        let body = MultipartBody::new()
            .text("uploadId", upload_id)
            .text("chunkIndex", index.to_string())
            .file("file", "blob", data);
        self.multipart("/v1/chunk/part", user, body).await
    }

    pub async fn complete_chunks(
        &self,
        user: i64,
        upload_id: &str,
        file_name: &str,
    ) -> (StatusCode, Value) {
        self.json(
            "POST",
            "/v1/chunk/complete",
            Some(user),
            Some(serde_json::json!({
                "uploadId": upload_id,
                "fileName": file_name,
            })),
        )
        .await
    }

    /// GET a download as `user`.
    pub async fn download(&self, user: i64, file_id: i64) -> RawResponse {
        let request = Request::builder()
            .method("GET")
            .uri(format!("/v1/files/{file_id}/download"))
            .header(USER_HEADER, user.to_string())
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }
}
