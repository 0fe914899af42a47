//! Local filesystem storage backend.
//!
//! Besides serving as a regular [`ObjectStore`], the local backend is the
//! staging area of the ingestion pipeline: chunk parts live under
//! `{upload_id}/{index}`, merged or single-shot content under `{hash}`, and
//! in-progress writes in a hidden staging directory that never collides
//! with a key.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, STREAM_CHUNK_SIZE, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Directory under the root that holds in-flight writes.
pub const STAGING_DIR: &str = ".staging";

/// Local filesystem object store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

fn not_found_or_io(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root and staging directories.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for temporary files that may later be adopted under a key.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Resolve a key to a path inside the root.
    ///
    /// Validation touches the filesystem (`canonicalize`, `symlink_metadata`),
    /// so it runs on the blocking pool.
    pub async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Reject keys that are absolute, contain `..`, address the staging
    /// directory, or resolve outside the root through a symlink.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with(['/', '\\']) {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        let mut components = Path::new(key).components();
        if let Some(Component::Normal(first)) = Path::new(key).components().next()
            && first == STAGING_DIR
        {
            return Err(StorageError::InvalidKey(format!("reserved key: {key}")));
        }
        if !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        // The nearest existing ancestor (the path itself included) must
        // resolve inside the root; otherwise create_dir_all or open would
        // follow a symlink out of it.
        let mut probe = Some(path.as_path());
        while let Some(candidate) = probe {
            match std::fs::symlink_metadata(candidate) {
                Ok(meta) => {
                    let canonical = candidate.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    probe = candidate.parent();
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_sibling(path: &Path) -> PathBuf {
        let suffix = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), suffix))
                .unwrap_or(suffix),
        )
    }

    /// Create an empty temporary file in the staging directory. The file is
    /// removed when the returned [`TempPath`] is dropped unless adopted.
    pub async fn staging_file(&self) -> StorageResult<(fs::File, TempPath)> {
        let dir = self.staging_dir();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("ingest-").tempfile_in(dir)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))??;
        let (file, path) = named.into_parts();
        Ok((fs::File::from_std(file), path))
    }

    /// Move a staged file under `key`, replacing any existing object.
    #[instrument(skip(self, temp), fields(backend = "filesystem"))]
    pub async fn adopt(&self, key: &str, temp: TempPath) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        tokio::task::spawn_blocking(move || temp.persist(&path))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
            .map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    /// Like [`adopt`](Self::adopt), but keeps the object being replaced.
    ///
    /// The previous content is hard-linked into the staging directory before
    /// the swap, so `key` always names a complete object. The returned path
    /// is removed when dropped; hand it to [`restore`](Self::restore) to undo.
    #[instrument(skip(self, temp), fields(backend = "filesystem"))]
    pub async fn adopt_keeping_previous(
        &self,
        key: &str,
        temp: TempPath,
    ) -> StorageResult<Option<TempPath>> {
        let path = self.key_path(key).await?;
        let backup = self
            .staging_dir()
            .join(format!("previous-{}", Uuid::new_v4()));
        let previous = match fs::hard_link(&path, &backup).await {
            Ok(()) => Some(TempPath::from_path(backup)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::Io(e)),
        };
        self.adopt(key, temp).await?;
        Ok(previous)
    }

    /// Undo [`adopt_keeping_previous`](Self::adopt_keeping_previous): put the
    /// previous object back, or remove `key` if there was none.
    #[instrument(skip(self, previous), fields(backend = "filesystem"))]
    pub async fn restore(&self, key: &str, previous: Option<TempPath>) -> StorageResult<()> {
        match previous {
            Some(previous) => self.adopt(key, previous).await,
            None => match self.delete(key).await {
                Err(e) if !e.is_not_found() => Err(e),
                _ => Ok(()),
            },
        }
    }

    /// Remove every object under a directory-like prefix. Missing is fine.
    #[instrument(skip(self), fields(backend = "filesystem"))]
    pub async fn delete_prefix(&self, prefix: &str) -> StorageResult<()> {
        let path = self.key_path(prefix.trim_end_matches('/')).await?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(not_found_or_io(key))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(not_found_or_io(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path).await.map_err(not_found_or_io(key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        // Unique temp name so concurrent writers of one key never interleave.
        let temp_path = Self::temp_sibling(&path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = Self::temp_sibling(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_file(&self, key: &str, source: &Path) -> StorageResult<u64> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = Self::temp_sibling(&path);
        let copied = fs::copy(source, &temp_path).await;
        match copied {
            Ok(n) => {
                fs::rename(&temp_path, &path).await?;
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(not_found_or_io(key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base_path = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.key_path(prefix).await?
        };
        let mut results = Vec::new();
        if !fs::try_exists(&base_path).await? {
            return Ok(results);
        }

        let staging = self.staging_dir();
        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; links are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if path != staging {
                        stack.push(path);
                    }
                } else if file_type.is_file()
                    && !path.to_string_lossy().contains(".tmp.")
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    results.push(rel.to_string_lossy().to_string());
                }
            }
        }
        results.sort();
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(self.staging_dir()).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("staging path is not a directory: {:?}", self.staging_dir()),
            )));
        }
        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}
