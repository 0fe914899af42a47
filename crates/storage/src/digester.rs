//! Hash-while-persist for incoming content.
//!
//! Every byte of an upload passes through [`DigestWriter::write`] exactly once:
//! it is fed to the SHA-256 hasher and appended to a temporary file in the
//! local staging directory. The digest is only known after the last byte, so
//! nothing is committed under a key until [`DigestWriter::finish`] returns.
//! Dropping the writer or the resulting [`DigestedContent`] removes the
//! temporary file, which means a failed read mid-stream leaves nothing behind.

use crate::backends::filesystem::FilesystemBackend;
use crate::error::{StorageError, StorageResult};
use crate::traits::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use stash_core::{ContentHash, ContentHasher};
use std::path::Path;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Content that has been fully written to staging and hashed.
#[derive(Debug)]
pub struct DigestedContent {
    pub hash: ContentHash,
    pub size: u64,
    temp: TempPath,
}

impl DigestedContent {
    /// Location of the staged bytes.
    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn into_temp_path(self) -> TempPath {
        self.temp
    }
}

/// Incremental writer produced by [`ContentDigester::begin`].
pub struct DigestWriter {
    file: fs::File,
    temp: TempPath,
    hasher: ContentHasher,
    size: u64,
    limit: Option<u64>,
}

impl DigestWriter {
    /// Hash and persist the next slice of the stream.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let size = self.size + data.len() as u64;
        if let Some(limit) = self.limit
            && size > limit
        {
            return Err(StorageError::TooLarge { limit });
        }
        self.file.write_all(data).await?;
        self.hasher.update(data);
        self.size = size;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.size
    }

    /// Flush to disk and return the digest.
    pub async fn finish(mut self) -> StorageResult<DigestedContent> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        Ok(DigestedContent {
            hash: self.hasher.finalize(),
            size: self.size,
            temp: self.temp,
        })
    }
}

/// Creates [`DigestWriter`]s in the local backend's staging directory.
#[derive(Clone)]
pub struct ContentDigester {
    local: std::sync::Arc<FilesystemBackend>,
    max_size: Option<u64>,
}

impl ContentDigester {
    pub fn new(local: std::sync::Arc<FilesystemBackend>) -> Self {
        Self {
            local,
            max_size: None,
        }
    }

    /// Reject content larger than `max_size` bytes.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub async fn begin(&self) -> StorageResult<DigestWriter> {
        let (file, temp) = self.local.staging_file().await?;
        Ok(DigestWriter {
            file,
            temp,
            hasher: ContentHash::hasher(),
            size: 0,
            limit: self.max_size,
        })
    }

    /// Consume a whole stream. The stream's first error aborts the digest.
    pub async fn digest_stream<S, E>(&self, mut stream: S) -> StorageResult<DigestedContent>
    where
        S: futures::Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut writer = self.begin().await?;
        while let Some(item) = stream.next().await {
            let data = item.map_err(|e| StorageError::Source(e.to_string()))?;
            writer.write(&data).await?;
        }
        writer.finish().await
    }

    /// Concatenate several objects of the local backend, in the given order.
    pub async fn digest_concat(&self, keys: &[String]) -> StorageResult<DigestedContent> {
        let mut writer = self.begin().await?;
        for key in keys {
            let mut stream: ByteStream = crate::ObjectStore::get_stream(&*self.local, key).await?;
            while let Some(data) = stream.next().await {
                writer.write(&data?).await?;
            }
        }
        writer.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectStore;
    use std::sync::Arc;

    async fn digester() -> (tempfile::TempDir, Arc<FilesystemBackend>, ContentDigester) {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
        let digester = ContentDigester::new(local.clone());
        (dir, local, digester)
    }

    #[tokio::test]
    async fn test_digest_stream() {
        let (_dir, _local, digester) = digester().await;
        let parts: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let content = digester
            .digest_stream(futures::stream::iter(parts))
            .await
            .unwrap();

        assert_eq!(content.hash, ContentHash::compute(b"hello world"));
        assert_eq!(content.size, 11);
        assert_eq!(std::fs::read(content.path()).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_file() {
        let (dir, _local, digester) = digester().await;
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from("partial")),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = digester
            .digest_stream(futures::stream::iter(parts))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Source(_)));

        let staged = std::fs::read_dir(dir.path().join(".staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_size_limit() {
        let (_dir, local, _) = digester().await;
        let digester = ContentDigester::new(local).with_max_size(4);
        let mut writer = digester.begin().await.unwrap();
        writer.write(b"1234").await.unwrap();
        assert!(matches!(
            writer.write(b"5").await,
            Err(StorageError::TooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_empty_content() {
        let (_dir, _local, digester) = digester().await;
        let content = digester.begin().await.unwrap().finish().await.unwrap();
        assert_eq!(content.size, 0);
        assert_eq!(content.hash, ContentHash::empty());
    }

    #[tokio::test]
    async fn test_digest_concat_in_order() {
        let (_dir, local, digester) = digester().await;
        local.put("u/1", Bytes::from("world")).await.unwrap();
        local.put("u/0", Bytes::from("hello ")).await.unwrap();

        let keys = vec!["u/0".to_string(), "u/1".to_string()];
        let content = digester.digest_concat(&keys).await.unwrap();
        assert_eq!(content.hash, ContentHash::compute(b"hello world"));

        local.adopt(&content.hash.to_hex(), content.into_temp_path()).await.unwrap();
        assert_eq!(
            local.list("").await.unwrap(),
            vec![
                ContentHash::compute(b"hello world").to_hex(),
                "u/0".to_string(),
                "u/1".to_string()
            ]
        );
    }
}
