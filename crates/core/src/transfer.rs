//! Migration tasks carried by the transfer queue.

use crate::file::BackendKind;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Queue bookkeeping state of a transfer task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Waiting for `available_at`.
    Pending,
    /// Held by a worker until `lease_expires_at`.
    Leased,
    /// Exhausted its attempts; kept for operators.
    Dead,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "dead" => Ok(Self::Dead),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Move the bytes of `content_hash` from `source_location` on local disk to
/// `dest_location` on `dest_backend`.
///
/// Delivery is at-least-once. Consuming the same task twice must leave the
/// file at `dest_location` with no duplicate object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub content_hash: ContentHash,
    pub source_location: String,
    pub dest_location: String,
    pub dest_backend: BackendKind,
}

impl TransferTask {
    /// Task moving a locally staged file to `root + hash` on `dest_backend`.
    pub fn for_local_file(
        content_hash: ContentHash,
        remote_root: &str,
        dest_backend: BackendKind,
    ) -> Self {
        Self {
            content_hash,
            source_location: content_hash.to_hex(),
            dest_location: remote_key(remote_root, &content_hash),
            dest_backend,
        }
    }
}

/// A persisted task plus its queue bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedTransfer {
    pub task_id: i64,
    pub task: TransferTask,
    pub state: TransferState,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub available_at: OffsetDateTime,
    pub last_error: Option<String>,
}

/// Destination key for content on a remote backend.
pub fn remote_key(remote_root: &str, hash: &ContentHash) -> String {
    let root = remote_root.trim_start_matches('/');
    if root.is_empty() {
        hash.to_hex()
    } else if root.ends_with('/') {
        format!("{root}{hash}")
    } else {
        format!("{root}/{hash}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_key() {
        let hash = ContentHash::compute(b"a");
        assert_eq!(remote_key("files/", &hash), format!("files/{hash}"));
        assert_eq!(remote_key("/files", &hash), format!("files/{hash}"));
        assert_eq!(remote_key("", &hash), hash.to_hex());
    }

    #[test]
    fn test_task_for_local_file() {
        let hash = ContentHash::compute(b"a");
        let task = TransferTask::for_local_file(hash, "cos/", BackendKind::Cos);
        assert_eq!(task.source_location, hash.to_hex());
        assert_eq!(task.dest_location, format!("cos/{hash}"));
    }
}
