//! Identity, binding status and backend tags for stored files.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a display name, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 255;

/// Authenticated numeric user identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// User ids are positive.
    pub fn new(id: i64) -> crate::Result<Self> {
        if id <= 0 {
            return Err(crate::Error::InvalidUserId(id.to_string()));
        }
        Ok(Self(id))
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        let id = s
            .trim()
            .parse::<i64>()
            .map_err(|_| crate::Error::InvalidUserId(s.to_string()))?;
        Self::new(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a user's binding to a physical file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Active,
    Deleted,
    /// Frozen by an operator; neither renamed nor deleted by the owner.
    Locked,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "deleted" => Ok(Self::Deleted),
            "locked" => Ok(Self::Locked),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Active and locked bindings both hold a reference on the file.
    pub fn holds_reference(&self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

/// Which backend currently holds a file's bytes.
///
/// Stored next to the storage path so nothing has to guess the backend from
/// the shape of the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local staging directory.
    Local,
    /// S3-compatible store (AWS, Ceph RGW, MinIO).
    S3,
    /// Tencent Cloud Object Storage.
    Cos,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Cos => "cos",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "s3" | "ceph" => Ok(Self::S3),
            "cos" => Ok(Self::Cos),
            other => Err(crate::Error::InvalidBackend(other.to_string())),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `PUT /v1/files/{file_id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub file_name: String,
}

/// Check a user-facing file name. Returns the trimmed name.
pub fn validate_display_name(name: &str) -> crate::Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(crate::Error::InvalidFileName("file name is empty".into()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(crate::Error::InvalidFileName(format!(
            "file name longer than {MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(crate::Error::InvalidFileName(format!(
            "file name {name:?} contains a path separator"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id() {
        assert_eq!(UserId::parse(" 42 ").unwrap().get(), 42);
        assert!(UserId::parse("0").is_err());
        assert!(UserId::parse("-3").is_err());
        assert!(UserId::parse("abc").is_err());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("ceph").unwrap(), BackendKind::S3);
        assert_eq!(BackendKind::parse("cos").unwrap(), BackendKind::Cos);
        assert!(BackendKind::parse("ftp").is_err());
        assert!(!BackendKind::Local.is_remote());
    }

    #[test]
    fn test_status_references() {
        assert!(FileStatus::Active.holds_reference());
        assert!(FileStatus::Locked.holds_reference());
        assert!(!FileStatus::Deleted.holds_reference());
    }

    #[test]
    fn test_display_name_validation() {
        assert_eq!(validate_display_name("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("a/b").is_err());
        assert!(validate_display_name("..").is_err());
        assert!(validate_display_name(&"x".repeat(256)).is_err());
        assert!(validate_display_name(&"é".repeat(255)).is_ok());
    }
}
