//! Core data model: inodes, single-use links and backend tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Directory => "directory",
        }
    }
}

/// Backend driver tag carried by every inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Instance-local filesystem; the only backend with an owning instance
    Localfs,
    /// Globally addressable object store
    ObjectStore,
    /// Disabled driver placeholder
    Noop,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Localfs => "localfs",
            BackendKind::ObjectStore => "object_store",
            BackendKind::Noop => "noop",
        }
    }

    /// Parse a backend tag; unknown tags return `None` so the engine can
    /// apply its legacy default.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "localfs" => Some(BackendKind::Localfs),
            "object_store" | "s3" => Some(BackendKind::ObjectStore),
            "noop" => Some(BackendKind::Noop),
            _ => None,
        }
    }
}

/// Metadata record for one filesystem entry.
///
/// Entries are keyed by their canonical absolute `path`; the parent
/// relationship is carried as data (`parent_path`) rather than references so
/// records stay freely copyable across the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    pub id: String,
    pub parent_path: Option<String>,
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size_bytes: u64,
    /// Unix mode string, e.g. `"0755"`
    pub mode: String,
    pub uid: u32,
    pub gid: u32,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub backend: BackendKind,
    /// Owning instance; required for instance-local backends, absent for
    /// globally addressable ones
    pub instance_id: Option<String>,
    /// Reserved for symlink support
    pub symlink_target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Inode {
    /// Build a file inode with fresh timestamps.
    pub fn new_file(path: &str, size_bytes: u64, backend: BackendKind) -> Self {
        Self::new(path, FileKind::File, size_bytes, "0644", backend)
    }

    /// Build a directory inode with the default directory attributes.
    pub fn new_directory(path: &str, backend: BackendKind) -> Self {
        Self::new(path, FileKind::Directory, 0, "0755", backend)
    }

    fn new(path: &str, kind: FileKind, size_bytes: u64, mode: &str, backend: BackendKind) -> Self {
        let now = Utc::now();
        let (parent, name) = super::path::split_parent(path);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_path: if path == "/" { None } else { Some(parent) },
            name,
            path: path.to_string(),
            kind,
            size_bytes,
            mode: mode.to_string(),
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            backend,
            instance_id: None,
            symlink_target: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Touch modification-related timestamps for a content replace.
    pub fn touch_modified(&mut self) {
        let now = Utc::now();
        self.mtime = now;
        self.ctime = now;
        self.updated_at = now;
    }
}

/// Lifecycle of a single-use download link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Used,
    Expired,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Used => "used",
            LinkStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LinkStatus::Active),
            "used" => Some(LinkStatus::Used),
            "expired" => Some(LinkStatus::Expired),
            _ => None,
        }
    }
}

/// Capability to download one file exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleUseLink {
    /// URL-safe opaque token, at least 128 bits of entropy
    pub token: String,
    pub path: String,
    pub status: LinkStatus,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by_ip: Option<String>,
    /// HMAC over (token, path, expiry)
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SingleUseLink {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_constructors() {
        let file = Inode::new_file("/a/b.txt", 12, BackendKind::Localfs);
        assert_eq!(file.parent_path.as_deref(), Some("/a"));
        assert_eq!(file.name, "b.txt");
        assert_eq!(file.mode, "0644");
        assert!(file.is_file());

        let dir = Inode::new_directory("/a", BackendKind::Localfs);
        assert_eq!(dir.mode, "0755");
        assert_eq!(dir.size_bytes, 0);
        assert!(dir.is_directory());

        let root = Inode::new_directory("/", BackendKind::Localfs);
        assert!(root.parent_path.is_none());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("localfs"), Some(BackendKind::Localfs));
        assert_eq!(BackendKind::parse("s3"), Some(BackendKind::ObjectStore));
        assert_eq!(BackendKind::parse("ftp"), None);
    }

    #[test]
    fn test_link_expiry() {
        let now = Utc::now();
        let link = SingleUseLink {
            token: "t".into(),
            path: "/f".into(),
            status: LinkStatus::Active,
            expires_at: now + chrono::Duration::seconds(60),
            used_at: None,
            used_by_ip: None,
            signature: String::new(),
            created_at: now,
            updated_at: now,
        };
        assert!(!link.is_expired(now));
        assert!(link.is_expired(now + chrono::Duration::seconds(61)));
    }
}
