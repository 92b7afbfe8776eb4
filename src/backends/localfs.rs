//! Local-filesystem storage driver.
//!
//! Rooted at a configured directory; every path is safe-joined against the
//! root before any I/O. This is the only driver whose files carry an owning
//! instance identity.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{ByteStream, OpContext, Storage, StorageEntry, StorageError, StorageResult};
use crate::core::{path::safe_join, BackendKind, FileKind, FsError, Inode};

/// Filesystem driver rooted at `root`.
pub struct LocalFsBackend {
    root: PathBuf,
    instance_id: String,
}

impl LocalFsBackend {
    /// Create the driver, making sure the root exists.
    pub fn new(root: PathBuf, instance_id: String) -> StorageResult<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::Fatal(format!("cannot create root {root:?}: {e}")))?;
        Ok(Self { root, instance_id })
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        safe_join(&self.root, path).map_err(|e| match e {
            FsError::Forbidden(msg) => StorageError::Forbidden(msg),
            FsError::InvalidInput(msg) => StorageError::Forbidden(msg),
            other => StorageError::Fatal(other.to_string()),
        })
    }

    async fn write_stream(
        file: &mut tokio::fs::File,
        mut content: ByteStream,
    ) -> StorageResult<u64> {
        let mut written = 0u64;
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Storage for LocalFsBackend {
    async fn open(&self, _ctx: &OpContext, path: &str) -> StorageResult<ByteStream> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(StorageError::Fatal(format!("{path} is a directory")));
        }
        let file = tokio::fs::File::open(&full).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn create(
        &self,
        _ctx: &OpContext,
        path: &str,
        content: ByteStream,
    ) -> StorageResult<u64> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await?;
        Self::write_stream(&mut file, content).await
    }

    async fn update(
        &self,
        _ctx: &OpContext,
        path: &str,
        content: ByteStream,
    ) -> StorageResult<u64> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .await?;
        Self::write_stream(&mut file, content).await
    }

    async fn delete(&self, _ctx: &OpContext, path: &str) -> StorageResult<()> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&full).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::DirectoryNotEmpty {
                    StorageError::Fatal(format!("directory {path} not empty"))
                } else {
                    e.into()
                }
            })?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn stat(&self, _ctx: &OpContext, path: &str) -> StorageResult<Inode> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full).await?;

        let canonical = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let mut inode = if meta.is_dir() {
            Inode::new_directory(&canonical, BackendKind::Localfs)
        } else {
            Inode::new_file(&canonical, meta.len(), BackendKind::Localfs)
        };
        inode.instance_id = Some(self.instance_id.clone());
        if let Ok(modified) = meta.modified() {
            inode.mtime = modified.into();
        }
        Ok(inode)
    }

    async fn list_dir(&self, _ctx: &OpContext, path: &str) -> StorageResult<Vec<StorageEntry>> {
        let full = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&full).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(StorageEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size_bytes: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir(&self, _ctx: &OpContext, path: &str) -> StorageResult<()> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{collect_stream, stream_from_bytes};

    fn backend() -> (LocalFsBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path().to_path_buf(), "node-a".to_string()).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_create_open_round_trip() {
        let (backend, _dir) = backend();
        let ctx = OpContext::local();
        let written = backend
            .create(&ctx, "a/b.txt", stream_from_bytes(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(written, 5);

        let content = collect_stream(backend.open(&ctx, "a/b.txt").await.unwrap())
            .await
            .unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let (backend, _dir) = backend();
        let ctx = OpContext::local();
        backend
            .create(&ctx, "f", stream_from_bytes(b"one".to_vec()))
            .await
            .unwrap();
        let err = backend
            .create(&ctx, "f", stream_from_bytes(b"two".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_replaces() {
        let (backend, _dir) = backend();
        let ctx = OpContext::local();
        backend
            .create(&ctx, "f", stream_from_bytes(b"aaaa".to_vec()))
            .await
            .unwrap();
        backend
            .update(&ctx, "f", stream_from_bytes(b"bb".to_vec()))
            .await
            .unwrap();
        let content = collect_stream(backend.open(&ctx, "f").await.unwrap())
            .await
            .unwrap();
        assert_eq!(content, b"bb");
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (backend, _dir) = backend();
        let err = backend
            .open(&OpContext::local(), "missing")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat_and_list() {
        let (backend, _dir) = backend();
        let ctx = OpContext::local();
        backend.create_dir(&ctx, "d").await.unwrap();
        backend
            .create(&ctx, "d/f", stream_from_bytes(b"xyz".to_vec()))
            .await
            .unwrap();

        let stat = backend.stat(&ctx, "d/f").await.unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size_bytes, 3);
        assert_eq!(stat.instance_id.as_deref(), Some("node-a"));

        let entries = backend.list_dir(&ctx, "d").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "f");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_delete_non_empty_dir_fails() {
        let (backend, _dir) = backend();
        let ctx = OpContext::local();
        backend.create_dir(&ctx, "d").await.unwrap();
        backend
            .create(&ctx, "d/f", stream_from_bytes(b"x".to_vec()))
            .await
            .unwrap();
        assert!(backend.delete(&ctx, "d").await.is_err());
        backend.delete(&ctx, "d/f").await.unwrap();
        backend.delete(&ctx, "d").await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (backend, _dir) = backend();
        let err = backend
            .open(&OpContext::local(), "../../etc/passwd")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Forbidden(_)));
    }
}
