//! Request-path engine
//!
//! Orchestrates metadata stores, storage backends, the cache and the lock
//! manager: resolves metadata, selects a backend from ownership, ensures
//! parent directories, applies per-path locks, replicates to the secondary
//! backend and invalidates the cache. Every mutation follows the same
//! shape: lock, resolve, backend write, metadata apply, after-apply hooks,
//! cache invalidation, detached lock release.

mod replication;

use std::sync::Arc;

use crate::auth::Identity;
use crate::backends::{BackendSet, ByteStream, OpContext, SharedStorage};
use crate::cache::MetadataCache;
use crate::core::path::{parent_of, SanitizedPath};
use crate::core::{BackendKind, FsError, FsResult, Inode};
use crate::locks::{self, SharedLockManager};
use crate::metadata::SharedMetadataStore;

/// Recursion bounds for directory listings
pub const DEFAULT_LIST_DEPTH: usize = 100;
pub const MAX_LIST_DEPTH: usize = 1000;

/// Engine wiring and policy.
pub struct EngineConfig {
    pub instance_id: String,
    pub replication_enabled: bool,
    pub replica_backend: Option<BackendKind>,
    pub require_replica_success: bool,
}

/// The orchestration core.
pub struct Engine {
    store: SharedMetadataStore,
    backends: BackendSet,
    cache: Arc<MetadataCache>,
    locks: SharedLockManager,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: SharedMetadataStore,
        backends: BackendSet,
        cache: Arc<MetadataCache>,
        locks: SharedLockManager,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            backends,
            cache,
            locks,
            config,
        }
    }

    pub fn store(&self) -> &SharedMetadataStore {
        &self.store
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Make sure the root directory record exists.
    pub async fn ensure_root(&self) -> FsResult<()> {
        match self.store.get("/").await {
            Ok(_) => Ok(()),
            Err(FsError::NotFound(_)) => {
                let root = Inode::new_directory("/", self.backends.default_kind);
                match self.store.create(&root).await {
                    Ok(()) | Err(FsError::AlreadyExists(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Metadata resolution and backend selection
    // ------------------------------------------------------------------

    /// Resolve metadata, cache first.
    pub async fn resolve(&self, path: &str) -> FsResult<Inode> {
        if let Some(inode) = self.cache.lookup(path) {
            return Ok(inode);
        }
        let inode = self.store.get(path).await?;
        self.cache.insert(inode.clone());
        Ok(inode)
    }

    /// Pick the driver for an inode based on ownership.
    fn select_backend(&self, inode: &Inode) -> (SharedStorage, OpContext) {
        match inode.instance_id.as_deref() {
            Some(owner) if owner == self.config.instance_id => {
                (self.backends.by_kind(inode.backend), OpContext::local())
            }
            Some(owner) => (self.backends.proxy.clone(), OpContext::for_instance(owner)),
            None => {
                // Legacy records carry no owner; route by tag alone.
                if inode.backend == BackendKind::Noop {
                    tracing::warn!(
                        path = %inode.path,
                        "inode has no usable backend tag, defaulting to localfs"
                    );
                    (
                        self.backends.by_kind(BackendKind::Localfs),
                        OpContext::local(),
                    )
                } else {
                    (self.backends.by_kind(inode.backend), OpContext::local())
                }
            }
        }
    }

    async fn acquire_path_lock(&self, path: &str) -> FsResult<String> {
        let key = format!("file:{path}");
        if !self.locks.acquire(&key).await {
            return Err(FsError::Transient(format!(
                "could not acquire lock for {path}"
            )));
        }
        Ok(key)
    }

    fn release_path_lock(&self, key: String) {
        locks::release_detached(Arc::clone(&self.locks), key);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Open a file's content stream. Closing the stream is the caller's
    /// responsibility (drop).
    pub async fn get_file(&self, path: &str) -> FsResult<(Inode, ByteStream)> {
        let inode = self.resolve(path).await?;
        if !inode.is_file() {
            return Err(FsError::InvalidInput(format!("{path} is a directory")));
        }
        let (backend, ctx) = self.select_backend(&inode);
        let stream = backend.open(&ctx, &inode.path).await?;
        Ok((inode, stream))
    }

    /// Metadata only.
    pub async fn head(&self, path: &str) -> FsResult<Inode> {
        self.resolve(path).await
    }

    /// Non-recursive listing, straight from the metadata store.
    pub async fn list_directory(&self, path: &str) -> FsResult<Vec<Inode>> {
        let inode = self.resolve(path).await?;
        if !inode.is_directory() {
            return Err(FsError::InvalidInput(format!("{path} is not a directory")));
        }
        self.store.list_children(path).await
    }

    /// Bounded depth-first traversal. Subtrees that fail to list are
    /// skipped (and logged) so partial results still come back.
    pub async fn list_recursive(
        &self,
        path: &str,
        max_depth: Option<usize>,
    ) -> FsResult<Vec<Inode>> {
        let depth_cap = max_depth.unwrap_or(DEFAULT_LIST_DEPTH).min(MAX_LIST_DEPTH);
        let root = self.resolve(path).await?;
        if !root.is_directory() {
            return Err(FsError::InvalidInput(format!("{path} is not a directory")));
        }

        let mut out = Vec::new();
        let mut stack = vec![(root.path.clone(), 1usize)];
        while let Some((dir, depth)) = stack.pop() {
            if depth > depth_cap {
                continue;
            }
            match self.store.list_children(&dir).await {
                Ok(children) => {
                    for child in children {
                        if child.is_directory() {
                            stack.push((child.path.clone(), depth + 1));
                        }
                        out.push(child);
                    }
                }
                Err(err) => {
                    tracing::warn!(dir = %dir, error = %err, "skipping unlistable subtree");
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create a new file. Fails with already-exists when the path is taken
    /// anywhere in the cluster.
    pub async fn create_file(
        &self,
        path: &SanitizedPath,
        content: ByteStream,
        identity: &Identity,
    ) -> FsResult<Inode> {
        let lock = self.acquire_path_lock(&path.full).await?;
        let result = self.create_file_locked(path, content, identity).await;
        self.release_path_lock(lock);
        result
    }

    async fn create_file_locked(
        &self,
        path: &SanitizedPath,
        content: ByteStream,
        identity: &Identity,
    ) -> FsResult<Inode> {
        match self.store.get(&path.full).await {
            Ok(existing) => {
                return Err(FsError::AlreadyExists(format!(
                    "entry at {} already exists on {}",
                    path.full,
                    existing
                        .instance_id
                        .unwrap_or_else(|| "a global backend".to_string())
                )));
            }
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.ensure_parents(&path.full).await?;

        let backend_kind = self.backends.default_kind;
        let backend = self.backends.by_kind(backend_kind);
        let ctx = OpContext::local();
        let written = backend.create(&ctx, &path.full, content).await?;

        let mut inode = Inode::new_file(&path.full, written, backend_kind);
        inode.uid = identity.uid;
        inode.gid = identity.gid;
        if backend_kind == BackendKind::Localfs {
            inode.instance_id = Some(self.config.instance_id.clone());
        }

        if let Err(err) = self.store.create(&inode).await {
            // Compensate: the backend write must not outlive a failed
            // metadata commit.
            if let Err(cleanup) = backend.delete(&ctx, &path.full).await {
                tracing::error!(
                    path = %path.full,
                    error = %cleanup,
                    "compensating delete failed, orphan left in backend"
                );
            }
            return Err(err);
        }

        self.replicate_content(&inode).await?;
        self.cache.invalidate_prefix(&path.parent);
        Ok(inode)
    }

    /// Create a directory; succeeds idempotently when it already exists as
    /// a directory.
    pub async fn create_directory(
        &self,
        path: &SanitizedPath,
        identity: &Identity,
    ) -> FsResult<(Inode, bool)> {
        let lock = self.acquire_path_lock(&path.full).await?;
        let result = self.create_directory_locked(path, identity).await;
        self.release_path_lock(lock);
        result
    }

    async fn create_directory_locked(
        &self,
        path: &SanitizedPath,
        identity: &Identity,
    ) -> FsResult<(Inode, bool)> {
        match self.store.get(&path.full).await {
            Ok(existing) if existing.is_directory() => return Ok((existing, false)),
            Ok(_) => {
                return Err(FsError::AlreadyExists(format!(
                    "{} already exists as a file",
                    path.full
                )))
            }
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.ensure_parents(&path.full).await?;

        let backend_kind = self.backends.default_kind;
        let backend = self.backends.by_kind(backend_kind);
        backend.create_dir(&OpContext::local(), &path.full).await?;

        let mut inode = Inode::new_directory(&path.full, backend_kind);
        inode.uid = identity.uid;
        inode.gid = identity.gid;
        if backend_kind == BackendKind::Localfs {
            inode.instance_id = Some(self.config.instance_id.clone());
        }
        match self.store.create(&inode).await {
            Ok(()) => {}
            // Raced with another creator; directory creation stays
            // idempotent.
            Err(FsError::AlreadyExists(_)) => {
                let existing = self.store.get(&path.full).await?;
                return Ok((existing, false));
            }
            Err(err) => return Err(err),
        }

        self.cache.invalidate_prefix(&path.parent);
        Ok((inode, true))
    }

    /// Replace a file's content, creating it when absent. Returns the inode
    /// and whether it was newly created.
    pub async fn update_file(
        &self,
        path: &SanitizedPath,
        content: ByteStream,
        identity: &Identity,
    ) -> FsResult<(Inode, bool)> {
        let lock = self.acquire_path_lock(&path.full).await?;
        let result = self.update_file_locked(path, content, identity).await;
        self.release_path_lock(lock);
        result
    }

    async fn update_file_locked(
        &self,
        path: &SanitizedPath,
        content: ByteStream,
        identity: &Identity,
    ) -> FsResult<(Inode, bool)> {
        let mut inode = match self.store.get(&path.full).await {
            Ok(inode) => inode,
            Err(FsError::NotFound(_)) => {
                let created = self.create_file_locked(path, content, identity).await?;
                return Ok((created, true));
            }
            Err(err) => return Err(err),
        };
        if !inode.is_file() {
            return Err(FsError::InvalidInput(format!(
                "{} is a directory",
                path.full
            )));
        }

        // Writes go to whichever backend currently owns the file.
        let (backend, ctx) = self.select_backend(&inode);
        let written = backend.update(&ctx, &inode.path, content).await?;

        inode.size_bytes = written;
        inode.touch_modified();
        if inode.backend == BackendKind::Localfs && inode.instance_id.is_none() {
            inode.instance_id = Some(self.config.instance_id.clone());
        }
        self.store.update(&inode).await?;

        self.replicate_content(&inode).await?;
        self.cache.invalidate(&path.full);
        Ok((inode, false))
    }

    /// Remove a file or an empty directory.
    pub async fn delete(&self, path: &SanitizedPath) -> FsResult<()> {
        let lock = self.acquire_path_lock(&path.full).await?;
        let result = self.delete_locked(path).await;
        self.release_path_lock(lock);
        result
    }

    async fn delete_locked(&self, path: &SanitizedPath) -> FsResult<()> {
        let inode = self.store.get(&path.full).await?;

        if inode.is_directory() {
            let children = self.store.list_children(&path.full).await?;
            if !children.is_empty() {
                return Err(FsError::Internal(format!(
                    "directory {} is not empty",
                    path.full
                )));
            }
        }

        let (backend, ctx) = self.select_backend(&inode);
        match backend.delete(&ctx, &inode.path).await {
            Ok(()) => {}
            // The backend having no trace of it must not block removing
            // the metadata record.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        self.store.delete(&path.full).await?;

        if inode.is_file() {
            self.replicate_delete(&inode).await?;
        }

        self.cache.invalidate(&path.full);
        self.cache.invalidate_prefix(&path.parent);
        Ok(())
    }

    /// Walk up from the immediate parent to the root, creating missing
    /// directory records with default attributes. Idempotent.
    pub async fn ensure_parents(&self, path: &str) -> FsResult<()> {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        loop {
            match self.store.get(&current).await {
                Ok(inode) if inode.is_directory() => break,
                Ok(_) => {
                    return Err(FsError::InvalidInput(format!(
                        "ancestor {current} is not a directory"
                    )))
                }
                Err(FsError::NotFound(_)) => {
                    missing.push(current.clone());
                    if current == "/" {
                        break;
                    }
                    current = parent_of(&current);
                }
                Err(err) => return Err(err),
            }
        }

        // Create from the root downward so every record's parent exists.
        for dir in missing.into_iter().rev() {
            let mut inode = Inode::new_directory(&dir, self.backends.default_kind);
            if self.backends.default_kind == BackendKind::Localfs {
                inode.instance_id = Some(self.config.instance_id.clone());
            }
            match self.store.create(&inode).await {
                Ok(()) | Err(FsError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{stream_from_bytes, NoopBackend};
    use crate::cache::CacheConfig;
    use crate::core::path::sanitize;
    use crate::locks::LocalLockManager;
    use crate::metadata::MemoryMetadataStore;

    fn identity() -> Identity {
        Identity {
            user: "alice".to_string(),
            uid: 1000,
            gid: 1000,
        }
    }

    async fn engine_with_localfs() -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
        let cache = Arc::new(MetadataCache::new(CacheConfig::default()));
        let locks: SharedLockManager = Arc::new(LocalLockManager::default());

        let localfs = crate::backends::LocalFsBackend::new(
            dir.path().to_path_buf(),
            "node-a".to_string(),
        )
        .unwrap();
        let mut backends = BackendSet::new(
            BackendKind::Localfs,
            Arc::new(NoopBackend::new("proxy")),
        );
        backends.register(BackendKind::Localfs, Arc::new(localfs));

        let engine = Engine::new(
            store,
            backends,
            cache,
            locks,
            EngineConfig {
                instance_id: "node-a".to_string(),
                replication_enabled: false,
                replica_backend: None,
                require_replica_success: false,
            },
        );
        engine.ensure_root().await.unwrap();
        (Arc::new(engine), dir)
    }

    #[tokio::test]
    async fn test_create_then_read_round_trip() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("a/b/c.txt").unwrap();

        let inode = engine
            .create_file(&path, stream_from_bytes(b"hello".to_vec()), &identity())
            .await
            .unwrap();
        assert_eq!(inode.size_bytes, 5);
        assert_eq!(inode.instance_id.as_deref(), Some("node-a"));

        let (meta, stream) = engine.get_file("/a/b/c.txt").await.unwrap();
        assert_eq!(meta.size_bytes, 5);
        let content = crate::backends::collect_stream(stream).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn test_auto_parents() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("x/y/z.bin").unwrap();
        engine
            .create_file(&path, stream_from_bytes(vec![0xde, 0xad]), &identity())
            .await
            .unwrap();

        let x = engine.head("/x").await.unwrap();
        assert!(x.is_directory());
        assert_eq!(x.mode, "0755");
        assert_eq!(x.uid, 0);

        let children = engine.list_directory("/x").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "y");
        assert!(children[0].is_directory());
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("f.txt").unwrap();
        engine
            .create_file(&path, stream_from_bytes(b"one".to_vec()), &identity())
            .await
            .unwrap();
        let err = engine
            .create_file(&path, stream_from_bytes(b"two".to_vec()), &identity())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_creates_when_absent() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("new.txt").unwrap();
        let (_, created) = engine
            .update_file(&path, stream_from_bytes(b"v1".to_vec()), &identity())
            .await
            .unwrap();
        assert!(created);

        let (inode, created) = engine
            .update_file(&path, stream_from_bytes(b"v2-longer".to_vec()), &identity())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(inode.size_bytes, 9);
    }

    #[tokio::test]
    async fn test_delete_non_empty_directory_refused() {
        let (engine, _dir) = engine_with_localfs().await;
        let file = sanitize("d/f").unwrap();
        engine
            .create_file(&file, stream_from_bytes(b"x".to_vec()), &identity())
            .await
            .unwrap();

        let dir = sanitize("d").unwrap();
        let err = engine.delete(&dir).await.unwrap_err();
        assert!(err.to_string().contains("not empty"));

        engine.delete(&file).await.unwrap();
        engine.delete(&dir).await.unwrap();
        assert!(engine.head("/d").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_directory_idempotent() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("docs").unwrap();
        let (_, created) = engine.create_directory(&path, &identity()).await.unwrap();
        assert!(created);
        let (_, created) = engine.create_directory(&path, &identity()).await.unwrap();
        assert!(!created);

        // A file at the path is a conflict.
        let file = sanitize("docs2").unwrap();
        engine
            .create_file(&file, stream_from_bytes(b"x".to_vec()), &identity())
            .await
            .unwrap();
        let err = engine
            .create_directory(&file, &identity())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_cache_reflects_mutation() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("cached.txt").unwrap();
        engine
            .create_file(&path, stream_from_bytes(b"aa".to_vec()), &identity())
            .await
            .unwrap();

        // Prime the cache.
        assert_eq!(engine.head("/cached.txt").await.unwrap().size_bytes, 2);

        engine
            .update_file(&path, stream_from_bytes(b"bbbb".to_vec()), &identity())
            .await
            .unwrap();
        // The invalidation means the next read sees the new size.
        assert_eq!(engine.head("/cached.txt").await.unwrap().size_bytes, 4);
    }

    #[tokio::test]
    async fn test_recursive_listing_bounded() {
        let (engine, _dir) = engine_with_localfs().await;
        for p in ["a/1.txt", "a/b/2.txt", "a/b/c/3.txt"] {
            let path = sanitize(p).unwrap();
            engine
                .create_file(&path, stream_from_bytes(b"x".to_vec()), &identity())
                .await
                .unwrap();
        }

        let all = engine.list_recursive("/a", None).await.unwrap();
        let mut paths: Vec<&str> = all.iter().map(|i| i.path.as_str()).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["/a/1.txt", "/a/b", "/a/b/2.txt", "/a/b/c", "/a/b/c/3.txt"]
        );

        // Depth 1 sees only the direct children.
        let shallow = engine.list_recursive("/a", Some(1)).await.unwrap();
        let mut paths: Vec<&str> = shallow.iter().map(|i| i.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/a/1.txt", "/a/b"]);
    }

    #[tokio::test]
    async fn test_get_file_rejects_directory() {
        let (engine, _dir) = engine_with_localfs().await;
        let path = sanitize("somedir").unwrap();
        engine.create_directory(&path, &identity()).await.unwrap();
        let err = engine.get_file("/somedir").await.err().unwrap();
        assert!(matches!(err, FsError::InvalidInput(_)));
    }
}
