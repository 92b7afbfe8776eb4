//! Storage backends
//!
//! The [`Storage`] trait is the uniform contract for file and directory I/O
//! across drivers:
//!
//! - `localfs`: instance-local filesystem, the only driver with an owning
//!   instance identity
//! - `s3`: object store addressed by bucket/key
//! - `proxy`: forwards operations to a sibling instance over HTTP
//! - [`NoopBackend`]: stands in for disabled drivers
//!
//! Paths handed to a backend are root-relative. Content travels as byte
//! streams; dropping a stream closes the underlying handle.

pub mod localfs;
pub mod proxy;
pub mod s3;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

use crate::core::{BackendKind, FsError, Inode};

pub use localfs::LocalFsBackend;
pub use proxy::PeerProxyBackend;
pub use s3::ObjectStoreBackend;

/// Streaming file content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Storage error taxonomy
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<StorageError> for FsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => FsError::NotFound(msg),
            StorageError::AlreadyExists(msg) => FsError::AlreadyExists(msg),
            StorageError::Forbidden(msg) => FsError::Forbidden(msg),
            StorageError::Transient(msg) => FsError::Transient(msg),
            StorageError::Fatal(msg) => FsError::Internal(msg),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => StorageError::AlreadyExists(err.to_string()),
            ErrorKind::PermissionDenied => StorageError::Forbidden(err.to_string()),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                StorageError::Transient(err.to_string())
            }
            _ => StorageError::Fatal(err.to_string()),
        }
    }
}

/// Per-operation routing context.
///
/// The engine attaches the owning instance here when an operation must be
/// proxied to a sibling.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub instance_id: Option<String>,
}

impl OpContext {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn for_instance(instance_id: &str) -> Self {
        Self {
            instance_id: Some(instance_id.to_string()),
        }
    }
}

/// One entry in a backend directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

/// Uniform contract for file and directory I/O.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a file for reading.
    async fn open(&self, ctx: &OpContext, path: &str) -> StorageResult<ByteStream>;

    /// Exclusive create; fails with already-exists when the path is taken.
    async fn create(&self, ctx: &OpContext, path: &str, content: ByteStream)
        -> StorageResult<u64>;

    /// Unconditional replace.
    async fn update(&self, ctx: &OpContext, path: &str, content: ByteStream)
        -> StorageResult<u64>;

    async fn delete(&self, ctx: &OpContext, path: &str) -> StorageResult<()>;

    /// Stat a path into an inode snapshot.
    async fn stat(&self, ctx: &OpContext, path: &str) -> StorageResult<Inode>;

    async fn list_dir(&self, ctx: &OpContext, path: &str) -> StorageResult<Vec<StorageEntry>>;

    async fn create_dir(&self, ctx: &OpContext, path: &str) -> StorageResult<()>;
}

/// Shared backend handle
pub type SharedStorage = Arc<dyn Storage>;

/// Answers every operation with "backend not enabled"; stands in for
/// drivers absent from the configuration.
pub struct NoopBackend {
    name: &'static str,
}

impl NoopBackend {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    fn disabled<T>(&self) -> StorageResult<T> {
        Err(StorageError::Fatal(format!(
            "{} backend not enabled",
            self.name
        )))
    }
}

#[async_trait]
impl Storage for NoopBackend {
    async fn open(&self, _ctx: &OpContext, _path: &str) -> StorageResult<ByteStream> {
        self.disabled()
    }

    async fn create(
        &self,
        _ctx: &OpContext,
        _path: &str,
        _content: ByteStream,
    ) -> StorageResult<u64> {
        self.disabled()
    }

    async fn update(
        &self,
        _ctx: &OpContext,
        _path: &str,
        _content: ByteStream,
    ) -> StorageResult<u64> {
        self.disabled()
    }

    async fn delete(&self, _ctx: &OpContext, _path: &str) -> StorageResult<()> {
        self.disabled()
    }

    async fn stat(&self, _ctx: &OpContext, _path: &str) -> StorageResult<Inode> {
        self.disabled()
    }

    async fn list_dir(&self, _ctx: &OpContext, _path: &str) -> StorageResult<Vec<StorageEntry>> {
        self.disabled()
    }

    async fn create_dir(&self, _ctx: &OpContext, _path: &str) -> StorageResult<()> {
        self.disabled()
    }
}

/// The backends an engine can route to, keyed by tag.
pub struct BackendSet {
    backends: HashMap<BackendKind, SharedStorage>,
    /// Proxy driver used whenever the owning instance is not this node
    pub proxy: SharedStorage,
    pub default_kind: BackendKind,
}

impl BackendSet {
    pub fn new(default_kind: BackendKind, proxy: SharedStorage) -> Self {
        Self {
            backends: HashMap::new(),
            proxy,
            default_kind,
        }
    }

    pub fn register(&mut self, kind: BackendKind, backend: SharedStorage) {
        self.backends.insert(kind, backend);
    }

    /// Driver for a backend tag; unknown tags get a noop.
    pub fn by_kind(&self, kind: BackendKind) -> SharedStorage {
        self.backends
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopBackend::new("unconfigured")))
    }

    pub fn default_backend(&self) -> SharedStorage {
        self.by_kind(self.default_kind)
    }
}

/// Collect a byte stream into memory. Drivers without streaming uploads
/// (the object store) and tests use this.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Vec<u8>> {
    use futures::StreamExt;
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf)
}

/// Wrap an in-memory buffer as a [`ByteStream`].
pub fn stream_from_bytes(bytes: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::once(async move {
        Ok(Bytes::from(bytes))
    }))
}
