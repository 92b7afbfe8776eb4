//! Peer-proxy storage driver.
//!
//! Satisfies the storage contract by forwarding operations to the sibling
//! instance named in the operation context. Creation is always local to the
//! intended owner, so `create` and `create_dir` are definite errors here.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header, Body, Method, StatusCode};
use serde::Deserialize;

use super::{ByteStream, OpContext, Storage, StorageEntry, StorageError, StorageResult};
use crate::core::{BackendKind, FileKind, Inode};

/// Directory entry shape served by `/v1/files` on a directory.
#[derive(Debug, Deserialize)]
struct PeerDirEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size_bytes: u64,
}

/// Storage driver that proxies to sibling instances over HTTP.
pub struct PeerProxyBackend {
    client: reqwest::Client,
    /// instance_id → externally reachable base URL
    peers: HashMap<String, String>,
    internal_secret: String,
}

impl PeerProxyBackend {
    pub fn new(
        peers: HashMap<String, String>,
        internal_secret: String,
        skip_tls_verify: bool,
    ) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()
            .map_err(|e| StorageError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            peers,
            internal_secret,
        })
    }

    fn peer_url(&self, ctx: &OpContext, path: &str) -> StorageResult<String> {
        let instance = ctx.instance_id.as_deref().ok_or_else(|| {
            StorageError::Fatal("proxy operation without an owning instance".to_string())
        })?;
        let base = self.peers.get(instance).ok_or_else(|| {
            StorageError::Transient(format!("no known endpoint for instance {instance}"))
        })?;
        let rel = path.trim_start_matches('/');
        Ok(format!("{}/v1/files/{}", base.trim_end_matches('/'), rel))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url).header(
            header::AUTHORIZATION,
            format!("Bearer {}", self.internal_secret),
        )
    }

    fn map_status(status: StatusCode, context: &str) -> StorageResult<()> {
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(context.to_string())),
            other => Err(StorageError::Transient(format!(
                "{context}: peer answered {other}"
            ))),
        }
    }

    fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[async_trait]
impl Storage for PeerProxyBackend {
    async fn open(&self, ctx: &OpContext, path: &str) -> StorageResult<ByteStream> {
        let url = self.peer_url(ctx, path)?;
        let response = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("peer open: {e}")))?;
        Self::map_status(response.status(), path)?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }

    async fn create(
        &self,
        _ctx: &OpContext,
        path: &str,
        _content: ByteStream,
    ) -> StorageResult<u64> {
        Err(StorageError::Fatal(format!(
            "create of {path} must run on the owning instance"
        )))
    }

    async fn update(
        &self,
        ctx: &OpContext,
        path: &str,
        content: ByteStream,
    ) -> StorageResult<u64> {
        let url = self.peer_url(ctx, path)?;
        let response = self
            .request(Method::PUT, &url)
            .body(Body::wrap_stream(content))
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("peer update: {e}")))?;
        Self::map_status(response.status(), path)?;

        let size = Self::header_str(&response, "X-CallFS-Size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(size)
    }

    async fn delete(&self, ctx: &OpContext, path: &str) -> StorageResult<()> {
        let url = self.peer_url(ctx, path)?;
        let response = self
            .request(Method::DELETE, &url)
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("peer delete: {e}")))?;
        Self::map_status(response.status(), path)
    }

    async fn stat(&self, ctx: &OpContext, path: &str) -> StorageResult<Inode> {
        let url = self.peer_url(ctx, path)?;
        let response = self
            .request(Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("peer stat: {e}")))?;
        Self::map_status(response.status(), path)?;

        let kind = match Self::header_str(&response, "X-CallFS-Type").as_deref() {
            Some("directory") => FileKind::Directory,
            _ => FileKind::File,
        };
        let size = Self::header_str(&response, "X-CallFS-Size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let canonical = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let mut inode = match kind {
            FileKind::Directory => Inode::new_directory(&canonical, BackendKind::Localfs),
            FileKind::File => Inode::new_file(&canonical, size, BackendKind::Localfs),
        };
        if let Some(mode) = Self::header_str(&response, "X-CallFS-Mode") {
            inode.mode = mode;
        }
        if let Some(uid) = Self::header_str(&response, "X-CallFS-UID").and_then(|v| v.parse().ok())
        {
            inode.uid = uid;
        }
        if let Some(gid) = Self::header_str(&response, "X-CallFS-GID").and_then(|v| v.parse().ok())
        {
            inode.gid = gid;
        }
        if let Some(mtime) = Self::header_str(&response, "X-CallFS-MTime")
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(&v).ok())
        {
            inode.mtime = mtime.with_timezone(&chrono::Utc);
        }
        inode.instance_id = Self::header_str(&response, "X-CallFS-Instance-ID")
            .or_else(|| ctx.instance_id.clone());
        Ok(inode)
    }

    async fn list_dir(&self, ctx: &OpContext, path: &str) -> StorageResult<Vec<StorageEntry>> {
        let url = self.peer_url(ctx, path)?;
        let response = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("peer list: {e}")))?;
        Self::map_status(response.status(), path)?;

        let entries: Vec<PeerDirEntry> = response
            .json()
            .await
            .map_err(|e| StorageError::Transient(format!("peer list body: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| StorageEntry {
                is_dir: e.kind == "directory",
                name: e.name,
                size_bytes: e.size_bytes,
            })
            .collect())
    }

    async fn create_dir(&self, _ctx: &OpContext, path: &str) -> StorageResult<()> {
        Err(StorageError::Fatal(format!(
            "create_dir of {path} must run on the owning instance"
        )))
    }
}
