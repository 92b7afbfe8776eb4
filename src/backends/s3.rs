//! Object-store storage driver.
//!
//! Speaks the S3 REST dialect against a configured bucket with SigV4 request
//! signing. Update is an unconditional replace; directories are synthesized
//! from key prefixes plus optional zero-byte `dir/` marker objects; listing
//! uses delimiter pagination with continuation tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{
    collect_stream, ByteStream, OpContext, Storage, StorageEntry, StorageError, StorageResult,
};
use crate::config::ObjectStoreConfig;
use crate::core::{BackendKind, Inode};

type HmacSha256 = Hmac<Sha256>;

const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3-compatible object store driver.
pub struct ObjectStoreBackend {
    client: reqwest::Client,
    config: ObjectStoreConfig,
    base_url: String,
    host: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListContents>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListContents {
    key: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(config: ObjectStoreConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::Fatal("object store bucket not set".into()));
        }
        let base_url = match &config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", config.region),
        };
        let host = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Fatal(format!("http client: {e}")))?;

        Ok(Self {
            client,
            config,
            base_url,
            host,
        })
    }

    fn object_key(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    fn uri_path(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!("/{}/{}", self.config.bucket, encoded.join("/"))
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// SigV4 Authorization header plus the date/content headers it covers.
    fn sign(
        &self,
        method: &Method,
        uri_path: &str,
        query: &[(String, String)],
        payload_sha256: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let mut sorted_query: Vec<(String, String)> = query.to_vec();
        sorted_query.sort();
        let canonical_query = sorted_query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    urlencoding::encode(k),
                    urlencoding::encode(v)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host, payload_sha256, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            uri_path,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_sha256
        );

        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = Self::hmac(
            format!("AWS4{}", self.config.secret_access_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = Self::hmac(&k_date, self.config.region.as_bytes());
        let k_service = Self::hmac(&k_region, b"s3");
        let k_signing = Self::hmac(&k_service, b"aws4_request");
        let signature = hex::encode(Self::hmac(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key_id, scope, signed_headers, signature
        );

        vec![
            ("authorization".to_string(), authorization),
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-content-sha256".to_string(), payload_sha256.to_string()),
        ]
    }

    async fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> StorageResult<reqwest::Response> {
        let uri_path = self.uri_path(key);
        let payload_sha = match &body {
            Some(bytes) => hex::encode(Sha256::digest(bytes)),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let headers = self.sign(&method, &uri_path, query, &payload_sha, Utc::now());

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, uri_path)
        } else {
            let qs = query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}{}?{}", self.base_url, uri_path, qs)
        };

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if method == Method::PUT {
            if let Some(sse) = &self.config.sse {
                request = request.header("x-amz-server-side-encryption", sse);
            }
            if let Some(kms) = &self.config.sse_kms_key_id {
                request = request.header("x-amz-server-side-encryption-aws-kms-key-id", kms);
            }
            if let Some(acl) = &self.config.acl {
                request = request.header("x-amz-acl", acl);
            }
        }
        if let Some(bytes) = body {
            request = request.body(bytes);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::Transient(format!("object store request: {e}")))
    }

    fn check_status(status: StatusCode, context: &str) -> StorageResult<()> {
        if status.is_success() {
            return Ok(());
        }
        Err(match status {
            StatusCode::NOT_FOUND => StorageError::NotFound(context.to_string()),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                StorageError::Forbidden(context.to_string())
            }
            s if s.is_server_error() => {
                StorageError::Transient(format!("{context}: upstream {s}"))
            }
            s => StorageError::Fatal(format!("{context}: unexpected status {s}")),
        })
    }

    async fn key_exists(&self, key: &str) -> StorageResult<Option<u64>> {
        let response = self.request(Method::HEAD, key, &[], None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                Self::check_status(status, key)?;
                let size = response
                    .headers()
                    .get("content-length")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(Some(size))
            }
        }
    }

    /// One ListObjectsV2 page under `prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: Option<u32>,
    ) -> StorageResult<ListBucketResult> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
            ("delimiter".to_string(), "/".to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token".to_string(), token.to_string()));
        }
        if let Some(max) = max_keys {
            query.push(("max-keys".to_string(), max.to_string()));
        }

        let response = self.request(Method::GET, "", &query, None).await?;
        Self::check_status(response.status(), "list")?;
        let text = response
            .text()
            .await
            .map_err(|e| StorageError::Transient(format!("list body: {e}")))?;
        quick_xml::de::from_str(&text)
            .map_err(|e| StorageError::Fatal(format!("list response parse: {e}")))
    }
}

#[async_trait]
impl Storage for ObjectStoreBackend {
    async fn open(&self, _ctx: &OpContext, path: &str) -> StorageResult<ByteStream> {
        let key = Self::object_key(path);
        let response = self.request(Method::GET, &key, &[], None).await?;
        Self::check_status(response.status(), &key)?;

        use futures::TryStreamExt;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }

    async fn create(
        &self,
        ctx: &OpContext,
        path: &str,
        content: ByteStream,
    ) -> StorageResult<u64> {
        let key = Self::object_key(path);
        if self.key_exists(&key).await?.is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "object {key} already exists"
            )));
        }
        self.update(ctx, path, content).await
    }

    async fn update(
        &self,
        _ctx: &OpContext,
        path: &str,
        content: ByteStream,
    ) -> StorageResult<u64> {
        let key = Self::object_key(path);
        // The payload hash in the signature covers the whole body, so the
        // upload is buffered rather than streamed.
        let body = collect_stream(content).await?;
        let size = body.len() as u64;
        let response = self.request(Method::PUT, &key, &[], Some(body)).await?;
        Self::check_status(response.status(), &key)?;
        Ok(size)
    }

    async fn delete(&self, _ctx: &OpContext, path: &str) -> StorageResult<()> {
        let key = Self::object_key(path);
        let response = self.request(Method::DELETE, &key, &[], None).await?;
        // S3 deletes are idempotent; 404 means already gone.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response.status(), &key)
    }

    async fn stat(&self, _ctx: &OpContext, path: &str) -> StorageResult<Inode> {
        let key = Self::object_key(path);
        let canonical = format!("/{key}");

        if let Some(size) = self.key_exists(&key).await? {
            return Ok(Inode::new_file(&canonical, size, BackendKind::ObjectStore));
        }
        // Marker object or any key under the prefix synthesizes a directory.
        if self.key_exists(&format!("{key}/")).await?.is_some() {
            return Ok(Inode::new_directory(&canonical, BackendKind::ObjectStore));
        }
        let page = self.list_page(&format!("{key}/"), None, Some(1)).await?;
        if !page.contents.is_empty() || !page.common_prefixes.is_empty() {
            return Ok(Inode::new_directory(&canonical, BackendKind::ObjectStore));
        }
        Err(StorageError::NotFound(format!("no object at {key}")))
    }

    async fn list_dir(&self, _ctx: &OpContext, path: &str) -> StorageResult<Vec<StorageEntry>> {
        let key = Self::object_key(path);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .list_page(&prefix, continuation.as_deref(), None)
                .await?;

            for item in &page.contents {
                let name = item.key.trim_start_matches(&prefix);
                // Skip the marker object for the directory itself.
                if name.is_empty() {
                    continue;
                }
                entries.push(StorageEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size_bytes: item.size,
                });
            }
            for common in &page.common_prefixes {
                let name = common
                    .prefix
                    .trim_start_matches(&prefix)
                    .trim_end_matches('/');
                if !name.is_empty() {
                    entries.push(StorageEntry {
                        name: name.to_string(),
                        is_dir: true,
                        size_bytes: 0,
                    });
                }
            }

            if page.is_truncated {
                continuation = page.next_continuation_token;
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir(&self, _ctx: &OpContext, path: &str) -> StorageResult<()> {
        if !self.config.directory_markers {
            return Ok(());
        }
        let key = format!("{}/", Self::object_key(path));
        let response = self.request(Method::PUT, &key, &[], Some(Vec::new())).await?;
        Self::check_status(response.status(), &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ObjectStoreBackend {
        ObjectStoreBackend::new(ObjectStoreConfig {
            enabled: true,
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            bucket: "bucket".to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            sse: None,
            sse_kms_key_id: None,
            acl: None,
            directory_markers: true,
        })
        .unwrap()
    }

    #[test]
    fn test_uri_path_encoding() {
        let backend = backend();
        assert_eq!(backend.uri_path("a/b.txt"), "/bucket/a/b.txt");
        assert_eq!(backend.uri_path("a b/c"), "/bucket/a%20b/c");
    }

    #[test]
    fn test_sign_is_deterministic() {
        let backend = backend();
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 5, 1, 12, 0, 0).unwrap();
        let a = backend.sign(&Method::GET, "/bucket/k", &[], EMPTY_PAYLOAD_SHA256, now);
        let b = backend.sign(&Method::GET, "/bucket/k", &[], EMPTY_PAYLOAD_SHA256, now);
        assert_eq!(a, b);
        let auth = &a[0].1;
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/s3/aws4_request"));
    }

    #[test]
    fn test_list_response_parse() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListBucketResult>
                <IsTruncated>true</IsTruncated>
                <NextContinuationToken>tok123</NextContinuationToken>
                <Contents><Key>dir/file.txt</Key><Size>42</Size></Contents>
                <Contents><Key>dir/</Key><Size>0</Size></Contents>
                <CommonPrefixes><Prefix>dir/sub/</Prefix></CommonPrefixes>
            </ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert!(parsed.is_truncated);
        assert_eq!(parsed.next_continuation_token.as_deref(), Some("tok123"));
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "dir/file.txt");
        assert_eq!(parsed.contents[0].size, 42);
        assert_eq!(parsed.common_prefixes[0].prefix, "dir/sub/");
    }

    #[test]
    fn test_object_key() {
        assert_eq!(ObjectStoreBackend::object_key("/a/b"), "a/b");
        assert_eq!(ObjectStoreBackend::object_key("a/b"), "a/b");
    }
}
