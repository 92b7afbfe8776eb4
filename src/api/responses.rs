//! # API Response Types
//!
//! Standardized response formats for the CallFS REST API:
//!
//! - Error bodies `{"code", "message"}` with the fixed code enumeration
//! - `X-CallFS-*` metadata headers emitted for files and directories
//! - Directory listing entries and the cross-instance conflict body

use axum::{
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::core::{FsError, Inode};

// ============================================================================
// Error responses
// ============================================================================

/// Error codes surfaced in response bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FileNotFound,
    FileAlreadyExists,
    AuthenticationFailed,
    PermissionDenied,
    RateLimitExceeded,
    InternalError,
}

/// JSON error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// API error with its HTTP status
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InternalError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AuthenticationFailed,
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<FsError> for ApiError {
    fn from(err: FsError) -> Self {
        let message = err.to_string();
        match err {
            FsError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorCode::FileNotFound, message)
            }
            FsError::AlreadyExists(_) => Self::new(
                StatusCode::CONFLICT,
                ErrorCode::FileAlreadyExists,
                message,
            ),
            FsError::Unauthorized(_) => Self::new(
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthenticationFailed,
                message,
            ),
            FsError::Forbidden(_) => Self::new(
                StatusCode::FORBIDDEN,
                ErrorCode::PermissionDenied,
                message,
            ),
            FsError::InvalidInput(_) => {
                Self::new(StatusCode::BAD_REQUEST, ErrorCode::InternalError, message)
            }
            FsError::Gone(_) => Self::new(StatusCode::GONE, ErrorCode::InternalError, message),
            FsError::Upstream(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                ErrorCode::InternalError,
                message,
            ),
            FsError::Transient(_) | FsError::Internal(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalError,
                message,
            ),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Metadata headers
// ============================================================================

pub const HDR_TYPE: &str = "x-callfs-type";
pub const HDR_SIZE: &str = "x-callfs-size";
pub const HDR_MODE: &str = "x-callfs-mode";
pub const HDR_UID: &str = "x-callfs-uid";
pub const HDR_GID: &str = "x-callfs-gid";
pub const HDR_MTIME: &str = "x-callfs-mtime";
pub const HDR_INSTANCE: &str = "x-callfs-instance-id";

/// Inode attributes as `X-CallFS-*` response headers.
pub fn inode_headers(inode: &Inode) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    put(HDR_TYPE, inode.kind.as_str().to_string());
    put(HDR_SIZE, inode.size_bytes.to_string());
    put(HDR_MODE, inode.mode.clone());
    put(HDR_UID, inode.uid.to_string());
    put(HDR_GID, inode.gid.to_string());
    put(HDR_MTIME, inode.mtime.to_rfc3339());
    if let Some(instance) = &inode.instance_id {
        put(HDR_INSTANCE, instance.clone());
    }
    headers
}

// ============================================================================
// Listing and conflict bodies
// ============================================================================

/// One entry in a directory listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub size_bytes: u64,
    pub mode: String,
    pub uid: u32,
    pub gid: u32,
    pub mtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl From<&Inode> for DirEntry {
    fn from(inode: &Inode) -> Self {
        Self {
            name: inode.name.clone(),
            kind: inode.kind.as_str().to_string(),
            path: inode.path.clone(),
            size_bytes: inode.size_bytes,
            mode: inode.mode.clone(),
            uid: inode.uid,
            gid: inode.gid,
            mtime: inode.mtime.to_rfc3339(),
            instance_id: inode.instance_id.clone(),
        }
    }
}

/// Body for a POST that collides with a file owned elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossInstanceConflict {
    pub error: String,
    pub existing_path: String,
    pub instance_id: String,
    pub backend_type: String,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
}

impl CrossInstanceConflict {
    pub fn new(inode: &Inode, owner: &str, update_url: Option<String>) -> Self {
        Self {
            error: "file exists on another instance".to_string(),
            existing_path: inode.path.clone(),
            instance_id: owner.to_string(),
            backend_type: inode.backend.as_str().to_string(),
            suggestion: format!(
                "use PUT {} to update the existing file in place",
                inode.path
            ),
            update_url,
        }
    }
}
