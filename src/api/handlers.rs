//! # API Handlers
//!
//! Adapts HTTP requests into engine and link-manager calls and formats the
//! responses. Authorization always runs before any metadata lookup so a
//! permission failure cannot reveal whether a path exists.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::responses::{
    inode_headers, ApiError, ApiResult, CrossInstanceConflict, DirEntry, ErrorCode,
};
use super::state::AppState;
use super::ws;
use crate::auth::{Identity, Operation};
use crate::backends::ByteStream;
use crate::core::path::{sanitize, SanitizedPath};
use crate::core::FsError;

/// Query parameters on `/v1/files` routes
#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub mode: Option<String>,
}

/// Query parameters on `/v1/directories` routes
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub recursive: Option<String>,
    pub max_depth: Option<usize>,
}

impl ListQuery {
    fn is_recursive(&self) -> bool {
        match self.recursive.as_deref() {
            // A bare `?recursive` arrives as an empty string.
            Some("") | Some("1") | Some("true") => true,
            _ => false,
        }
    }
}

/// Request body for link generation
#[derive(Debug, Deserialize)]
pub struct GenerateLinkRequest {
    pub path: String,
    pub expiry_seconds: Option<i64>,
}

/// Response body for link generation
#[derive(Debug, Serialize)]
pub struct GenerateLinkResponse {
    pub url: String,
    pub token: String,
    pub expires: String,
}

fn sanitized(raw: &str) -> ApiResult<SanitizedPath> {
    sanitize(raw).map_err(ApiError::from)
}

fn body_stream(body: Body) -> ByteStream {
    Box::pin(
        body.into_data_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    )
}

fn stream_response(inode: &crate::core::Inode, stream: ByteStream) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    response.headers_mut().extend(inode_headers(inode));
    response
}

// ============================================================================
// /v1/files
// ============================================================================

/// GET and HEAD on files and directories, plus the WebSocket upgrade path
/// (`/v1/files/ws/{p}?mode=download|upload`).
pub async fn files_get(
    State(state): State<Arc<AppState>>,
    Path(raw_path): Path<String>,
    method: Method,
    Query(query): Query<FilesQuery>,
    Extension(identity): Extension<Identity>,
    upgrade: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    if let Some(rest) = raw_path.strip_prefix("ws/") {
        let Some(upgrade) = upgrade else {
            return Err(ApiError::bad_request(
                "the ws route requires a WebSocket upgrade",
            ));
        };
        let mode = ws::StreamMode::parse(query.mode.as_deref())?;
        let path = sanitized(rest)?;
        state
            .authorizer
            .authorize(&identity, mode.operation(), &path.full)?;
        let state = Arc::clone(&state);
        return Ok(upgrade
            .on_upgrade(move |socket| ws::handle_socket(socket, state, path, mode, identity)));
    }

    state
        .authorizer
        .authorize(&identity, Operation::Read, &raw_path)?;
    let path = sanitized(&raw_path)?;

    if method == Method::HEAD {
        let inode = state.engine.head(&path.full).await?;
        let mut response = StatusCode::OK.into_response();
        response.headers_mut().extend(inode_headers(&inode));
        return Ok(response);
    }

    let inode = state.engine.head(&path.full).await?;
    if inode.is_directory() {
        let children = state.engine.list_directory(&path.full).await?;
        let entries: Vec<DirEntry> = children.iter().map(DirEntry::from).collect();
        let mut response = Json(entries).into_response();
        response.headers_mut().extend(inode_headers(&inode));
        return Ok(response);
    }

    let (inode, stream) = state.engine.get_file(&path.full).await?;
    Ok(stream_response(&inode, stream))
}

/// POST: create a file (body) or a directory (trailing slash).
pub async fn files_post(
    State(state): State<Arc<AppState>>,
    Path(raw_path): Path<String>,
    Extension(identity): Extension<Identity>,
    body: Body,
) -> ApiResult<Response> {
    state
        .authorizer
        .authorize(&identity, Operation::Write, &raw_path)?;
    let wants_directory = raw_path.ends_with('/');
    let path = sanitized(&raw_path)?;

    if wants_directory {
        let (inode, created) = state.engine.create_directory(&path, &identity).await?;
        let status = if created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        let mut response = status.into_response();
        response.headers_mut().extend(inode_headers(&inode));
        return Ok(response);
    }

    match state
        .engine
        .create_file(&path, body_stream(body), &identity)
        .await
    {
        Ok(inode) => {
            let mut response = StatusCode::CREATED.into_response();
            response.headers_mut().extend(inode_headers(&inode));
            Ok(response)
        }
        Err(FsError::AlreadyExists(message)) => Ok(conflict_response(&state, &path, message).await),
        Err(err) => Err(err.into()),
    }
}

/// Existing-entry conflict; cross-instance collisions carry the structured
/// body pointing the caller at PUT.
async fn conflict_response(state: &AppState, path: &SanitizedPath, message: String) -> Response {
    let plain =
        |message: String| ApiError::new(StatusCode::CONFLICT, ErrorCode::FileAlreadyExists, message);

    let Ok(existing) = state.engine.head(&path.full).await else {
        return plain(message).into_response();
    };

    match existing.instance_id.as_deref() {
        Some(owner) if owner != state.engine.instance_id() && existing.is_file() => {
            // PUT on this instance forwards transparently, so the update
            // URL stays local.
            let update_url = Some(format!(
                "{}/v1/files{}",
                state.external_url.trim_end_matches('/'),
                existing.path
            ));
            let body = CrossInstanceConflict::new(&existing, owner, update_url);
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        _ => plain(message).into_response(),
    }
}

/// PUT: replace a file, creating it when absent.
pub async fn files_put(
    State(state): State<Arc<AppState>>,
    Path(raw_path): Path<String>,
    Extension(identity): Extension<Identity>,
    body: Body,
) -> ApiResult<Response> {
    state
        .authorizer
        .authorize(&identity, Operation::Write, &raw_path)?;
    if raw_path.ends_with('/') {
        return Err(ApiError::bad_request("PUT applies to files, not directories"));
    }
    let path = sanitized(&raw_path)?;

    let (inode, created) = state
        .engine
        .update_file(&path, body_stream(body), &identity)
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut response = status.into_response();
    response.headers_mut().extend(inode_headers(&inode));
    Ok(response)
}

/// DELETE: remove a file or an empty directory.
pub async fn files_delete(
    State(state): State<Arc<AppState>>,
    Path(raw_path): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<StatusCode> {
    state
        .authorizer
        .authorize(&identity, Operation::Delete, &raw_path)?;
    let path = sanitized(&raw_path)?;
    state.engine.delete(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// /v1/directories
// ============================================================================

/// Structured listing, optionally recursive with a bounded depth.
pub async fn directories_get(
    State(state): State<Arc<AppState>>,
    Path(raw_path): Path<String>,
    Query(query): Query<ListQuery>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<DirEntry>>> {
    state
        .authorizer
        .authorize(&identity, Operation::Read, &raw_path)?;
    let path = sanitized(&raw_path)?;

    let children = if query.is_recursive() {
        state
            .engine
            .list_recursive(&path.full, query.max_depth)
            .await?
    } else {
        state.engine.list_directory(&path.full).await?
    };
    Ok(Json(children.iter().map(DirEntry::from).collect()))
}

// ============================================================================
// /v1/links and /download
// ============================================================================

/// Mint a single-use download link.
pub async fn links_generate(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<GenerateLinkRequest>,
) -> ApiResult<(StatusCode, Json<GenerateLinkResponse>)> {
    state
        .authorizer
        .authorize(&identity, Operation::Link, &request.path)?;
    let path = sanitized(&request.path)?;
    let expiry = request
        .expiry_seconds
        .ok_or_else(|| ApiError::bad_request("expiry_seconds is required"))?;

    let link = state.links.generate(&path.full, expiry).await?;
    let url = format!(
        "{}/download/{}",
        state.external_url.trim_end_matches('/'),
        link.token
    );
    Ok((
        StatusCode::CREATED,
        Json(GenerateLinkResponse {
            url,
            token: link.token,
            expires: link.expires_at.to_rfc3339(),
        }),
    ))
}

/// Consume a single-use link and stream the file. Unauthenticated.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if token.is_empty() {
        return Err(ApiError::bad_request("missing token"));
    }
    let consumer_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let path = state.links.validate_and_consume(&token, &consumer_ip).await?;
    let (inode, stream) = state.engine.get_file(&path).await?;
    Ok(stream_response(&inode, stream))
}

// ============================================================================
// Liveness
// ============================================================================

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn metrics() -> String {
    // Exposition lives in the external metrics stack; this endpoint only
    // confirms the process is serving.
    format!(
        "callfs_up 1\ncallfs_version{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    )
}
