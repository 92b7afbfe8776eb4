//! WebSocket streaming transfers.
//!
//! `GET /v1/files/ws/{p}?mode=download|upload` upgrades to a socket that
//! either streams the file out as binary frames or collects binary frames
//! into a PUT-style replace. Close codes carry the error taxonomy since a
//! WebSocket response has no status line to speak through.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::StreamExt;

use super::responses::ApiError;
use super::state::AppState;
use crate::auth::{Identity, Operation};
use crate::backends::stream_from_bytes;
use crate::core::path::SanitizedPath;
use crate::core::FsError;

/// Application close codes in the 4xxx private range
const CLOSE_NOT_FOUND: u16 = 4404;
const CLOSE_CONFLICT: u16 = 4409;
const CLOSE_FORBIDDEN: u16 = 4403;
const CLOSE_BAD_REQUEST: u16 = 4400;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Download,
    Upload,
}

impl StreamMode {
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw {
            Some("download") => Ok(StreamMode::Download),
            Some("upload") => Ok(StreamMode::Upload),
            _ => Err(ApiError::bad_request(
                "mode query parameter must be download or upload",
            )),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            StreamMode::Download => Operation::Read,
            StreamMode::Upload => Operation::Write,
        }
    }
}

fn close_code_for(err: &FsError) -> u16 {
    match err {
        FsError::NotFound(_) => CLOSE_NOT_FOUND,
        FsError::AlreadyExists(_) => CLOSE_CONFLICT,
        FsError::Unauthorized(_) | FsError::Forbidden(_) => CLOSE_FORBIDDEN,
        FsError::InvalidInput(_) => CLOSE_BAD_REQUEST,
        _ => close_code::ERROR,
    }
}

async fn close_with_error(mut socket: WebSocket, err: FsError) {
    let frame = CloseFrame {
        code: close_code_for(&err),
        reason: Cow::Owned(err.to_string()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Drive one upgraded socket to completion.
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    path: SanitizedPath,
    mode: StreamMode,
    identity: Identity,
) {
    match mode {
        StreamMode::Download => stream_download(socket, state, path).await,
        StreamMode::Upload => collect_upload(socket, state, path, identity).await,
    }
}

async fn stream_download(mut socket: WebSocket, state: Arc<AppState>, path: SanitizedPath) {
    let (_, mut stream) = match state.engine.get_file(&path.full).await {
        Ok(opened) => opened,
        Err(err) => {
            close_with_error(socket, err).await;
            return;
        }
    };

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if socket.send(Message::Binary(bytes.to_vec())).await.is_err() {
                    // Peer went away mid-stream.
                    return;
                }
            }
            Err(err) => {
                close_with_error(socket, FsError::Internal(err.to_string())).await;
                return;
            }
        }
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed("transfer complete"),
        })))
        .await;
}

async fn collect_upload(
    mut socket: WebSocket,
    state: Arc<AppState>,
    path: SanitizedPath,
    identity: Identity,
) {
    let mut content: Vec<u8> = Vec::new();
    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(bytes))) => content.extend_from_slice(&bytes),
            Some(Ok(Message::Text(text))) => content.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!(error = %err, "websocket upload interrupted");
                return;
            }
        }
    }

    match state
        .engine
        .update_file(&path, stream_from_bytes(content), &identity)
        .await
    {
        Ok(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Cow::Borrowed("upload stored"),
                })))
                .await;
        }
        Err(err) => close_with_error(socket, err).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(
            StreamMode::parse(Some("download")).unwrap(),
            StreamMode::Download
        );
        assert_eq!(
            StreamMode::parse(Some("upload")).unwrap(),
            StreamMode::Upload
        );
        assert!(StreamMode::parse(Some("sideways")).is_err());
        assert!(StreamMode::parse(None).is_err());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code_for(&FsError::NotFound("x".into())), 4404);
        assert_eq!(close_code_for(&FsError::AlreadyExists("x".into())), 4409);
        assert_eq!(close_code_for(&FsError::Forbidden("x".into())), 4403);
        assert_eq!(
            close_code_for(&FsError::Internal("x".into())),
            close_code::ERROR
        );
    }
}
