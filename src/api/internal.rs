//! Internal raft routes.
//!
//! Node-to-node traffic rides the same listener as the public API, guarded
//! by the internal secret in the auth middleware. The apply endpoint is the
//! leader-forward channel: it answers 200 with a command outcome (logical
//! errors travel inside the outcome), and 502 when this node does not lead.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use super::responses::ApiError;
use super::state::AppState;
use crate::cluster::rpc::{
    AppendEntriesRequest, InstallSnapshotRequest, JoinRequest, VoteRequest,
};
use crate::cluster::{MetadataCommand, RaftNode};

fn raft_node(state: &AppState) -> Result<&Arc<RaftNode>, ApiError> {
    state.raft.as_ref().ok_or_else(|| {
        ApiError::bad_request("this instance does not run the replicated metadata store")
    })
}

/// POST /internal/raft/join
pub async fn raft_join(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = raft_node(&state)?;
    let response = node.handle_join(request).await?;
    Ok(Json(response))
}

/// POST /internal/raft/metadata/apply, the leader-forward channel.
pub async fn raft_apply(
    State(state): State<Arc<AppState>>,
    Json(command): Json<MetadataCommand>,
) -> Result<impl IntoResponse, ApiError> {
    let node = raft_node(&state)?;
    if !node.is_leader().await {
        return Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            super::responses::ErrorCode::InternalError,
            "apply must be sent to the leader",
        ));
    }
    let outcome = node.propose(command).await?;
    Ok(Json(outcome))
}

/// POST /internal/raft/vote
pub async fn raft_vote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = raft_node(&state)?;
    Ok(Json(node.handle_request_vote(request).await))
}

/// POST /internal/raft/append
pub async fn raft_append(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = raft_node(&state)?;
    Ok(Json(node.handle_append_entries(request).await))
}

/// POST /internal/raft/snapshot
pub async fn raft_snapshot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = raft_node(&state)?;
    let response = node.handle_install_snapshot(request).await?;
    Ok(Json(response))
}
