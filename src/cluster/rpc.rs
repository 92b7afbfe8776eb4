//! Raft RPC types and the HTTP client carrying them.
//!
//! All node-to-node traffic is JSON over POST to `/internal/raft/*` routes,
//! authenticated with the shared internal secret. The same client also
//! forwards metadata commands from followers to the leader.

use reqwest::header;
use serde::{Deserialize, Serialize};

use super::command::{CommandOutcome, MetadataCommand};
use super::log_store::{LogEntry, StoredSnapshot};
use crate::core::{FsError, FsResult};

pub const VOTE_PATH: &str = "/internal/raft/vote";
pub const APPEND_PATH: &str = "/internal/raft/append";
pub const SNAPSHOT_PATH: &str = "/internal/raft/snapshot";
pub const JOIN_PATH: &str = "/internal/raft/join";
pub const APPLY_PATH: &str = "/internal/raft/metadata/apply";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known replicated when `success`
    pub match_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub snapshot: StoredSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Cluster membership join, issued to the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: String,
    pub raft_addr: String,
    pub api_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: String,
    pub leader_id: String,
}

/// HTTP client for node-to-node raft traffic.
pub struct RaftClient {
    client: reqwest::Client,
    internal_secret: String,
}

impl RaftClient {
    pub fn new(internal_secret: String, timeout: std::time::Duration) -> FsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FsError::Internal(format!("raft http client: {e}")))?;
        Ok(Self {
            client,
            internal_secret,
        })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        base: &str,
        path: &str,
        request: &Req,
    ) -> FsResult<Resp> {
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.internal_secret),
            )
            .json(request)
            .send()
            .await
            .map_err(|e| FsError::Upstream(format!("raft rpc {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FsError::Upstream(format!(
                "raft rpc {url}: peer answered {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| FsError::Upstream(format!("raft rpc {url}: bad body: {e}")))
    }

    pub async fn request_vote(&self, addr: &str, request: &VoteRequest) -> FsResult<VoteResponse> {
        self.post(addr, VOTE_PATH, request).await
    }

    pub async fn append_entries(
        &self,
        addr: &str,
        request: &AppendEntriesRequest,
    ) -> FsResult<AppendEntriesResponse> {
        self.post(addr, APPEND_PATH, request).await
    }

    pub async fn install_snapshot(
        &self,
        addr: &str,
        request: &InstallSnapshotRequest,
    ) -> FsResult<InstallSnapshotResponse> {
        self.post(addr, SNAPSHOT_PATH, request).await
    }

    /// Forward a write command to the leader's api endpoint.
    pub async fn forward_command(
        &self,
        api_endpoint: &str,
        command: &MetadataCommand,
    ) -> FsResult<CommandOutcome> {
        self.post(api_endpoint, APPLY_PATH, command).await
    }

    /// Ask a peer's leader endpoint to admit this node.
    pub async fn join(&self, api_endpoint: &str, request: &JoinRequest) -> FsResult<JoinResponse> {
        self.post(api_endpoint, JOIN_PATH, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::command::LogCommand;

    #[test]
    fn test_append_request_json_round_trip() {
        let request = AppendEntriesRequest {
            term: 3,
            leader_id: "node-1".to_string(),
            prev_log_index: 10,
            prev_log_term: 2,
            entries: vec![LogEntry {
                term: 3,
                index: 11,
                command: LogCommand::Noop,
            }],
            leader_commit: 10,
        };
        let json = serde_json::to_string(&request).unwrap();
        let decoded: AppendEntriesRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.entries[0].index, 11);
    }

    #[test]
    fn test_join_shapes() {
        let response: JoinResponse = serde_json::from_str(
            r#"{"status":"joined","leader_id":"node-1"}"#,
        )
        .unwrap();
        assert_eq!(response.status, "joined");
    }
}
