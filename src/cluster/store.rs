//! Cluster-backed metadata store.
//!
//! Implements the store contract over the raft node: reads serve from local
//! committed state, writes commit through the log. A follower marshals the
//! command and posts it to the leader's api endpoint; the leader's reply
//! carries the wire error taxonomy back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::command::MetadataCommand;
use super::node::RaftNode;
use super::rpc::RaftClient;
use crate::core::{FsError, FsResult, Inode, LinkStatus, SingleUseLink};
use crate::metadata::MetadataStore;

/// Metadata store over the replicated log.
pub struct ClusterMetadataStore {
    node: Arc<RaftNode>,
    client: Arc<RaftClient>,
}

impl ClusterMetadataStore {
    pub fn new(node: Arc<RaftNode>, client: Arc<RaftClient>) -> Self {
        Self { node, client }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Commit a command: propose locally as leader, otherwise forward.
    async fn submit(&self, command: MetadataCommand) -> FsResult<Option<u64>> {
        if self.node.is_leader().await {
            return self.node.propose(command).await?.into_result();
        }

        let endpoint = self.node.leader_api_endpoint().await.ok_or_else(|| {
            FsError::Transient("no leader known for metadata write".to_string())
        })?;
        tracing::debug!(leader = %endpoint, "forwarding metadata command");
        self.client
            .forward_command(&endpoint, &command)
            .await?
            .into_result()
    }
}

#[async_trait]
impl MetadataStore for ClusterMetadataStore {
    async fn get(&self, path: &str) -> FsResult<Inode> {
        self.node.state_machine().get(path)
    }

    async fn create(&self, inode: &Inode) -> FsResult<()> {
        self.submit(MetadataCommand::CreateMetadata(inode.clone()))
            .await
            .map(|_| ())
    }

    async fn update(&self, inode: &Inode) -> FsResult<()> {
        self.submit(MetadataCommand::UpdateMetadata(inode.clone()))
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> FsResult<()> {
        self.submit(MetadataCommand::DeleteMetadata {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn list_children(&self, parent: &str) -> FsResult<Vec<Inode>> {
        Ok(self.node.state_machine().list_children(parent))
    }

    async fn get_link(&self, token: &str) -> FsResult<SingleUseLink> {
        self.node.state_machine().get_link(token)
    }

    async fn create_link(&self, link: &SingleUseLink) -> FsResult<()> {
        self.submit(MetadataCommand::CreateLink(link.clone()))
            .await
            .map(|_| ())
    }

    async fn update_link(
        &self,
        token: &str,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    ) -> FsResult<()> {
        self.submit(MetadataCommand::UpdateLink {
            token: token.to_string(),
            status,
            used_at,
            used_by_ip,
        })
        .await
        .map(|_| ())
    }

    async fn delete_link(&self, token: &str) -> FsResult<()> {
        self.submit(MetadataCommand::DeleteLink {
            token: token.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn cleanup_expired_links(&self, before: DateTime<Utc>) -> FsResult<u64> {
        Ok(self
            .submit(MetadataCommand::CleanupExpiredLinks { before })
            .await?
            .unwrap_or(0))
    }

    async fn cleanup_used_links(&self, older_than: DateTime<Utc>) -> FsResult<u64> {
        Ok(self
            .submit(MetadataCommand::CleanupUsedLinks { older_than })
            .await?
            .unwrap_or(0))
    }
}
