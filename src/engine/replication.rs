//! Secondary-backend replication.
//!
//! An after-apply hook on the engine: once a file lands on its primary
//! backend and its metadata commits, the content is re-read from the
//! primary and mirrored onto the configured replica backend. Runs before
//! cache invalidation and outside the metadata commit's critical section.

use crate::backends::OpContext;
use crate::core::{BackendKind, FsError, FsResult, Inode};

use super::Engine;

impl Engine {
    fn replica_kind(&self, primary: BackendKind) -> Option<BackendKind> {
        if !self.config.replication_enabled {
            return None;
        }
        let replica = self.config.replica_backend?;
        // Mirroring a backend onto itself is never useful.
        if replica == primary {
            return None;
        }
        Some(replica)
    }

    /// Mirror freshly written content to the replica backend. `update`
    /// first, falling back to `create` when the replica has no object yet.
    pub(super) async fn replicate_content(&self, inode: &Inode) -> FsResult<()> {
        let Some(replica_kind) = self.replica_kind(inode.backend) else {
            return Ok(());
        };

        let result = self.copy_to_replica(inode, replica_kind).await;
        self.settle_replica_result(inode, result)
    }

    async fn copy_to_replica(&self, inode: &Inode, replica_kind: BackendKind) -> FsResult<()> {
        let (primary, ctx) = self.select_backend(inode);
        let replica = self.backends.by_kind(replica_kind);

        let source = primary.open(&ctx, &inode.path).await?;
        let replica_ctx = OpContext::local();
        match replica.update(&replica_ctx, &inode.path, source).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                let source = primary.open(&ctx, &inode.path).await?;
                replica
                    .create(&replica_ctx, &inode.path, source)
                    .await
                    .map(|_| ())
                    .map_err(Into::into)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Mirror a delete to the replica backend.
    pub(super) async fn replicate_delete(&self, inode: &Inode) -> FsResult<()> {
        let Some(replica_kind) = self.replica_kind(inode.backend) else {
            return Ok(());
        };
        let replica = self.backends.by_kind(replica_kind);
        let result = match replica.delete(&OpContext::local(), &inode.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        };
        self.settle_replica_result(inode, result)
    }

    fn settle_replica_result(&self, inode: &Inode, result: FsResult<()>) -> FsResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.config.require_replica_success => Err(FsError::Internal(format!(
                "replica write for {} failed: {err}",
                inode.path
            ))),
            Err(err) => {
                tracing::warn!(
                    path = %inode.path,
                    error = %err,
                    "replica write failed, continuing without it"
                );
                Ok(())
            }
        }
    }
}
