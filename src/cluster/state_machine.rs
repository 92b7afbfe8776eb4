//! Deterministic state machine over the metadata maps.
//!
//! Every node applies committed commands in log order against the same
//! [`StateMaps`] the in-memory store uses, so replicated behavior and
//! single-node behavior cannot diverge. Reads run under the shared lock and
//! return deep copies.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::command::{CommandOutcome, MetadataCommand};
use crate::core::{FsResult, Inode, SingleUseLink};
use crate::metadata::StateMaps;

/// Serialized snapshot: the full maps plus the last applied index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_applied: u64,
    pub maps: StateMaps,
}

/// Replicated in-memory state.
pub struct StateMachine {
    state: RwLock<StateMaps>,
    last_applied: AtomicU64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StateMaps::default()),
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Apply one committed command. Already-applied indexes are skipped so
    /// replays after restart stay idempotent.
    pub fn apply(&self, index: u64, command: &MetadataCommand) -> CommandOutcome {
        if index <= self.last_applied() && index != 0 {
            return CommandOutcome::success(None);
        }

        let mut state = self.state.write();
        let result: FsResult<Option<u64>> = match command {
            MetadataCommand::CreateMetadata(inode) => state.create(inode).map(|_| None),
            MetadataCommand::UpdateMetadata(inode) => state.update(inode).map(|_| None),
            MetadataCommand::DeleteMetadata { path } => state.delete(path).map(|_| None),
            MetadataCommand::CreateLink(link) => state.create_link(link).map(|_| None),
            MetadataCommand::UpdateLink {
                token,
                status,
                used_at,
                used_by_ip,
            } => state
                .update_link(token, *status, *used_at, used_by_ip.clone())
                .map(|_| None),
            MetadataCommand::DeleteLink { token } => state.delete_link(token).map(|_| None),
            MetadataCommand::CleanupExpiredLinks { before } => {
                Ok(Some(state.cleanup_expired_links(*before)))
            }
            MetadataCommand::CleanupUsedLinks { older_than } => {
                Ok(Some(state.cleanup_used_links(*older_than)))
            }
        };
        drop(state);

        if index != 0 {
            self.last_applied.store(index, Ordering::Release);
        }
        CommandOutcome::from_result(result)
    }

    // Reads observe committed state under the shared lock.

    pub fn get(&self, path: &str) -> FsResult<Inode> {
        self.state.read().get(path)
    }

    pub fn list_children(&self, parent: &str) -> Vec<Inode> {
        self.state.read().list_children(parent)
    }

    pub fn get_link(&self, token: &str) -> FsResult<SingleUseLink> {
        self.state.read().get_link(token)
    }

    /// Full deep copy, for tests and snapshot assertions.
    pub fn maps(&self) -> StateMaps {
        self.state.read().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        let maps = self.state.read().clone();
        Snapshot {
            last_applied: self.last_applied(),
            maps,
        }
    }

    /// Replace state wholesale from a snapshot.
    pub fn restore(&self, snapshot: Snapshot) {
        *self.state.write() = snapshot.maps;
        self.last_applied
            .store(snapshot.last_applied, Ordering::Release);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
