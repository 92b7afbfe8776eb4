//! In-memory metadata maps.
//!
//! [`StateMaps`] carries the two mappings (path → inode, token → link) and
//! the deterministic mutation semantics every store variant shares. The
//! replicated state machine applies committed commands against the same
//! type, so memory-store behavior and cluster apply behavior cannot drift.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::MetadataStore;
use crate::core::{FsError, FsResult, Inode, LinkStatus, SingleUseLink};

/// The two metadata mappings with deterministic operation semantics.
///
/// BTreeMaps keep iteration (and therefore listings and snapshots) in a
/// stable order on every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMaps {
    pub inodes: BTreeMap<String, Inode>,
    pub links: BTreeMap<String, SingleUseLink>,
}

impl StateMaps {
    pub fn get(&self, path: &str) -> FsResult<Inode> {
        self.inodes
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("no entry at {path}")))
    }

    pub fn create(&mut self, inode: &Inode) -> FsResult<()> {
        if self.inodes.contains_key(&inode.path) {
            return Err(FsError::AlreadyExists(format!(
                "entry at {} already exists",
                inode.path
            )));
        }
        self.inodes.insert(inode.path.clone(), inode.clone());
        Ok(())
    }

    pub fn update(&mut self, inode: &Inode) -> FsResult<()> {
        if !self.inodes.contains_key(&inode.path) {
            return Err(FsError::NotFound(format!("no entry at {}", inode.path)));
        }
        self.inodes.insert(inode.path.clone(), inode.clone());
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> FsResult<()> {
        self.inodes
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(format!("no entry at {path}")))
    }

    /// Entries whose parent path equals `parent`, strict single level.
    pub fn list_children(&self, parent: &str) -> Vec<Inode> {
        self.inodes
            .values()
            .filter(|inode| inode.parent_path.as_deref() == Some(parent))
            .cloned()
            .collect()
    }

    pub fn get_link(&self, token: &str) -> FsResult<SingleUseLink> {
        self.links
            .get(token)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("no link for token {token}")))
    }

    pub fn create_link(&mut self, link: &SingleUseLink) -> FsResult<()> {
        if self.links.contains_key(&link.token) {
            return Err(FsError::AlreadyExists("link token collision".to_string()));
        }
        self.links.insert(link.token.clone(), link.clone());
        Ok(())
    }

    pub fn update_link(
        &mut self,
        token: &str,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    ) -> FsResult<()> {
        let link = self
            .links
            .get_mut(token)
            .ok_or_else(|| FsError::NotFound(format!("no link for token {token}")))?;
        if link.status != LinkStatus::Active {
            return Err(FsError::Gone(format!(
                "link is {}, not active",
                link.status.as_str()
            )));
        }
        link.status = status;
        link.used_at = used_at;
        link.used_by_ip = used_by_ip;
        // Derived from the command payload so replicated applies stay
        // deterministic across nodes.
        link.updated_at = used_at.unwrap_or(link.updated_at);
        Ok(())
    }

    pub fn delete_link(&mut self, token: &str) -> FsResult<()> {
        self.links
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(format!("no link for token {token}")))
    }

    pub fn cleanup_expired_links(&mut self, before: DateTime<Utc>) -> u64 {
        let len_before = self.links.len();
        self.links.retain(|_, link| link.expires_at >= before);
        (len_before - self.links.len()) as u64
    }

    pub fn cleanup_used_links(&mut self, older_than: DateTime<Utc>) -> u64 {
        let len_before = self.links.len();
        self.links.retain(|_, link| {
            !(link.status == LinkStatus::Used
                && link.used_at.map(|t| t < older_than).unwrap_or(false))
        });
        (len_before - self.links.len()) as u64
    }
}

/// RW-locked [`StateMaps`] exposed through the store trait.
pub struct MemoryMetadataStore {
    maps: RwLock<StateMaps>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(StateMaps::default()),
        }
    }

    /// Snapshot the maps; used by tests to compare node states.
    pub fn snapshot(&self) -> StateMaps {
        self.maps.read().clone()
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, path: &str) -> FsResult<Inode> {
        self.maps.read().get(path)
    }

    async fn create(&self, inode: &Inode) -> FsResult<()> {
        self.maps.write().create(inode)
    }

    async fn update(&self, inode: &Inode) -> FsResult<()> {
        self.maps.write().update(inode)
    }

    async fn delete(&self, path: &str) -> FsResult<()> {
        self.maps.write().delete(path)
    }

    async fn list_children(&self, parent: &str) -> FsResult<Vec<Inode>> {
        Ok(self.maps.read().list_children(parent))
    }

    async fn get_link(&self, token: &str) -> FsResult<SingleUseLink> {
        self.maps.read().get_link(token)
    }

    async fn create_link(&self, link: &SingleUseLink) -> FsResult<()> {
        self.maps.write().create_link(link)
    }

    async fn update_link(
        &self,
        token: &str,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    ) -> FsResult<()> {
        self.maps
            .write()
            .update_link(token, status, used_at, used_by_ip)
    }

    async fn delete_link(&self, token: &str) -> FsResult<()> {
        self.maps.write().delete_link(token)
    }

    async fn cleanup_expired_links(&self, before: DateTime<Utc>) -> FsResult<u64> {
        Ok(self.maps.write().cleanup_expired_links(before))
    }

    async fn cleanup_used_links(&self, older_than: DateTime<Utc>) -> FsResult<u64> {
        Ok(self.maps.write().cleanup_used_links(older_than))
    }
}
