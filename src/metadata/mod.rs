//! Metadata store interface and non-replicated implementations
//!
//! The [`MetadataStore`] trait is the uniform contract for inode and link
//! records. Implementations:
//!
//! - `memory`: RW-locked maps; unit tests and the replicated state machine
//! - `sql`: relational store over sqlx (sqlite/postgres)
//! - `embedded`: sled-backed store
//!
//! The replicated variant lives in `crate::cluster`.

pub mod embedded;
pub mod memory;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{FsResult, Inode, LinkStatus, SingleUseLink};

pub use embedded::SledMetadataStore;
pub use memory::{MemoryMetadataStore, StateMaps};
pub use sql::SqlMetadataStore;

/// Uniform contract for inode and link records.
///
/// Updates are whole-record replacements scoped by path. `list_children`
/// returns strictly the entries whose parent path equals the argument.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, path: &str) -> FsResult<Inode>;
    async fn create(&self, inode: &Inode) -> FsResult<()>;
    async fn update(&self, inode: &Inode) -> FsResult<()>;
    async fn delete(&self, path: &str) -> FsResult<()>;
    async fn list_children(&self, parent: &str) -> FsResult<Vec<Inode>>;

    async fn get_link(&self, token: &str) -> FsResult<SingleUseLink>;
    async fn create_link(&self, link: &SingleUseLink) -> FsResult<()>;

    /// Transition a link's status and consumption fields. Only the
    /// `active → used` and `active → expired` transitions are permitted, so
    /// at most one consumer of a token ever observes success.
    async fn update_link(
        &self,
        token: &str,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    ) -> FsResult<()>;

    async fn delete_link(&self, token: &str) -> FsResult<()>;

    /// Remove every link expiring before `before`; returns the count.
    async fn cleanup_expired_links(&self, before: DateTime<Utc>) -> FsResult<u64>;

    /// Remove every used link consumed before `older_than`; returns the count.
    async fn cleanup_used_links(&self, older_than: DateTime<Utc>) -> FsResult<u64>;
}

/// Shared store handle
pub type SharedMetadataStore = Arc<dyn MetadataStore>;
