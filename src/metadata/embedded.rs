//! Embedded metadata store over sled.
//!
//! Two trees: `inodes` keyed by path and `links` keyed by token, both with
//! bincode values. Path-ordered keys let child listings scan a prefix range
//! instead of the whole tree. Link consumption uses sled's compare-and-swap
//! so one consumer wins even without the engine's path lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::IVec;

use super::MetadataStore;
use crate::core::{FsError, FsResult, Inode, LinkStatus, SingleUseLink};

/// sled-backed metadata store.
pub struct SledMetadataStore {
    inodes: sled::Tree,
    links: sled::Tree,
    #[allow(dead_code)]
    db: sled::Db,
}

impl SledMetadataStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &std::path::Path) -> FsResult<Self> {
        let db = sled::open(dir)
            .map_err(|e| FsError::Internal(format!("sled open {dir:?}: {e}")))?;
        let inodes = db
            .open_tree("inodes")
            .map_err(|e| FsError::Internal(format!("sled tree: {e}")))?;
        let links = db
            .open_tree("links")
            .map_err(|e| FsError::Internal(format!("sled tree: {e}")))?;
        Ok(Self { inodes, links, db })
    }

    fn encode<T: serde::Serialize>(value: &T) -> FsResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| FsError::Internal(format!("encode: {e}")))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &IVec) -> FsResult<T> {
        bincode::deserialize(bytes).map_err(|e| FsError::Internal(format!("decode: {e}")))
    }

    fn sled_err(e: sled::Error) -> FsError {
        FsError::Internal(format!("sled: {e}"))
    }
}

#[async_trait]
impl MetadataStore for SledMetadataStore {
    async fn get(&self, path: &str) -> FsResult<Inode> {
        match self.inodes.get(path.as_bytes()).map_err(Self::sled_err)? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(FsError::NotFound(format!("no entry at {path}"))),
        }
    }

    async fn create(&self, inode: &Inode) -> FsResult<()> {
        let encoded = Self::encode(inode)?;
        let prior = self
            .inodes
            .compare_and_swap(
                inode.path.as_bytes(),
                None::<IVec>,
                Some(encoded),
            )
            .map_err(Self::sled_err)?;
        if prior.is_err() {
            return Err(FsError::AlreadyExists(format!(
                "entry at {} already exists",
                inode.path
            )));
        }
        Ok(())
    }

    async fn update(&self, inode: &Inode) -> FsResult<()> {
        if self
            .inodes
            .get(inode.path.as_bytes())
            .map_err(Self::sled_err)?
            .is_none()
        {
            return Err(FsError::NotFound(format!("no entry at {}", inode.path)));
        }
        self.inodes
            .insert(inode.path.as_bytes(), Self::encode(inode)?)
            .map_err(Self::sled_err)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> FsResult<()> {
        match self.inodes.remove(path.as_bytes()).map_err(Self::sled_err)? {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(format!("no entry at {path}"))),
        }
    }

    async fn list_children(&self, parent: &str) -> FsResult<Vec<Inode>> {
        let prefix = if parent == "/" {
            "/".to_string()
        } else {
            format!("{parent}/")
        };

        let mut children = Vec::new();
        for item in self.inodes.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item.map_err(Self::sled_err)?;
            let inode: Inode = Self::decode(&bytes)?;
            if inode.parent_path.as_deref() == Some(parent) {
                children.push(inode);
            }
        }
        Ok(children)
    }

    async fn get_link(&self, token: &str) -> FsResult<SingleUseLink> {
        match self.links.get(token.as_bytes()).map_err(Self::sled_err)? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(FsError::NotFound(format!("no link for token {token}"))),
        }
    }

    async fn create_link(&self, link: &SingleUseLink) -> FsResult<()> {
        let encoded = Self::encode(link)?;
        let prior = self
            .links
            .compare_and_swap(link.token.as_bytes(), None::<IVec>, Some(encoded))
            .map_err(Self::sled_err)?;
        if prior.is_err() {
            return Err(FsError::AlreadyExists("link token collision".to_string()));
        }
        Ok(())
    }

    async fn update_link(
        &self,
        token: &str,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    ) -> FsResult<()> {
        loop {
            let current_bytes = self
                .links
                .get(token.as_bytes())
                .map_err(Self::sled_err)?
                .ok_or_else(|| FsError::NotFound(format!("no link for token {token}")))?;
            let mut link: SingleUseLink = Self::decode(&current_bytes)?;
            if link.status != LinkStatus::Active {
                return Err(FsError::Gone(format!(
                    "link is {}, not active",
                    link.status.as_str()
                )));
            }
            link.status = status;
            link.used_at = used_at;
            link.used_by_ip = used_by_ip.clone();
            link.updated_at = Utc::now();

            let swapped = self
                .links
                .compare_and_swap(
                    token.as_bytes(),
                    Some(current_bytes),
                    Some(Self::encode(&link)?),
                )
                .map_err(Self::sled_err)?;
            if swapped.is_ok() {
                return Ok(());
            }
            // Lost a race; re-read and re-check the status.
        }
    }

    async fn delete_link(&self, token: &str) -> FsResult<()> {
        match self.links.remove(token.as_bytes()).map_err(Self::sled_err)? {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(format!("no link for token {token}"))),
        }
    }

    async fn cleanup_expired_links(&self, before: DateTime<Utc>) -> FsResult<u64> {
        let mut removed = 0;
        for item in self.links.iter() {
            let (key, bytes) = item.map_err(Self::sled_err)?;
            let link: SingleUseLink = Self::decode(&bytes)?;
            if link.expires_at < before {
                self.links.remove(key).map_err(Self::sled_err)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn cleanup_used_links(&self, older_than: DateTime<Utc>) -> FsResult<u64> {
        let mut removed = 0;
        for item in self.links.iter() {
            let (key, bytes) = item.map_err(Self::sled_err)?;
            let link: SingleUseLink = Self::decode(&bytes)?;
            if link.status == LinkStatus::Used
                && link.used_at.map(|t| t < older_than).unwrap_or(false)
            {
                self.links.remove(key).map_err(Self::sled_err)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendKind;

    fn store() -> (SledMetadataStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledMetadataStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_inode_round_trip() {
        let (store, _dir) = store();
        let inode = Inode::new_file("/a/b", 3, BackendKind::Localfs);
        store.create(&inode).await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap(), inode);
        assert!(store.create(&inode).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_list_children_filters_depth() {
        let (store, _dir) = store();
        store
            .create(&Inode::new_directory("/d", BackendKind::Localfs))
            .await
            .unwrap();
        store
            .create(&Inode::new_file("/d/a", 1, BackendKind::Localfs))
            .await
            .unwrap();
        store
            .create(&Inode::new_file("/d/a2", 1, BackendKind::Localfs))
            .await
            .unwrap();
        store
            .create(&Inode::new_directory("/d/sub", BackendKind::Localfs))
            .await
            .unwrap();
        store
            .create(&Inode::new_file("/d/sub/deep", 1, BackendKind::Localfs))
            .await
            .unwrap();
        // Sibling that shares the string prefix but not the directory.
        store
            .create(&Inode::new_file("/dx", 1, BackendKind::Localfs))
            .await
            .unwrap();

        let children = store.list_children("/d").await.unwrap();
        let paths: Vec<&str> = children.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/d/a", "/d/a2", "/d/sub"]);
    }

    #[tokio::test]
    async fn test_link_cas_transition() {
        let (store, _dir) = store();
        let now = Utc::now();
        let link = SingleUseLink {
            token: "tok".to_string(),
            path: "/f".to_string(),
            status: LinkStatus::Active,
            expires_at: now + chrono::Duration::seconds(30),
            used_at: None,
            used_by_ip: None,
            signature: "sig".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.create_link(&link).await.unwrap();
        store
            .update_link("tok", LinkStatus::Used, Some(now), Some("1.1.1.1".into()))
            .await
            .unwrap();
        assert!(matches!(
            store
                .update_link("tok", LinkStatus::Used, Some(now), None)
                .await
                .unwrap_err(),
            FsError::Gone(_)
        ));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledMetadataStore::open(dir.path()).unwrap();
            store
                .create(&Inode::new_file("/persist", 9, BackendKind::Localfs))
                .await
                .unwrap();
            store.inodes.flush().unwrap();
        }
        let store = SledMetadataStore::open(dir.path()).unwrap();
        assert_eq!(store.get("/persist").await.unwrap().size_bytes, 9);
    }
}
