//! Relational metadata store over sqlx.
//!
//! Works against sqlite and postgres through the Any driver; the schema is
//! applied on connect. Timestamps are stored as Unix milliseconds so both
//! engines share one column type. Path uniqueness is the primary key; child
//! queries filter on the indexed `parent_path` column.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::MetadataStore;
use crate::core::{BackendKind, FileKind, FsError, FsResult, Inode, LinkStatus, SingleUseLink};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS inodes (
        path TEXT PRIMARY KEY,
        id TEXT NOT NULL,
        parent_path TEXT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        size_bytes BIGINT NOT NULL,
        mode TEXT NOT NULL,
        uid BIGINT NOT NULL,
        gid BIGINT NOT NULL,
        atime BIGINT NOT NULL,
        mtime BIGINT NOT NULL,
        ctime BIGINT NOT NULL,
        backend TEXT NOT NULL,
        instance_id TEXT,
        symlink_target TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_inodes_parent ON inodes (parent_path)",
    "CREATE TABLE IF NOT EXISTS links (
        token TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        status TEXT NOT NULL,
        expires_at BIGINT NOT NULL,
        used_at BIGINT,
        used_by_ip TEXT,
        signature TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_links_status ON links (status, expires_at)",
];

/// sqlx-backed metadata store.
pub struct SqlMetadataStore {
    pool: AnyPool,
}

impl SqlMetadataStore {
    /// Connect to the configured DSN and apply the schema.
    pub async fn connect(database_url: &str) -> FsResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(if database_url.contains(":memory:") { 1 } else { 8 })
            .connect(database_url)
            .await
            .map_err(|e| FsError::Internal(format!("database connect: {e}")))?;

        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .map_err(|e| FsError::Internal(format!("schema apply: {e}")))?;
        }

        Ok(Self { pool })
    }

    fn map_error(err: sqlx::Error, context: &str) -> FsError {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                FsError::AlreadyExists(context.to_string())
            }
            sqlx::Error::RowNotFound => FsError::NotFound(context.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                FsError::Transient(format!("{context}: {err}"))
            }
            _ => FsError::Internal(format!("{context}: {err}")),
        }
    }
}

fn ts_to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ms_to_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn row_to_inode(row: &AnyRow) -> FsResult<Inode> {
    let kind_raw: String = row
        .try_get("kind")
        .map_err(|e| FsError::Internal(format!("bad inode row: {e}")))?;
    let kind = match kind_raw.as_str() {
        "file" => FileKind::File,
        "directory" => FileKind::Directory,
        other => return Err(FsError::Internal(format!("unknown inode kind {other:?}"))),
    };
    let backend_raw: String = row
        .try_get("backend")
        .map_err(|e| FsError::Internal(format!("bad inode row: {e}")))?;
    let backend = BackendKind::parse(&backend_raw)
        .ok_or_else(|| FsError::Internal(format!("unknown backend tag {backend_raw:?}")))?;

    let get_i64 = |col: &str| -> FsResult<i64> {
        row.try_get::<i64, _>(col)
            .map_err(|e| FsError::Internal(format!("bad inode row ({col}): {e}")))
    };
    let get_string = |col: &str| -> FsResult<String> {
        row.try_get::<String, _>(col)
            .map_err(|e| FsError::Internal(format!("bad inode row ({col}): {e}")))
    };
    let get_opt = |col: &str| -> FsResult<Option<String>> {
        row.try_get::<Option<String>, _>(col)
            .map_err(|e| FsError::Internal(format!("bad inode row ({col}): {e}")))
    };

    Ok(Inode {
        id: get_string("id")?,
        parent_path: get_opt("parent_path")?,
        name: get_string("name")?,
        path: get_string("path")?,
        kind,
        size_bytes: get_i64("size_bytes")? as u64,
        mode: get_string("mode")?,
        uid: get_i64("uid")? as u32,
        gid: get_i64("gid")? as u32,
        atime: ms_to_ts(get_i64("atime")?),
        mtime: ms_to_ts(get_i64("mtime")?),
        ctime: ms_to_ts(get_i64("ctime")?),
        backend,
        instance_id: get_opt("instance_id")?,
        symlink_target: get_opt("symlink_target")?,
        created_at: ms_to_ts(get_i64("created_at")?),
        updated_at: ms_to_ts(get_i64("updated_at")?),
    })
}

fn row_to_link(row: &AnyRow) -> FsResult<SingleUseLink> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?;
    let status = LinkStatus::parse(&status_raw)
        .ok_or_else(|| FsError::Internal(format!("unknown link status {status_raw:?}")))?;

    let used_at: Option<i64> = row
        .try_get("used_at")
        .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?;

    Ok(SingleUseLink {
        token: row
            .try_get("token")
            .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        path: row
            .try_get("path")
            .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        status,
        expires_at: ms_to_ts(
            row.try_get("expires_at")
                .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        ),
        used_at: used_at.map(ms_to_ts),
        used_by_ip: row
            .try_get("used_by_ip")
            .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        signature: row
            .try_get("signature")
            .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        created_at: ms_to_ts(
            row.try_get("created_at")
                .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        ),
        updated_at: ms_to_ts(
            row.try_get("updated_at")
                .map_err(|e| FsError::Internal(format!("bad link row: {e}")))?,
        ),
    })
}

#[async_trait]
impl MetadataStore for SqlMetadataStore {
    async fn get(&self, path: &str) -> FsResult<Inode> {
        let row = sqlx::query("SELECT * FROM inodes WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "inode get"))?;
        match row {
            Some(row) => row_to_inode(&row),
            None => Err(FsError::NotFound(format!("no entry at {path}"))),
        }
    }

    async fn create(&self, inode: &Inode) -> FsResult<()> {
        sqlx::query(
            "INSERT INTO inodes (path, id, parent_path, name, kind, size_bytes, mode, uid, gid,
                 atime, mtime, ctime, backend, instance_id, symlink_target, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(inode.path.as_str())
        .bind(inode.id.as_str())
        .bind(inode.parent_path.as_deref())
        .bind(inode.name.as_str())
        .bind(inode.kind.as_str())
        .bind(inode.size_bytes as i64)
        .bind(inode.mode.as_str())
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(ts_to_ms(inode.atime))
        .bind(ts_to_ms(inode.mtime))
        .bind(ts_to_ms(inode.ctime))
        .bind(inode.backend.as_str())
        .bind(inode.instance_id.as_deref())
        .bind(inode.symlink_target.as_deref())
        .bind(ts_to_ms(inode.created_at))
        .bind(ts_to_ms(inode.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_error(e, &format!("entry at {} already exists", inode.path)))?;
        Ok(())
    }

    async fn update(&self, inode: &Inode) -> FsResult<()> {
        let result = sqlx::query(
            "UPDATE inodes SET id = $1, parent_path = $2, name = $3, kind = $4, size_bytes = $5,
                 mode = $6, uid = $7, gid = $8, atime = $9, mtime = $10, ctime = $11,
                 backend = $12, instance_id = $13, symlink_target = $14, created_at = $15,
                 updated_at = $16
             WHERE path = $17",
        )
        .bind(inode.id.as_str())
        .bind(inode.parent_path.as_deref())
        .bind(inode.name.as_str())
        .bind(inode.kind.as_str())
        .bind(inode.size_bytes as i64)
        .bind(inode.mode.as_str())
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(ts_to_ms(inode.atime))
        .bind(ts_to_ms(inode.mtime))
        .bind(ts_to_ms(inode.ctime))
        .bind(inode.backend.as_str())
        .bind(inode.instance_id.as_deref())
        .bind(inode.symlink_target.as_deref())
        .bind(ts_to_ms(inode.created_at))
        .bind(ts_to_ms(inode.updated_at))
        .bind(inode.path.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_error(e, "inode update"))?;

        if result.rows_affected() == 0 {
            return Err(FsError::NotFound(format!("no entry at {}", inode.path)));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> FsResult<()> {
        let result = sqlx::query("DELETE FROM inodes WHERE path = $1")
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "inode delete"))?;
        if result.rows_affected() == 0 {
            return Err(FsError::NotFound(format!("no entry at {path}")));
        }
        Ok(())
    }

    async fn list_children(&self, parent: &str) -> FsResult<Vec<Inode>> {
        let rows = sqlx::query("SELECT * FROM inodes WHERE parent_path = $1 ORDER BY path")
            .bind(parent)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "list children"))?;
        rows.iter().map(row_to_inode).collect()
    }

    async fn get_link(&self, token: &str) -> FsResult<SingleUseLink> {
        let row = sqlx::query("SELECT * FROM links WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "link get"))?;
        match row {
            Some(row) => row_to_link(&row),
            None => Err(FsError::NotFound(format!("no link for token {token}"))),
        }
    }

    async fn create_link(&self, link: &SingleUseLink) -> FsResult<()> {
        sqlx::query(
            "INSERT INTO links (token, path, status, expires_at, used_at, used_by_ip, signature,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(link.token.as_str())
        .bind(link.path.as_str())
        .bind(link.status.as_str())
        .bind(ts_to_ms(link.expires_at))
        .bind(link.used_at.map(ts_to_ms))
        .bind(link.used_by_ip.as_deref())
        .bind(link.signature.as_str())
        .bind(ts_to_ms(link.created_at))
        .bind(ts_to_ms(link.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_error(e, "link token collision"))?;
        Ok(())
    }

    async fn update_link(
        &self,
        token: &str,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    ) -> FsResult<()> {
        // Conditional on the prior status so only one consumer wins.
        let result = sqlx::query(
            "UPDATE links SET status = $1, used_at = $2, used_by_ip = $3, updated_at = $4
             WHERE token = $5 AND status = 'active'",
        )
        .bind(status.as_str())
        .bind(used_at.map(ts_to_ms))
        .bind(used_by_ip.as_deref())
        .bind(ts_to_ms(Utc::now()))
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_error(e, "link update"))?;

        if result.rows_affected() == 0 {
            let current = self.get_link(token).await?;
            return Err(FsError::Gone(format!(
                "link is {}, not active",
                current.status.as_str()
            )));
        }
        Ok(())
    }

    async fn delete_link(&self, token: &str) -> FsResult<()> {
        let result = sqlx::query("DELETE FROM links WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "link delete"))?;
        if result.rows_affected() == 0 {
            return Err(FsError::NotFound(format!("no link for token {token}")));
        }
        Ok(())
    }

    async fn cleanup_expired_links(&self, before: DateTime<Utc>) -> FsResult<u64> {
        let result = sqlx::query("DELETE FROM links WHERE expires_at < $1")
            .bind(ts_to_ms(before))
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "link cleanup"))?;
        Ok(result.rows_affected())
    }

    async fn cleanup_used_links(&self, older_than: DateTime<Utc>) -> FsResult<u64> {
        let result = sqlx::query("DELETE FROM links WHERE status = 'used' AND used_at < $1")
            .bind(ts_to_ms(older_than))
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_error(e, "link cleanup"))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqlMetadataStore {
        SqlMetadataStore::connect("sqlite::memory:").await.unwrap()
    }

    fn file(path: &str) -> Inode {
        Inode::new_file(path, 7, BackendKind::Localfs)
    }

    #[tokio::test]
    async fn test_inode_crud() {
        let store = store().await;
        store.create(&file("/a")).await.unwrap();
        assert!(store.create(&file("/a")).await.unwrap_err().is_already_exists());

        let fetched = store.get("/a").await.unwrap();
        assert_eq!(fetched.size_bytes, 7);
        assert_eq!(fetched.parent_path.as_deref(), Some("/"));

        let mut updated = fetched.clone();
        updated.size_bytes = 42;
        store.update(&updated).await.unwrap();
        assert_eq!(store.get("/a").await.unwrap().size_bytes, 42);

        store.delete("/a").await.unwrap();
        assert!(store.get("/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_children_is_single_level() {
        let store = store().await;
        store
            .create(&Inode::new_directory("/d", BackendKind::Localfs))
            .await
            .unwrap();
        store.create(&file("/d/one")).await.unwrap();
        store
            .create(&Inode::new_directory("/d/sub", BackendKind::Localfs))
            .await
            .unwrap();
        store.create(&file("/d/sub/two")).await.unwrap();

        let children = store.list_children("/d").await.unwrap();
        let paths: Vec<&str> = children.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/d/one", "/d/sub"]);
    }

    #[tokio::test]
    async fn test_link_consume_once() {
        let store = store().await;
        let now = Utc::now();
        let link = SingleUseLink {
            token: "tok".to_string(),
            path: "/f".to_string(),
            status: LinkStatus::Active,
            expires_at: now + chrono::Duration::seconds(60),
            used_at: None,
            used_by_ip: None,
            signature: "sig".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.create_link(&link).await.unwrap();

        store
            .update_link("tok", LinkStatus::Used, Some(now), Some("9.9.9.9".into()))
            .await
            .unwrap();
        let err = store
            .update_link("tok", LinkStatus::Used, Some(now), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Gone(_)));

        let stored = store.get_link("tok").await.unwrap();
        assert_eq!(stored.status, LinkStatus::Used);
        assert_eq!(stored.used_by_ip.as_deref(), Some("9.9.9.9"));
    }

    #[tokio::test]
    async fn test_cleanup_counts() {
        let store = store().await;
        let now = Utc::now();
        for (token, offset) in [("old", -60), ("fresh", 600)] {
            let link = SingleUseLink {
                token: token.to_string(),
                path: "/f".to_string(),
                status: LinkStatus::Active,
                expires_at: now + chrono::Duration::seconds(offset),
                used_at: None,
                used_by_ip: None,
                signature: "sig".to_string(),
                created_at: now,
                updated_at: now,
            };
            store.create_link(&link).await.unwrap();
        }

        assert_eq!(store.cleanup_expired_links(now).await.unwrap(), 1);
        assert_eq!(store.cleanup_expired_links(now).await.unwrap(), 0);
    }
}
