//! Redis-backed distributed lock manager.
//!
//! Keys are taken with `SET NX PX` under a short lease and a unique owner
//! token; release runs a compare-and-delete script so only the owner can
//! free the key. A lost Redis connection surfaces as acquisition failure.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::LockManager;
use crate::core::{FsError, FsResult};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Distributed lock manager over a shared Redis instance.
pub struct RedisLockManager {
    conn: ConnectionManager,
    /// Tokens for keys this process currently owns
    owned: DashMap<String, String>,
    lease: Duration,
    acquire_window: Duration,
    retry_interval: Duration,
    key_prefix: String,
}

impl RedisLockManager {
    /// Connect to Redis and build the manager.
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        lease: Duration,
    ) -> FsResult<Self> {
        let url = match password {
            Some(pass) if !pass.is_empty() => format!("redis://:{pass}@{addr}"),
            _ => format!("redis://{addr}"),
        };
        let client = redis::Client::open(url)
            .map_err(|e| FsError::Internal(format!("redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FsError::Internal(format!("redis connect: {e}")))?;

        Ok(Self {
            conn,
            owned: DashMap::new(),
            lease,
            acquire_window: Duration::from_secs(5),
            retry_interval: Duration::from_millis(25),
            key_prefix: "callfs:lock:".to_string(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn try_set(&self, redis_key: &str, token: &str) -> FsResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(redis_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| FsError::Transient(format!("redis SET: {e}")))?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str) -> bool {
        let redis_key = self.redis_key(key);
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.acquire_window;

        loop {
            match self.try_set(&redis_key, &token).await {
                Ok(true) => {
                    self.owned.insert(key.to_string(), token);
                    return true;
                }
                Ok(false) => {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::debug!(key, "redis lock contended past the window");
                        return false;
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "redis lock acquisition failed");
                    return false;
                }
            }
        }
    }

    async fn release(&self, key: &str) {
        let Some((_, token)) = self.owned.remove(key) else {
            return;
        };
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let result: Result<i64, _> = script
            .key(self.redis_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = result {
            tracing::warn!(key, error = %err, "redis lock release failed");
        }
    }
}
