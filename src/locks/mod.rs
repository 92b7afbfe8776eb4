//! Lock manager
//!
//! Distributed mutex over opaque keys. One lock scopes one inode operation;
//! acquisition failure covers both contention and backend errors, so callers
//! treat `false` uniformly as a transient condition. Release is best effort
//! and always runs detached from the request so cancellation cannot leak a
//! held lock.

pub mod local;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::local::LocalLockManager;
pub use self::redis::RedisLockManager;

/// Distributed mutex contract
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the lock for `key`. Returns `false` on contention or on
    /// any backend error.
    async fn acquire(&self, key: &str) -> bool;

    /// Release the lock for `key`. Best effort; only the owner's release has
    /// any effect.
    async fn release(&self, key: &str);
}

/// Shared lock manager handle
pub type SharedLockManager = Arc<dyn LockManager>;

/// Release a lock on a fresh task so the caller's cancellation scope cannot
/// interrupt it.
pub fn release_detached(manager: SharedLockManager, key: String) {
    tokio::spawn(async move {
        manager.release(&key).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_detached_completes() {
        let manager: SharedLockManager = Arc::new(LocalLockManager::default());
        assert!(manager.acquire("k").await);
        release_detached(Arc::clone(&manager), "k".to_string());
        // The detached task runs on the same runtime; yield until it lands.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if manager.acquire("k").await {
                return;
            }
        }
        panic!("detached release never freed the lock");
    }
}
