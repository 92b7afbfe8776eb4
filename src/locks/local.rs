//! Process-local lock manager backed by a per-key owner table.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use super::LockManager;

/// Mutex-per-key map for single-instance deployments.
///
/// `acquire` polls within a bounded window; a contender still blocked when
/// the window closes gets a failure rather than waiting indefinitely.
pub struct LocalLockManager {
    held: DashMap<String, Uuid>,
    acquire_window: Duration,
    retry_interval: Duration,
}

impl LocalLockManager {
    pub fn new(acquire_window: Duration) -> Self {
        Self {
            held: DashMap::new(),
            acquire_window,
            retry_interval: Duration::from_millis(10),
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, key: &str) -> bool {
        let owner = Uuid::new_v4();
        let deadline = Instant::now() + self.acquire_window;
        loop {
            let mut taken = false;
            self.held.entry(key.to_string()).or_insert_with(|| {
                taken = true;
                owner
            });
            if taken {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::debug!(key, "lock acquisition window elapsed");
                return false;
            }
            sleep(self.retry_interval).await;
        }
    }

    async fn release(&self, key: &str) {
        self.held.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let manager = LocalLockManager::default();
        assert!(manager.acquire("a").await);
        assert!(manager.is_held("a"));
        manager.release("a").await;
        assert!(!manager.is_held("a"));
    }

    #[tokio::test]
    async fn test_contention_fails_within_window() {
        let manager = LocalLockManager::new(Duration::from_millis(50));
        assert!(manager.acquire("a").await);
        // Second contender exhausts the window and fails.
        assert!(!manager.acquire("a").await);
    }

    #[tokio::test]
    async fn test_waiter_succeeds_after_release() {
        let manager = std::sync::Arc::new(LocalLockManager::new(Duration::from_secs(2)));
        assert!(manager.acquire("a").await);

        let waiter = std::sync::Arc::clone(&manager);
        let handle = tokio::spawn(async move { waiter.acquire("a").await });

        sleep(Duration::from_millis(30)).await;
        manager.release("a").await;
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let manager = LocalLockManager::default();
        assert!(manager.acquire("a").await);
        assert!(manager.acquire("b").await);
    }
}
