//! Metadata cache
//!
//! Path-keyed inode snapshots with a TTL, a capacity bound and prefix
//! invalidation. Readers share the map; every mutation takes the write lock.
//! A background sweep deletes expired entries at a fixed period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::core::{path::has_prefix, Inode};

/// Cache tuning knobs
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held at once
    pub capacity: usize,
    /// Time-to-live for each entry
    pub ttl: Duration,
    /// Background sweep period
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

struct Entry {
    inode: Inode,
    expires_at: Instant,
}

/// In-memory metadata cache with TTL and prefix invalidation.
pub struct MetadataCache {
    entries: RwLock<HashMap<String, Entry>>,
    config: CacheConfig,
}

impl MetadataCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Look up a path; absent or expired entries are misses.
    pub fn lookup(&self, path: &str) -> Option<Inode> {
        let entries = self.entries.read();
        let entry = entries.get(path)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.inode.clone())
    }

    /// Insert a snapshot. At capacity one entry is evicted first, preferring
    /// any expired entry over a live one.
    pub fn insert(&self, inode: Inode) {
        let mut entries = self.entries.write();
        if entries.len() >= self.config.capacity && !entries.contains_key(&inode.path) {
            let now = Instant::now();
            let victim = entries
                .iter()
                .find(|(_, e)| now >= e.expires_at)
                .or_else(|| entries.iter().next())
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(
            inode.path.clone(),
            Entry {
                inode,
                expires_at: Instant::now() + self.config.ttl,
            },
        );
    }

    /// Drop the entry for one exact path.
    pub fn invalidate(&self, path: &str) {
        self.entries.write().remove(path);
    }

    /// Drop every entry at or under `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .retain(|path, _| !has_prefix(path, prefix));
    }

    /// Remove expired entries under the write lock.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Spawn the periodic sweep task; stops when `shutdown` flips to true.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        let period = cache.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "cache sweep removed expired entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
