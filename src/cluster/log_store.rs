//! Persistent raft log and stable state over sled.
//!
//! Three trees: `entries` (big-endian index → entry), `meta` (hard state),
//! `snapshots` (last-included index → snapshot blob). Snapshot retention is
//! bounded; compaction removes log entries a snapshot already covers.

use serde::{Deserialize, Serialize};

use super::command::LogCommand;
use crate::core::{FsError, FsResult};

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: LogCommand,
}

/// State that must survive crashes: term and vote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

/// Snapshot blob persisted alongside the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// bincode-encoded [`super::state_machine::Snapshot`]
    pub data: Vec<u8>,
}

const HARD_STATE_KEY: &[u8] = b"hard_state";

/// sled-backed raft storage.
pub struct RaftLogStore {
    #[allow(dead_code)]
    db: sled::Db,
    entries: sled::Tree,
    meta: sled::Tree,
    snapshots: sled::Tree,
}

impl RaftLogStore {
    pub fn open(dir: &std::path::Path) -> FsResult<Self> {
        let db = sled::open(dir)
            .map_err(|e| FsError::Internal(format!("raft store open {dir:?}: {e}")))?;
        let entries = db
            .open_tree("entries")
            .map_err(|e| FsError::Internal(format!("raft store: {e}")))?;
        let meta = db
            .open_tree("meta")
            .map_err(|e| FsError::Internal(format!("raft store: {e}")))?;
        let snapshots = db
            .open_tree("snapshots")
            .map_err(|e| FsError::Internal(format!("raft store: {e}")))?;
        Ok(Self {
            db,
            entries,
            meta,
            snapshots,
        })
    }

    fn err(e: impl std::fmt::Display) -> FsError {
        FsError::Internal(format!("raft store: {e}"))
    }

    fn key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn index_of(key: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[..8]);
        u64::from_be_bytes(buf)
    }

    // ------------------------------------------------------------------
    // Log entries
    // ------------------------------------------------------------------

    pub fn append(&self, entries: &[LogEntry]) -> FsResult<()> {
        let mut batch = sled::Batch::default();
        for entry in entries {
            let value = bincode::serialize(entry).map_err(Self::err)?;
            batch.insert(&Self::key(entry.index), value);
        }
        self.entries.apply_batch(batch).map_err(Self::err)?;
        self.entries.flush().map_err(Self::err)?;
        Ok(())
    }

    pub fn entry(&self, index: u64) -> FsResult<Option<LogEntry>> {
        match self.entries.get(Self::key(index)).map_err(Self::err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(Self::err)?)),
            None => Ok(None),
        }
    }

    /// Entries starting at `from`, capped at `max`.
    pub fn entries_from(&self, from: u64, max: usize) -> FsResult<Vec<LogEntry>> {
        let mut out = Vec::new();
        for item in self.entries.range(Self::key(from)..) {
            let (_, bytes) = item.map_err(Self::err)?;
            out.push(bincode::deserialize(&bytes).map_err(Self::err)?);
            if out.len() >= max {
                break;
            }
        }
        Ok(out)
    }

    pub fn last_index(&self) -> FsResult<u64> {
        match self.entries.last().map_err(Self::err)? {
            Some((key, _)) => Ok(Self::index_of(&key)),
            None => Ok(self.latest_snapshot()?.map(|s| s.last_included_index).unwrap_or(0)),
        }
    }

    pub fn first_index(&self) -> FsResult<u64> {
        match self.entries.first().map_err(Self::err)? {
            Some((key, _)) => Ok(Self::index_of(&key)),
            None => Ok(0),
        }
    }

    /// Term of the entry at `index`, consulting snapshot metadata for
    /// compacted prefixes. Index 0 has term 0.
    pub fn term_at(&self, index: u64) -> FsResult<u64> {
        if index == 0 {
            return Ok(0);
        }
        if let Some(entry) = self.entry(index)? {
            return Ok(entry.term);
        }
        if let Some(snapshot) = self.latest_snapshot()? {
            if snapshot.last_included_index == index {
                return Ok(snapshot.last_included_term);
            }
        }
        Err(FsError::Internal(format!(
            "no term recorded for log index {index}"
        )))
    }

    /// Remove every entry with index >= `from` (conflict truncation).
    pub fn truncate_from(&self, from: u64) -> FsResult<()> {
        let keys: Vec<Vec<u8>> = self
            .entries
            .range(Self::key(from)..)
            .map(|item| item.map(|(k, _)| k.to_vec()).map_err(Self::err))
            .collect::<FsResult<_>>()?;
        for key in keys {
            self.entries.remove(key).map_err(Self::err)?;
        }
        Ok(())
    }

    /// Remove every entry with index <= `through` (snapshot compaction).
    pub fn compact_through(&self, through: u64) -> FsResult<()> {
        let keys: Vec<Vec<u8>> = self
            .entries
            .range(..=Self::key(through))
            .map(|item| item.map(|(k, _)| k.to_vec()).map_err(Self::err))
            .collect::<FsResult<_>>()?;
        for key in keys {
            self.entries.remove(key).map_err(Self::err)?;
        }
        Ok(())
    }

    /// Entries currently held (excludes the snapshot-covered prefix).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // Hard state
    // ------------------------------------------------------------------

    pub fn hard_state(&self) -> FsResult<HardState> {
        match self.meta.get(HARD_STATE_KEY).map_err(Self::err)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(Self::err),
            None => Ok(HardState::default()),
        }
    }

    pub fn save_hard_state(&self, state: &HardState) -> FsResult<()> {
        let bytes = bincode::serialize(state).map_err(Self::err)?;
        self.meta.insert(HARD_STATE_KEY, bytes).map_err(Self::err)?;
        self.meta.flush().map_err(Self::err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Persist a snapshot, compact the covered log prefix and prune old
    /// snapshots down to `retain`.
    pub fn save_snapshot(&self, snapshot: &StoredSnapshot, retain: usize) -> FsResult<()> {
        let bytes = bincode::serialize(snapshot).map_err(Self::err)?;
        self.snapshots
            .insert(Self::key(snapshot.last_included_index), bytes)
            .map_err(Self::err)?;
        self.compact_through(snapshot.last_included_index)?;

        let count = self.snapshots.len();
        if count > retain {
            let excess = count - retain;
            let old_keys: Vec<Vec<u8>> = self
                .snapshots
                .iter()
                .take(excess)
                .map(|item| item.map(|(k, _)| k.to_vec()).map_err(Self::err))
                .collect::<FsResult<_>>()?;
            for key in old_keys {
                self.snapshots.remove(key).map_err(Self::err)?;
            }
        }
        self.snapshots.flush().map_err(Self::err)?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> FsResult<Option<StoredSnapshot>> {
        match self.snapshots.last().map_err(Self::err)? {
            Some((_, bytes)) => Ok(Some(bincode::deserialize(&bytes).map_err(Self::err)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (RaftLogStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RaftLogStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: LogCommand::Noop,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let (store, _dir) = store();
        store.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.entry(2).unwrap().unwrap().term, 1);
        assert_eq!(store.term_at(3).unwrap(), 2);

        let tail = store.entries_from(2, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 2);
    }

    #[test]
    fn test_truncate_from() {
        let (store, _dir) = store();
        store.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        store.truncate_from(2).unwrap();
        assert_eq!(store.last_index().unwrap(), 1);
        assert!(store.entry(2).unwrap().is_none());
    }

    #[test]
    fn test_hard_state_round_trip() {
        let (store, _dir) = store();
        assert_eq!(store.hard_state().unwrap().current_term, 0);
        store
            .save_hard_state(&HardState {
                current_term: 7,
                voted_for: Some("node-2".to_string()),
            })
            .unwrap();
        let state = store.hard_state().unwrap();
        assert_eq!(state.current_term, 7);
        assert_eq!(state.voted_for.as_deref(), Some("node-2"));
    }

    #[test]
    fn test_snapshot_compacts_and_prunes() {
        let (store, _dir) = store();
        store
            .append(&(1..=10).map(|i| entry(1, i)).collect::<Vec<_>>())
            .unwrap();

        for cut in [4u64, 6, 8] {
            store
                .save_snapshot(
                    &StoredSnapshot {
                        last_included_index: cut,
                        last_included_term: 1,
                        data: vec![1, 2, 3],
                    },
                    2,
                )
                .unwrap();
        }

        // Log holds only the suffix past the newest snapshot.
        assert_eq!(store.first_index().unwrap(), 9);
        // Retention keeps the two newest snapshots.
        assert_eq!(store.snapshots.len(), 2);
        let latest = store.latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.last_included_index, 8);
        // Term of the compacted boundary comes from snapshot metadata.
        assert_eq!(store.term_at(8).unwrap(), 1);
    }

    #[test]
    fn test_last_index_falls_back_to_snapshot() {
        let (store, _dir) = store();
        store.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        store
            .save_snapshot(
                &StoredSnapshot {
                    last_included_index: 2,
                    last_included_term: 1,
                    data: vec![],
                },
                3,
            )
            .unwrap();
        assert!(store.is_empty());
        assert_eq!(store.last_index().unwrap(), 2);
    }
}
