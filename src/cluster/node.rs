//! Raft consensus node.
//!
//! Strict-leader replication for the metadata log: leader election with
//! randomized timeouts, append-entries replication with per-peer progress,
//! quorum commit, deterministic apply into the state machine, snapshot
//! installation for lagging peers, and membership change through the log
//! itself. Writes block until the entry commits and applies, or until the
//! configured apply timeout elapses.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::time::Instant;

use super::command::{CommandOutcome, LogCommand, MetadataCommand};
use super::log_store::{HardState, LogEntry, RaftLogStore, StoredSnapshot};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    JoinRequest, JoinResponse, RaftClient, VoteRequest, VoteResponse,
};
use super::state_machine::StateMachine;
use crate::config::ReplicatedLogConfig;
use crate::core::{FsError, FsResult};

/// Raft role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Addressing for one voter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub raft_addr: String,
    pub api_endpoint: String,
}

/// Voting configuration, mutated only through committed log entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: BTreeMap<String, PeerInfo>,
}

impl Membership {
    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Deterministic join semantics: a node re-joining under a new address
    /// replaces its old record, and an address re-used by a new node evicts
    /// the previous occupant.
    fn add_voter(&mut self, node_id: &str, raft_addr: &str, api_endpoint: &str) {
        self.voters
            .retain(|id, info| !(info.raft_addr == raft_addr && id != node_id));
        self.voters.insert(
            node_id.to_string(),
            PeerInfo {
                raft_addr: raft_addr.to_string(),
                api_endpoint: api_endpoint.to_string(),
            },
        );
    }

    fn remove_voter(&mut self, node_id: &str) {
        self.voters.remove(node_id);
    }
}

/// Snapshot payload: metadata maps plus the voting configuration.
#[derive(Debug, Serialize, Deserialize)]
struct FullSnapshot {
    state: super::state_machine::Snapshot,
    membership: Membership,
}

/// Per-peer replication progress, leader only.
#[derive(Debug, Default)]
struct LeaderVolatile {
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
}

/// Raft tuning derived from the replicated-log configuration.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub node_id: String,
    pub raft_addr: String,
    pub api_endpoint: String,
    pub bootstrap: bool,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub apply_timeout: Duration,
    pub snapshot_threshold: u64,
    pub snapshot_interval: Duration,
    pub retain_snapshot_count: usize,
    pub max_append_entries: usize,
    /// Static peer seed: node_id → addressing
    pub seed_peers: BTreeMap<String, PeerInfo>,
}

impl RaftOptions {
    pub fn from_config(
        config: &ReplicatedLogConfig,
        raft_addr: String,
        api_endpoint: String,
    ) -> Self {
        let mut seed_peers = BTreeMap::new();
        for (node_id, addr) in &config.peers {
            seed_peers.insert(
                node_id.clone(),
                PeerInfo {
                    raft_addr: addr.clone(),
                    api_endpoint: config
                        .api_peer_endpoints
                        .get(node_id)
                        .cloned()
                        .unwrap_or_else(|| addr.clone()),
                },
            );
        }
        Self {
            node_id: config.node_id.clone(),
            raft_addr,
            api_endpoint,
            bootstrap: config.bootstrap,
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(450),
            election_timeout_max: Duration::from_millis(900),
            apply_timeout: config.apply_timeout(),
            snapshot_threshold: config.snapshot_threshold,
            snapshot_interval: Duration::from_secs(config.snapshot_interval_secs),
            retain_snapshot_count: config.retain_snapshot_count,
            max_append_entries: 64,
            seed_peers,
        }
    }
}

/// One raft consensus participant.
pub struct RaftNode {
    opts: RaftOptions,
    store: Arc<RaftLogStore>,
    sm: Arc<StateMachine>,
    client: Arc<RaftClient>,

    role: RwLock<Role>,
    current_term: RwLock<u64>,
    voted_for: RwLock<Option<String>>,
    leader_id: RwLock<Option<String>>,
    membership: RwLock<Membership>,
    commit_index: RwLock<u64>,
    applied_index: RwLock<u64>,
    leader_state: RwLock<Option<LeaderVolatile>>,
    last_heartbeat: RwLock<Instant>,
    last_snapshot: RwLock<Instant>,
    /// Serializes log mutation (append, truncate)
    log_guard: Mutex<()>,
    /// Serializes apply so every waiter sees its entry's real outcome
    apply_guard: Mutex<()>,
    /// Commit waiters keyed by log index
    waiters: Mutex<HashMap<u64, oneshot::Sender<CommandOutcome>>>,
}

impl RaftNode {
    /// Rehydrate from the persistent store: latest snapshot first, then the
    /// replayed log suffix, with membership seeded from configuration.
    pub fn new(
        opts: RaftOptions,
        store: Arc<RaftLogStore>,
        sm: Arc<StateMachine>,
        client: Arc<RaftClient>,
    ) -> FsResult<Arc<Self>> {
        let hard = store.hard_state()?;

        let mut membership = Membership::default();
        membership.add_voter(&opts.node_id, &opts.raft_addr, &opts.api_endpoint);
        for (node_id, info) in &opts.seed_peers {
            membership.add_voter(node_id, &info.raft_addr, &info.api_endpoint);
        }

        let mut restored_index = 0u64;
        if let Some(stored) = store.latest_snapshot()? {
            let full: FullSnapshot = bincode::deserialize(&stored.data)
                .map_err(|e| FsError::Internal(format!("snapshot decode: {e}")))?;
            sm.restore(full.state);
            membership = full.membership;
            restored_index = stored.last_included_index;
        }

        let last = store.last_index()?;
        if last > restored_index {
            for entry in store.entries_from(restored_index + 1, usize::MAX)? {
                match &entry.command {
                    LogCommand::Noop => {}
                    LogCommand::Metadata(cmd) => {
                        sm.apply(entry.index, cmd);
                    }
                    LogCommand::AddVoter {
                        node_id,
                        raft_addr,
                        api_endpoint,
                    } => membership.add_voter(node_id, raft_addr, api_endpoint),
                    LogCommand::RemoveVoter { node_id } => membership.remove_voter(node_id),
                }
            }
        }
        let start_index = last.max(restored_index);

        Ok(Arc::new(Self {
            opts,
            store,
            sm,
            client,
            role: RwLock::new(Role::Follower),
            current_term: RwLock::new(hard.current_term),
            voted_for: RwLock::new(hard.voted_for),
            leader_id: RwLock::new(None),
            membership: RwLock::new(membership),
            commit_index: RwLock::new(start_index),
            applied_index: RwLock::new(start_index),
            leader_state: RwLock::new(None),
            last_heartbeat: RwLock::new(Instant::now()),
            last_snapshot: RwLock::new(Instant::now()),
            log_guard: Mutex::new(()),
            apply_guard: Mutex::new(()),
            waiters: Mutex::new(HashMap::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.opts.node_id
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.sm
    }

    pub fn apply_timeout(&self) -> Duration {
        self.opts.apply_timeout
    }

    pub async fn is_leader(&self) -> bool {
        *self.role.read().await == Role::Leader
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.leader_id.read().await.clone()
    }

    /// API endpoint of the current leader, for forwarding.
    pub async fn leader_api_endpoint(&self) -> Option<String> {
        let leader = self.leader_id.read().await.clone()?;
        self.membership
            .read()
            .await
            .voters
            .get(&leader)
            .map(|info| info.api_endpoint.clone())
    }

    pub async fn membership_snapshot(&self) -> Membership {
        self.membership.read().await.clone()
    }

    /// Spawn the background loops. A bootstrap node alone in its
    /// configuration elects itself immediately.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let node = Arc::clone(&self);
        let stop = shutdown.clone();
        tokio::spawn(async move { node.run_election_timer(stop).await });

        let node = Arc::clone(&self);
        let stop = shutdown.clone();
        tokio::spawn(async move { node.run_heartbeat(stop).await });

        let node = Arc::clone(&self);
        tokio::spawn(async move { node.run_snapshotter(shutdown).await });

        if self.opts.bootstrap {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if node.membership.read().await.voters.len() == 1 {
                    node.start_election().await;
                }
            });
        }
        tracing::info!(node_id = %self.opts.node_id, "raft node started");
    }

    async fn run_election_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let timeout = self.random_election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if *self.role.read().await == Role::Leader {
                continue;
            }
            if self.last_heartbeat.read().await.elapsed() >= timeout {
                tracing::debug!(node_id = %self.opts.node_id, "election timeout");
                self.start_election().await;
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.opts.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if self.is_leader().await {
                self.replicate_all().await;
            }
        }
    }

    async fn run_snapshotter(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if let Err(err) = self.maybe_take_snapshot().await {
                tracing::warn!(error = %err, "snapshot attempt failed");
            }
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.opts.election_timeout_min.as_millis() as u64;
        let max = self.opts.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn persist_hard_state(&self) -> FsResult<()> {
        let state = HardState {
            current_term: *self.current_term.read().await,
            voted_for: self.voted_for.read().await.clone(),
        };
        self.store.save_hard_state(&state)
    }

    async fn step_down(&self, term: u64) {
        *self.current_term.write().await = term;
        *self.voted_for.write().await = None;
        *self.role.write().await = Role::Follower;
        *self.leader_state.write().await = None;
        if let Err(err) = self.persist_hard_state().await {
            tracing::error!(error = %err, "failed to persist term");
        }
    }

    // ------------------------------------------------------------------
    // Election
    // ------------------------------------------------------------------

    async fn start_election(&self) {
        *self.role.write().await = Role::Candidate;

        let term = {
            let mut current = self.current_term.write().await;
            *current += 1;
            *current
        };
        *self.voted_for.write().await = Some(self.opts.node_id.clone());
        if let Err(err) = self.persist_hard_state().await {
            tracing::error!(error = %err, "failed to persist vote");
            return;
        }

        let (last_log_index, last_log_term) = match self.last_log_position() {
            Ok(position) => position,
            Err(err) => {
                tracing::error!(error = %err, "cannot read log position");
                return;
            }
        };

        let membership = self.membership.read().await.clone();
        let quorum = membership.quorum();
        tracing::info!(node_id = %self.opts.node_id, term, "starting election");

        let request = VoteRequest {
            term,
            candidate_id: self.opts.node_id.clone(),
            last_log_index,
            last_log_term,
        };

        let peers: Vec<(String, PeerInfo)> = membership
            .voters
            .iter()
            .filter(|(id, _)| id.as_str() != self.opts.node_id)
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();

        let results = join_all(peers.iter().map(|(peer_id, info)| {
            let request = request.clone();
            let client = Arc::clone(&self.client);
            let addr = info.raft_addr.clone();
            let peer_id = peer_id.clone();
            async move { (peer_id, client.request_vote(&addr, &request).await) }
        }))
        .await;

        let mut votes = 1usize; // self
        for (peer_id, result) in results {
            match result {
                Ok(VoteResponse {
                    term: peer_term, ..
                }) if peer_term > term => {
                    self.step_down(peer_term).await;
                    return;
                }
                Ok(VoteResponse {
                    vote_granted: true, ..
                }) => votes += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(peer = %peer_id, error = %err, "vote request failed");
                }
            }
        }

        if *self.current_term.read().await != term || *self.role.read().await != Role::Candidate {
            return;
        }

        if votes >= quorum {
            self.become_leader(term).await;
        } else {
            *self.role.write().await = Role::Follower;
        }
    }

    async fn become_leader(&self, term: u64) {
        tracing::info!(node_id = %self.opts.node_id, term, "became leader");
        *self.role.write().await = Role::Leader;
        *self.leader_id.write().await = Some(self.opts.node_id.clone());

        let last = self.store.last_index().unwrap_or(0);
        let membership = self.membership.read().await.clone();
        let mut volatile = LeaderVolatile::default();
        for peer_id in membership.voters.keys() {
            if peer_id != &self.opts.node_id {
                volatile.next_index.insert(peer_id.clone(), last + 1);
                volatile.match_index.insert(peer_id.clone(), 0);
            }
        }
        *self.leader_state.write().await = Some(volatile);

        // Committing a noop pins the new term and flushes prior entries.
        if let Err(err) = self.append_entry(LogCommand::Noop, None).await {
            tracing::error!(error = %err, "failed to append term-start noop");
        }
        self.replicate_all().await;
    }

    fn last_log_position(&self) -> FsResult<(u64, u64)> {
        let last = self.store.last_index()?;
        let term = if last == 0 {
            0
        } else {
            self.store.term_at(last)?
        };
        Ok((last, term))
    }

    // ------------------------------------------------------------------
    // Log append and replication
    // ------------------------------------------------------------------

    /// Append one entry as leader; when a waiter is supplied it is
    /// registered before the entry becomes visible to commit, so the apply
    /// outcome cannot race past it.
    async fn append_entry(
        &self,
        command: LogCommand,
        waiter: Option<oneshot::Sender<CommandOutcome>>,
    ) -> FsResult<u64> {
        let guard = self.log_guard.lock().await;
        let term = *self.current_term.read().await;
        let index = self.store.last_index()? + 1;
        if let Some(tx) = waiter {
            self.waiters.lock().await.insert(index, tx);
        }
        let appended = self.store.append(&[LogEntry {
            term,
            index,
            command,
        }]);
        drop(guard);
        if let Err(err) = appended {
            self.waiters.lock().await.remove(&index);
            return Err(err);
        }
        Ok(index)
    }

    async fn replicate_all(&self) {
        let membership = self.membership.read().await.clone();
        join_all(
            membership
                .voters
                .iter()
                .filter(|(id, _)| id.as_str() != self.opts.node_id)
                .map(|(peer_id, info)| self.replicate_to_peer(peer_id.clone(), info.clone())),
        )
        .await;
        // A single-member cluster commits on its own log alone.
        self.try_advance_commit().await;
    }

    async fn replicate_to_peer(&self, peer_id: String, info: PeerInfo) {
        if !self.is_leader().await {
            return;
        }
        let term = *self.current_term.read().await;

        let next_index = {
            let state = self.leader_state.read().await;
            let Some(state) = state.as_ref() else { return };
            state.next_index.get(&peer_id).copied().unwrap_or(1)
        };

        let first = self.store.first_index().unwrap_or(0);
        // The peer needs entries the log no longer holds: ship a snapshot.
        if first > 0 && next_index < first {
            self.send_snapshot(&peer_id, &info, term).await;
            return;
        }

        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = match self.store.term_at(prev_log_index) {
            Ok(t) => t,
            Err(_) => {
                self.send_snapshot(&peer_id, &info, term).await;
                return;
            }
        };
        let entries = match self
            .store
            .entries_from(next_index, self.opts.max_append_entries)
        {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "cannot read log for replication");
                return;
            }
        };
        let sent_last = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

        let request = AppendEntriesRequest {
            term,
            leader_id: self.opts.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: *self.commit_index.read().await,
        };

        match self.client.append_entries(&info.raft_addr, &request).await {
            Ok(AppendEntriesResponse {
                term: peer_term, ..
            }) if peer_term > term => {
                self.step_down(peer_term).await;
            }
            Ok(AppendEntriesResponse { success: true, .. }) => {
                {
                    let mut state = self.leader_state.write().await;
                    if let Some(state) = state.as_mut() {
                        state.match_index.insert(peer_id.clone(), sent_last);
                        state.next_index.insert(peer_id, sent_last + 1);
                    }
                }
                self.try_advance_commit().await;
            }
            Ok(AppendEntriesResponse { success: false, .. }) => {
                let mut state = self.leader_state.write().await;
                if let Some(state) = state.as_mut() {
                    let next = state.next_index.entry(peer_id).or_insert(1);
                    *next = next.saturating_sub(1).max(1);
                }
            }
            Err(err) => {
                tracing::debug!(peer = %peer_id, error = %err, "append entries failed");
            }
        }
    }

    async fn send_snapshot(&self, peer_id: &str, info: &PeerInfo, term: u64) {
        let snapshot = match self.store.latest_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            _ => return,
        };
        let boundary = snapshot.last_included_index;
        let request = InstallSnapshotRequest {
            term,
            leader_id: self.opts.node_id.clone(),
            snapshot,
        };
        match self.client.install_snapshot(&info.raft_addr, &request).await {
            Ok(InstallSnapshotResponse { term: peer_term }) if peer_term > term => {
                self.step_down(peer_term).await;
            }
            Ok(_) => {
                let mut state = self.leader_state.write().await;
                if let Some(state) = state.as_mut() {
                    state.match_index.insert(peer_id.to_string(), boundary);
                    state.next_index.insert(peer_id.to_string(), boundary + 1);
                }
            }
            Err(err) => {
                tracing::debug!(peer = %peer_id, error = %err, "snapshot install failed");
            }
        }
    }

    /// Advance the commit index to the quorum-replicated point and apply.
    async fn try_advance_commit(&self) {
        if !self.is_leader().await {
            return;
        }
        let term = *self.current_term.read().await;
        let Ok(last) = self.store.last_index() else {
            return;
        };

        let membership = self.membership.read().await.clone();
        let quorum = membership.quorum();

        let mut indexes: Vec<u64> = vec![last];
        {
            let state = self.leader_state.read().await;
            if let Some(state) = state.as_ref() {
                for peer_id in membership.voters.keys() {
                    if peer_id == &self.opts.node_id {
                        continue;
                    }
                    indexes.push(state.match_index.get(peer_id).copied().unwrap_or(0));
                }
            }
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        if indexes.len() < quorum {
            return;
        }
        let candidate = indexes[quorum - 1];

        if candidate <= *self.commit_index.read().await {
            return;
        }
        // Only entries of the current term commit by counting.
        match self.store.term_at(candidate) {
            Ok(t) if t == term => {}
            _ => return,
        }

        *self.commit_index.write().await = candidate;
        self.apply_committed().await;
    }

    /// Apply every committed-but-unapplied entry, resolving waiters.
    async fn apply_committed(&self) {
        let _guard = self.apply_guard.lock().await;
        loop {
            let next = {
                let applied = self.applied_index.read().await;
                let commit = self.commit_index.read().await;
                if *applied >= *commit {
                    return;
                }
                *applied + 1
            };

            let entry = match self.store.entry(next) {
                Ok(Some(entry)) => entry,
                _ => return,
            };

            let outcome = match &entry.command {
                LogCommand::Noop => CommandOutcome::success(None),
                LogCommand::Metadata(cmd) => self.sm.apply(entry.index, cmd),
                LogCommand::AddVoter {
                    node_id,
                    raft_addr,
                    api_endpoint,
                } => {
                    self.membership
                        .write()
                        .await
                        .add_voter(node_id, raft_addr, api_endpoint);
                    if *self.role.read().await == Role::Leader {
                        let mut state = self.leader_state.write().await;
                        if let Some(state) = state.as_mut() {
                            state
                                .next_index
                                .entry(node_id.clone())
                                .or_insert(entry.index);
                            state.match_index.entry(node_id.clone()).or_insert(0);
                        }
                    }
                    CommandOutcome::success(None)
                }
                LogCommand::RemoveVoter { node_id } => {
                    self.membership.write().await.remove_voter(node_id);
                    CommandOutcome::success(None)
                }
            };

            *self.applied_index.write().await = entry.index;

            if let Some(waiter) = self.waiters.lock().await.remove(&entry.index) {
                let _ = waiter.send(outcome);
            }
        }
    }

    // ------------------------------------------------------------------
    // Client-facing writes
    // ------------------------------------------------------------------

    /// Append a command as leader and wait for commit + apply.
    pub async fn propose_log(&self, command: LogCommand) -> FsResult<CommandOutcome> {
        if !self.is_leader().await {
            return Err(FsError::Transient("not the leader".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let index = self.append_entry(command, Some(tx)).await?;

        // Drive replication while waiting on the apply outcome; a slow or
        // dead peer must not delay a commit the quorum already reached.
        let result = {
            let replicate = self.replicate_all();
            let wait = tokio::time::timeout(self.opts.apply_timeout, rx);
            tokio::pin!(replicate);
            tokio::pin!(wait);
            let mut replicating = true;
            loop {
                tokio::select! {
                    _ = &mut replicate, if replicating => {
                        replicating = false;
                    }
                    outcome = &mut wait => break outcome,
                }
            }
        };

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(FsError::Transient(
                "apply channel closed before commit".to_string(),
            )),
            Err(_) => {
                self.waiters.lock().await.remove(&index);
                Err(FsError::Transient(format!(
                    "log apply timed out after {:?}",
                    self.opts.apply_timeout
                )))
            }
        }
    }

    pub async fn propose(&self, command: MetadataCommand) -> FsResult<CommandOutcome> {
        self.propose_log(LogCommand::Metadata(command)).await
    }

    /// Leader-side membership join.
    pub async fn handle_join(&self, request: JoinRequest) -> FsResult<JoinResponse> {
        if !self.is_leader().await {
            let hint = self
                .current_leader()
                .await
                .map(|l| format!(" (leader is {l})"))
                .unwrap_or_default();
            return Err(FsError::Upstream(format!(
                "join must be sent to the leader{hint}"
            )));
        }
        let outcome = self
            .propose_log(LogCommand::AddVoter {
                node_id: request.node_id.clone(),
                raft_addr: request.raft_addr,
                api_endpoint: request.api_endpoint,
            })
            .await?;
        outcome.into_result()?;
        tracing::info!(node_id = %request.node_id, "voter joined the cluster");
        Ok(JoinResponse {
            status: "joined".to_string(),
            leader_id: self.opts.node_id.clone(),
        })
    }

    /// Block until this node leads, bounded by `wait`.
    pub async fn wait_for_leadership(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.is_leader().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ------------------------------------------------------------------
    // RPC handlers (driven by the HTTP boundary)
    // ------------------------------------------------------------------

    pub async fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        if request.term > *self.current_term.read().await {
            self.step_down(request.term).await;
        }
        let term = *self.current_term.read().await;

        let mut granted = false;
        if request.term == term {
            let voted_for = self.voted_for.read().await.clone();
            let vote_free =
                voted_for.is_none() || voted_for.as_deref() == Some(&request.candidate_id);

            let (last_index, last_term) = self.last_log_position().unwrap_or((0, 0));
            let log_ok = request.last_log_term > last_term
                || (request.last_log_term == last_term && request.last_log_index >= last_index);

            if vote_free && log_ok {
                *self.voted_for.write().await = Some(request.candidate_id.clone());
                *self.last_heartbeat.write().await = Instant::now();
                if let Err(err) = self.persist_hard_state().await {
                    tracing::error!(error = %err, "failed to persist vote");
                }
                granted = true;
            }
        }

        VoteResponse {
            term,
            vote_granted: granted,
        }
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        if request.term > *self.current_term.read().await {
            self.step_down(request.term).await;
        }
        let term = *self.current_term.read().await;

        if request.term < term {
            return AppendEntriesResponse {
                term,
                success: false,
                match_index: 0,
            };
        }

        *self.role.write().await = Role::Follower;
        *self.leader_id.write().await = Some(request.leader_id.clone());
        *self.last_heartbeat.write().await = Instant::now();

        let reject = AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
        };

        let guard = self.log_guard.lock().await;

        // Consistency check against the entry preceding the new batch.
        if request.prev_log_index > 0 {
            match self.store.term_at(request.prev_log_index) {
                Ok(t) if t == request.prev_log_term => {}
                _ => return reject,
            }
        }

        let mut new_entries: Vec<LogEntry> = Vec::new();
        for entry in &request.entries {
            match self.store.entry(entry.index) {
                Ok(Some(existing)) if existing.term == entry.term => {}
                _ => {
                    // First divergence: drop our tail, take the leader's.
                    if self.store.truncate_from(entry.index).is_err() {
                        return reject;
                    }
                    new_entries = request
                        .entries
                        .iter()
                        .filter(|e| e.index >= entry.index)
                        .cloned()
                        .collect();
                    break;
                }
            }
        }
        if !new_entries.is_empty() {
            if let Err(err) = self.store.append(&new_entries) {
                tracing::error!(error = %err, "failed to append replicated entries");
                return reject;
            }
        }
        drop(guard);

        let match_index = request
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(request.prev_log_index);

        if request.leader_commit > *self.commit_index.read().await {
            let last = self.store.last_index().unwrap_or(0);
            *self.commit_index.write().await = request.leader_commit.min(last);
            self.apply_committed().await;
        }

        AppendEntriesResponse {
            term,
            success: true,
            match_index,
        }
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> FsResult<InstallSnapshotResponse> {
        if request.term > *self.current_term.read().await {
            self.step_down(request.term).await;
        }
        let term = *self.current_term.read().await;
        if request.term < term {
            return Ok(InstallSnapshotResponse { term });
        }

        *self.leader_id.write().await = Some(request.leader_id.clone());
        *self.last_heartbeat.write().await = Instant::now();

        let full: FullSnapshot = bincode::deserialize(&request.snapshot.data)
            .map_err(|e| FsError::Internal(format!("snapshot decode: {e}")))?;
        let boundary = request.snapshot.last_included_index;

        let _guard = self.log_guard.lock().await;
        self.sm.restore(full.state);
        *self.membership.write().await = full.membership;
        self.store
            .save_snapshot(&request.snapshot, self.opts.retain_snapshot_count)?;
        self.store.truncate_from(boundary + 1)?;
        *self.commit_index.write().await = boundary;
        *self.applied_index.write().await = boundary;

        tracing::info!(boundary, "installed snapshot from leader");
        Ok(InstallSnapshotResponse { term })
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    async fn maybe_take_snapshot(&self) -> FsResult<()> {
        let applied = *self.applied_index.read().await;
        let log_len = self.store.len() as u64;
        let due_by_size = log_len > self.opts.snapshot_threshold;
        let due_by_time = log_len > 0
            && self.last_snapshot.read().await.elapsed() >= self.opts.snapshot_interval;
        if !(due_by_size || due_by_time) || applied == 0 {
            return Ok(());
        }
        let already = self
            .store
            .latest_snapshot()?
            .map(|s| s.last_included_index)
            .unwrap_or(0);
        if applied <= already {
            return Ok(());
        }

        let term = self.store.term_at(applied)?;
        let mut state = self.sm.snapshot();
        state.last_applied = applied;
        let full = FullSnapshot {
            state,
            membership: self.membership.read().await.clone(),
        };
        let data =
            bincode::serialize(&full).map_err(|e| FsError::Internal(format!("snapshot: {e}")))?;

        self.store.save_snapshot(
            &StoredSnapshot {
                last_included_index: applied,
                last_included_term: term,
                data,
            },
            self.opts.retain_snapshot_count,
        )?;
        *self.last_snapshot.write().await = Instant::now();
        tracing::info!(index = applied, "snapshot taken");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BackendKind, Inode};

    fn options(node_id: &str, bootstrap: bool) -> RaftOptions {
        RaftOptions {
            node_id: node_id.to_string(),
            raft_addr: format!("http://127.0.0.1:1/{node_id}"),
            api_endpoint: format!("http://127.0.0.1:1/{node_id}"),
            bootstrap,
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            apply_timeout: Duration::from_secs(2),
            snapshot_threshold: 1024,
            snapshot_interval: Duration::from_secs(3600),
            retain_snapshot_count: 2,
            max_append_entries: 16,
            seed_peers: BTreeMap::new(),
        }
    }

    fn single_node(dir: &std::path::Path) -> Arc<RaftNode> {
        let store = Arc::new(RaftLogStore::open(dir).unwrap());
        let sm = Arc::new(StateMachine::new());
        let client = Arc::new(RaftClient::new("secret".into(), Duration::from_secs(1)).unwrap());
        RaftNode::new(options("node-1", true), store, sm, client).unwrap()
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());
        let (_tx, rx) = watch::channel(false);
        Arc::clone(&node).start(rx);

        assert!(node.wait_for_leadership(Duration::from_secs(2)).await);
        assert_eq!(node.current_leader().await.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_propose_applies_on_single_node() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());
        let (_tx, rx) = watch::channel(false);
        Arc::clone(&node).start(rx);
        assert!(node.wait_for_leadership(Duration::from_secs(2)).await);

        let inode = Inode::new_file("/a", 1, BackendKind::Localfs);
        let outcome = node
            .propose(MetadataCommand::CreateMetadata(inode.clone()))
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(node.state_machine().get("/a").unwrap().path, "/a");

        // Duplicate create surfaces the wire taxonomy.
        let outcome = node
            .propose(MetadataCommand::CreateMetadata(inode))
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("already_exists"));
    }

    #[tokio::test]
    async fn test_propose_rejected_on_follower() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RaftLogStore::open(dir.path()).unwrap());
        let sm = Arc::new(StateMachine::new());
        let client = Arc::new(RaftClient::new("secret".into(), Duration::from_secs(1)).unwrap());
        // Not started, never a leader.
        let node = RaftNode::new(options("node-1", false), store, sm, client).unwrap();

        let err = node
            .propose(MetadataCommand::DeleteMetadata {
                path: "/x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Transient(_)));
    }

    #[tokio::test]
    async fn test_restart_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let node = single_node(dir.path());
            let (tx, rx) = watch::channel(false);
            Arc::clone(&node).start(rx);
            assert!(node.wait_for_leadership(Duration::from_secs(2)).await);
            node.propose(MetadataCommand::CreateMetadata(Inode::new_file(
                "/persisted",
                5,
                BackendKind::Localfs,
            )))
            .await
            .unwrap();

            // Stop the background loops so the store lock is released.
            tx.send(true).unwrap();
            drop(node);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        // Fresh node over the same directory rehydrates the entry.
        let node = single_node(dir.path());
        assert_eq!(
            node.state_machine().get("/persisted").unwrap().size_bytes,
            5
        );
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());

        let request = VoteRequest {
            term: 5,
            candidate_id: "node-2".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let first = node.handle_request_vote(request.clone()).await;
        assert!(first.vote_granted);

        let rival = VoteRequest {
            candidate_id: "node-3".to_string(),
            ..request
        };
        let second = node.handle_request_vote(rival).await;
        assert!(!second.vote_granted);
    }

    #[tokio::test]
    async fn test_append_entries_rejects_stale_term() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());
        node.step_down(10).await;

        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 3,
                leader_id: "node-9".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.term, 10);
    }

    #[tokio::test]
    async fn test_append_entries_applies_committed() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());

        let entry = LogEntry {
            term: 1,
            index: 1,
            command: LogCommand::Metadata(MetadataCommand::CreateMetadata(Inode::new_file(
                "/from-leader",
                2,
                BackendKind::Localfs,
            ))),
        };
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "node-2".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry],
                leader_commit: 1,
            })
            .await;
        assert!(response.success);
        assert_eq!(response.match_index, 1);
        assert!(node.state_machine().get("/from-leader").is_ok());
        assert_eq!(node.current_leader().await.as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn test_membership_join_semantics() {
        let mut membership = Membership::default();
        membership.add_voter("a", "http://a:1", "http://a:2");
        membership.add_voter("b", "http://b:1", "http://b:2");

        // Same node, new address: record replaced.
        membership.add_voter("a", "http://a-new:1", "http://a:2");
        assert_eq!(membership.voters["a"].raft_addr, "http://a-new:1");
        assert_eq!(membership.voters.len(), 2);

        // New node on an address already taken: old occupant evicted.
        membership.add_voter("c", "http://b:1", "http://c:2");
        assert!(!membership.voters.contains_key("b"));
        assert!(membership.voters.contains_key("c"));
    }
}
