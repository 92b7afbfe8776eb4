//! Shared handler state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{Authenticator, SharedAuthorizer};
use crate::cluster::{RaftClient, RaftNode};
use crate::engine::Engine;
use crate::links::LinkManager;

/// Everything the handlers need, built once at startup.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub links: Arc<LinkManager>,
    pub authenticator: Arc<Authenticator>,
    pub authorizer: SharedAuthorizer,
    /// Present only when the replicated metadata store is configured
    pub raft: Option<Arc<RaftNode>>,
    pub raft_client: Option<Arc<RaftClient>>,
    /// Externally reachable base URL of this instance
    pub external_url: String,
    /// instance_id → externally reachable base URL of siblings
    pub peer_endpoints: HashMap<String, String>,
}
