//! Replicated metadata log
//!
//! A strict-leader replicated state machine implementing the metadata store
//! contract. Exactly one node leads at any moment; followers forward write
//! commands to the leader over the authenticated internal HTTP channel.
//!
//! - `command`: the tagged command union and its wire outcomes
//! - `state_machine`: deterministic apply over the metadata maps
//! - `log_store`: sled-backed log, stable state and snapshots
//! - `node`: election, replication, commit, membership
//! - `rpc`: node-to-node request/response types and HTTP client
//! - `store`: the metadata-store facade over all of the above

pub mod command;
pub mod log_store;
pub mod node;
pub mod rpc;
pub mod state_machine;
pub mod store;

pub use command::{CommandOutcome, LogCommand, MetadataCommand};
pub use log_store::RaftLogStore;
pub use node::{Membership, PeerInfo, RaftNode, RaftOptions};
pub use rpc::{JoinRequest, JoinResponse, RaftClient};
pub use state_machine::StateMachine;
pub use store::ClusterMetadataStore;
