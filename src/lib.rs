//! # CallFS - Distributed REST Filesystem
//!
//! A distributed REST filesystem service projecting Unix-style file
//! semantics onto pluggable object stores. Instances cooperate as a
//! cluster: every file lives on exactly one owning instance, and requests
//! landing elsewhere are transparently forwarded.
//!
//! ## Architecture
//!
//! - `core`: error taxonomy, path sanitization, the data model
//! - `config`: TOML configuration and validation
//! - `auth`: bearer-token identities and the authorization seam
//! - `cache`: path-keyed metadata cache with TTL and prefix invalidation
//! - `locks`: per-path distributed mutex (local or Redis)
//! - `metadata`: the store contract plus memory/relational/embedded stores
//! - `cluster`: the leader-replicated metadata log
//! - `backends`: storage drivers (localfs, object store, peer proxy)
//! - `engine`: the request-path orchestration core
//! - `links`: single-use HMAC-bound download links
//! - `api`: the HTTP boundary
//! - `server`: assembly and lifecycle

#![warn(clippy::all)]

// Core primitives - errors, paths, data model
pub mod core;

// Configuration
pub mod config;

// Authentication and authorization
pub mod auth;

// Metadata cache
pub mod cache;

// Lock manager
pub mod locks;

// Metadata stores
pub mod metadata;

// Replicated metadata log
pub mod cluster;

// Storage backends
pub mod backends;

// Orchestration engine
pub mod engine;

// Single-use links
pub mod links;

// HTTP boundary
pub mod api;

// Server assembly
pub mod server;

// Re-export commonly used types
pub use crate::core::{BackendKind, FileKind, FsError, FsResult, Inode, LinkStatus, SingleUseLink};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
