//! Core module - error taxonomy, path handling and the shared data model
//!
//! Everything above this module (stores, backends, engine, API) speaks in
//! these types; nothing here depends on any other module.

pub mod error;
pub mod path;
pub mod types;

// Re-export commonly used types
pub use error::{FsError, FsResult};
pub use types::{BackendKind, FileKind, Inode, LinkStatus, SingleUseLink};
