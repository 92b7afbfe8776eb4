//! HTTP boundary
//!
//! Adapts external requests into engine and link-manager calls and formats
//! the responses:
//!
//! - `routes`: router assembly and middleware stack
//! - `handlers`: the v1 file/directory/link surface and open routes
//! - `internal`: node-to-node raft routes
//! - `ws`: WebSocket streaming transfers
//! - `middleware`: request IDs, logging, bearer authentication
//! - `responses`: error bodies, metadata headers, listing entries
//! - `state`: shared handler state

pub mod handlers;
pub mod internal;
pub mod middleware;
pub mod responses;
pub mod routes;
pub mod state;
pub mod ws;

pub use responses::{ApiError, ApiResult, ErrorCode};
pub use routes::build_router;
pub use state::AppState;
