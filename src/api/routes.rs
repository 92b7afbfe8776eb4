//! Router assembly.
//!
//! The public v1 surface, the unauthenticated download/health routes and
//! the internal raft routes share one router and one middleware stack:
//! request-ID tagging, structured logging, bearer auth and CORS.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, header::HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::internal;
use super::middleware::{auth_middleware, request_id_middleware, request_logging_middleware};
use super::state::AppState;

/// CORS policy for browser clients.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-request-id"),
        ])
        .max_age(Duration::from_secs(3600))
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/files/*path",
            get(handlers::files_get)
                .post(handlers::files_post)
                .put(handlers::files_put)
                .delete(handlers::files_delete),
        )
        .route("/v1/directories/*path", get(handlers::directories_get))
        .route("/v1/links/generate", post(handlers::links_generate))
        .route("/download/:token", get(handlers::download))
        .route("/v1/download/:token", get(handlers::download))
        .route("/internal/raft/join", post(internal::raft_join))
        .route("/internal/raft/metadata/apply", post(internal::raft_apply))
        .route("/internal/raft/vote", post(internal::raft_vote))
        .route("/internal/raft/append", post(internal::raft_append))
        .route("/internal/raft/snapshot", post(internal::raft_snapshot))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
