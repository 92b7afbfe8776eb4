//! # API Middleware
//!
//! Request-ID tagging and bearer-token authentication:
//!
//! - Every request gets an `X-Request-ID`, generated when absent
//! - `/download/*`, `/health` and `/metrics` are open routes
//! - `/internal/*` requires the shared instance-to-instance secret
//! - Everything else requires a configured API key, which resolves to a
//!   distinct user identity stored in request extensions
//!
//! Authorization decisions happen in the handlers, always before any
//! metadata existence check.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use super::responses::ApiError;
use super::state::AppState;
use crate::auth::{bearer_token, Identity};

/// Request ID header name
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Add a request ID to every request and response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Request ID stored in extensions
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Marker for requests authenticated with the internal secret
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

fn is_open_route(path: &str) -> bool {
    path.starts_with("/download/")
        || path.starts_with("/v1/download/")
        || path == "/health"
        || path == "/metrics"
}

/// Bearer-token authentication for every non-open route.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    if is_open_route(&path) {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?
        .to_string();

    if path.starts_with("/internal/") {
        state
            .authenticator
            .verify_internal(&token)
            .map_err(ApiError::from)?;
        request.extensions_mut().insert(InternalCaller);
        return Ok(next.run(request).await);
    }

    // Peer instances reach the public file routes with the internal secret.
    let identity = match state.authenticator.authenticate(&token) {
        Ok(identity) => identity,
        Err(err) => {
            if state.authenticator.verify_internal(&token).is_ok() {
                request.extensions_mut().insert(InternalCaller);
                Identity {
                    user: "internal".to_string(),
                    uid: 0,
                    gid: 0,
                }
            } else {
                return Err(err.into());
            }
        }
    };
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

/// Structured request/response logging.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_routes() {
        assert!(is_open_route("/download/abc"));
        assert!(is_open_route("/v1/download/abc"));
        assert!(is_open_route("/health"));
        assert!(is_open_route("/metrics"));
        assert!(!is_open_route("/v1/files/a"));
        assert!(!is_open_route("/internal/raft/join"));
    }
}
