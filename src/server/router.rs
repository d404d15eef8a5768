// src/server/router.rs

//! The client-facing HTTP front end: turns incoming requests into
//! `ProxyRequest`s for the origin they are routed to.

use super::state::ServerState;
use crate::core::proxy::ProxyRequest;
use axum::Router;
use axum::body::{Bytes, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers `200 ok` without touching an origin.
pub const HEALTH_PATH: &str = "/stride/health";

/// Upper bound on buffered request bodies.
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn build(state: Arc<ServerState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    if parts.uri.path() == HEALTH_PATH {
        return (StatusCode::OK, "ok").into_response();
    }

    let body: Bytes = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Failed to read request body for {}: {}", parts.uri, e);
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    let Some((origin, path)) = state.route(parts.uri.path()) else {
        debug!("No origin matches {}", parts.uri);
        return (StatusCode::NOT_FOUND, "no origin configured for this path").into_response();
    };

    let url = origin.upstream_url(&path, parts.uri.query());
    let mut req = ProxyRequest::new(parts.method, url)
        .with_headers(parts.headers)
        .with_body(body);
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        req = req.with_client_addr(addr.ip());
    }

    let response = origin.serve(req, &path).await;
    (response.status, response.headers, response.body).into_response()
}
