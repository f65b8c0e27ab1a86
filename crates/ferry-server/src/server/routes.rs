//! Public HTTP surface

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::time::Instant;

use crate::server::upgrade::accept_tunnel_upgrade;
use crate::state::BrokerState;

/// Body returned when no session matches the `Host` header
pub const NO_UPSTREAM: &str = "No upstream found";

/// Build the broker's router
///
/// Tunnel upgrades are intercepted before routing; `/health` and
/// `/version` are answered for every host; everything else is routed to a
/// session by its `Host` header.
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/health", any(health))
        .route("/version", any(version))
        .fallback(route_by_host)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            accept_tunnel_upgrade,
        ))
        .layer(middleware::from_fn(log_request_timing))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK\n"
}

async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

async fn route_by_host(State(state): State<Arc<BrokerState>>, request: Request) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()));

    let Some(session) = host.as_deref().and_then(|h| state.registry.lookup(h)) else {
        tracing::debug!("No upstream for host {:?}", host);
        return (StatusCode::BAD_GATEWAY, NO_UPSTREAM).into_response();
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    session.serve(request, peer).await
}

async fn log_request_timing(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;
    tracing::debug!("Connection to {} lasts for {:?}", host, started.elapsed());
    response
}
