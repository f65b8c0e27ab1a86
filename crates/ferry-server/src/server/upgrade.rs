//! Tunnel upgrade detection and acceptance
//!
//! A request is a tunnel only when it asks for a WebSocket upgrade with
//! exactly our protocol version as subprotocol. Anything else, including an
//! agent speaking another version, falls through to plain HTTP handling.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ferry_protocol::{PROTOCOL_PREFIX, PROTOCOL_VERSION};
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::Instrument;

use crate::server::tunnel::serve_tunnel;
use crate::state::BrokerState;

/// How a request relates to the tunnel protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeKind {
    /// WebSocket upgrade with the expected protocol version
    Tunnel,
    /// Tunnel upgrade for a different protocol version
    VersionMismatch(String),
    /// Not a tunnel upgrade
    None,
}

/// Classify a request by its upgrade headers
pub fn classify_upgrade(headers: &HeaderMap) -> UpgradeKind {
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_websocket {
        return UpgradeKind::None;
    }

    match headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        Some(PROTOCOL_VERSION) => UpgradeKind::Tunnel,
        Some(other) if other.starts_with(PROTOCOL_PREFIX) => {
            UpgradeKind::VersionMismatch(other.to_string())
        }
        _ => UpgradeKind::None,
    }
}

/// Middleware taking tunnel upgrades off the normal request path
pub async fn accept_tunnel_upgrade(
    State(state): State<Arc<BrokerState>>,
    request: Request,
    next: Next,
) -> Response {
    match classify_upgrade(request.headers()) {
        UpgradeKind::Tunnel => accept(state, request),
        UpgradeKind::VersionMismatch(protocol) => {
            tracing::info!(
                "Ignoring client connection using protocol '{}', expected '{}'",
                protocol,
                PROTOCOL_VERSION
            );
            next.run(request).await
        }
        UpgradeKind::None => next.run(request).await,
    }
}

fn accept(state: Arc<BrokerState>, mut request: Request) -> Response {
    let Some(key) = request.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return (StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key").into_response();
    };
    let accept_key = derive_accept_key(key.as_bytes());

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let Some(on_upgrade) = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        tracing::error!("Tunnel request cannot be upgraded");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Connection cannot be upgraded").into_response();
    };

    tracing::debug!("New tunnel connection from {:?}", peer);

    let span = state.span.clone();
    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let ws =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    serve_tunnel(state, ws, peer).await;
                }
                Err(e) => tracing::error!("Failed to upgrade connection: {}", e),
            }
        }
        .instrument(span),
    );

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PROTOCOL_VERSION));
    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}
