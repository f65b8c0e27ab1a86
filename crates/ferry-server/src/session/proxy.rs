//! Per-subdomain reverse proxy
//!
//! Every proxied request gets its own logical stream through the owning
//! tunnel, used as the TCP connection to the agent's local service for
//! exactly that request (or that upgraded connection).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use ferry_core::io::pipe;
use ferry_core::traits::StreamDialer;
use ferry_protocol::TunnelConfig;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::Instrument;

use crate::error::ProxyError;

/// Headers that only apply to a single hop
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check whether a request asks for a protocol upgrade
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Reverse proxy bound to one tunnel connection
pub struct HttpProxySession {
    /// Tunnel connection that registered this session
    connection_id: u64,
    /// Identity and local target declared by the agent
    config: TunnelConfig,
    /// `Host` value sent upstream instead of the public one
    host_override: Option<HeaderValue>,
    /// Extra headers applied to each request
    extra_headers: Vec<(HeaderName, HeaderValue)>,
    /// Opens logical streams through the owning tunnel
    dialer: Arc<dyn StreamDialer>,
}

impl HttpProxySession {
    /// Create a session, validating the declared headers
    pub fn new(
        connection_id: u64,
        config: TunnelConfig,
        dialer: Arc<dyn StreamDialer>,
    ) -> Result<Self, ProxyError> {
        let host_override = config
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(|h| HeaderValue::from_str(h).map_err(|_| ProxyError::InvalidHeader(h.to_string())))
            .transpose()?;

        let extra_headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ProxyError::InvalidHeader(name.clone()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| ProxyError::InvalidHeader(name.to_string()))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;

        Ok(Self {
            connection_id,
            config,
            host_override,
            extra_headers,
            dialer,
        })
    }

    /// Tunnel connection that owns this session
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Proxy one request, answering `502` on any tunnel or upstream failure
    pub async fn serve(&self, request: Request<Body>, peer: Option<SocketAddr>) -> Response {
        let method = request.method().clone();
        let uri = request.uri().clone();

        match self.forward(request, peer).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    "Proxy session {}: {} {} failed: {}",
                    self.config.name,
                    method,
                    uri,
                    e
                );
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
        }
    }

    /// Apply the host override, extra headers and forwarding headers
    fn rewrite_request(&self, request: &mut Request<Body>, upgrade: bool, peer: Option<SocketAddr>) {
        let headers = request.headers_mut();

        if !upgrade {
            strip_hop_by_hop(headers);
        }

        if let Some(host) = &self.host_override {
            headers.insert(header::HOST, host.clone());
        }

        for (name, value) in &self.extra_headers {
            if *name == header::HOST {
                headers.insert(header::HOST, value.clone());
            } else if !headers.contains_key(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        if let Some(peer) = peer {
            let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, peer.ip()),
                None => peer.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }
    }

    async fn forward(
        &self,
        mut request: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> Result<Response, ProxyError> {
        let upgrade = is_upgrade_request(request.headers());
        self.rewrite_request(&mut request, upgrade, peer);

        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let stream = self
            .dialer
            .dial(&self.config.local_host, self.config.local_port)
            .await
            .map_err(ProxyError::Dial)?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        let name = self.config.name.clone();
        tokio::spawn(
            async move {
                if let Err(e) = connection.with_upgrades().await {
                    tracing::debug!("Upstream connection for {} ended: {}", name, e);
                }
            }
            .in_current_span(),
        );

        let mut response = sender.send_request(request).await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let name = self.config.name.clone();
                tokio::spawn(
                    async move {
                        match tokio::try_join!(client_upgrade, upstream_upgrade) {
                            Ok((client, upstream)) => {
                                let stats = pipe(TokioIo::new(client), TokioIo::new(upstream)).await;
                                tracing::debug!(
                                    "Upgraded connection for {} closed ({} bytes up, {} bytes down)",
                                    name,
                                    stats.a_to_b,
                                    stats.b_to_a
                                );
                            }
                            Err(e) => tracing::warn!("Upgrade for {} failed: {}", name, e),
                        }
                    }
                    .in_current_span(),
                );
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        Ok(response.map(Body::new))
    }
}
