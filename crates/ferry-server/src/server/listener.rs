//! Broker listener
//!
//! Serves the public router over plain HTTP or HTTPS until cancelled.
//! Cancellation stops accepting and lets in-flight requests finish;
//! established tunnels are not affected.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use ferry_core::config::{ServerConfig, TlsConfig};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::error::BrokerError;
use crate::server::routes::router;
use crate::state::BrokerState;

/// Public tunnel broker
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    /// Create a broker logging under a `broker` span
    pub fn new(config: ServerConfig, host_key: KeyPair) -> Self {
        let span = tracing::info_span!("broker", domain = %config.normalized_domain());
        Self::with_span(config, host_key, span)
    }

    /// Create a broker logging under `span`
    pub fn with_span(config: ServerConfig, host_key: KeyPair, span: Span) -> Self {
        Self {
            state: Arc::new(BrokerState::new(config, host_key, span)),
        }
    }

    /// Shared state, mainly for inspection
    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Router serving tunnels, auxiliary routes and proxied traffic
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let addr = self.state.config.bind_address.clone();

        if let Some(tls) = &self.state.config.tls {
            return self.serve_tls(&addr, tls, cancel).await;
        }

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })?;
        self.serve(listener, cancel).await
    }

    /// Serve plain HTTP on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let span = self.state.span.clone();
        let local_addr = listener.local_addr()?;

        async move {
            tracing::info!(
                "Broker listening on http://{} for *.{}",
                local_addr,
                self.state.registry.domain()
            );

            axum::serve(
                listener,
                self.router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

            tracing::info!("Broker shut down");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn serve_tls(
        &self,
        addr: &str,
        tls: &TlsConfig,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let span = self.state.span.clone();

        async move {
            let socket_addr = tokio::net::lookup_host(addr)
                .await
                .map_err(|source| BrokerError::Bind {
                    addr: addr.to_string(),
                    source,
                })?
                .next()
                .ok_or_else(|| BrokerError::Bind {
                    addr: addr.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "address did not resolve",
                    ),
                })?;

            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(BrokerError::Tls)?;

            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                shutdown.graceful_shutdown(None);
            });

            tracing::info!(
                "Broker listening on https://{} for *.{}",
                socket_addr,
                self.state.registry.domain()
            );

            axum_server::bind_rustls(socket_addr, rustls)
                .handle(handle)
                .serve(
                    self.router()
                        .into_make_service_with_connect_info::<SocketAddr>(),
                )
                .await?;

            tracing::info!("Broker shut down");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
