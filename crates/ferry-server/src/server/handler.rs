//! SSH handler for agent tunnels
//!
//! Implements the russh server handler for one tunnel connection:
//! password authentication, the control channel hand-off, and logical
//! streams opened by the agent.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::traits::TcpDialer;
use ferry_core::tunnel::dial_and_bridge;
use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use tokio::sync::oneshot;
use tracing::{Instrument, Span};

use crate::auth::check_token;
use crate::state::BrokerState;

/// Handler for a single agent's SSH connection
pub struct TunnelHandler {
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Peer address of the connecting agent, when known
    peer: Option<SocketAddr>,
    /// Hands the first session channel to the connection task
    control_tx: Option<oneshot::Sender<Channel<Msg>>>,
    /// Span of the owning tunnel connection
    span: Span,
}

impl TunnelHandler {
    /// Create a handler delivering the control channel on `control_tx`
    pub fn new(
        state: Arc<BrokerState>,
        peer: Option<SocketAddr>,
        control_tx: oneshot::Sender<Channel<Msg>>,
        span: Span,
    ) -> Self {
        Self {
            state,
            peer,
            control_tx: Some(control_tx),
            span,
        }
    }

    fn peer_label(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    type Error = anyhow::Error;

    /// Accept the agent when its password matches the configured token
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if check_token(self.state.config.auth_token.as_deref(), password) {
            tracing::info!("{} is connecting from {}", user, self.peer_label());
            return Ok(Auth::Accept);
        }

        tracing::warn!(
            "Authentication REJECTED for {} from {}: bad token",
            user,
            self.peer_label()
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// The first session channel becomes the control channel
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(control_tx) = self.control_tx.take() else {
            tracing::warn!("Refusing second session channel from {}", self.peer_label());
            return Ok(false);
        };

        tracing::debug!("Control channel opened: {:?}", channel.id());
        Ok(control_tx.send(channel).is_ok())
    }

    /// Agent-initiated logical stream: dial the tagged target and bridge
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.state.config.allow_client_streams {
            tracing::warn!(
                "Refusing stream to {}:{} from {}: client streams disabled",
                host_to_connect,
                port_to_connect,
                self.peer_label()
            );
            return Ok(false);
        }

        let Ok(port) = u16::try_from(port_to_connect) else {
            tracing::warn!("Refusing stream with invalid port {}", port_to_connect);
            return Ok(false);
        };

        let host = host_to_connect.to_string();
        tokio::spawn(
            async move {
                let _ = dial_and_bridge(channel.into_stream(), &TcpDialer, &host, port).await;
            }
            .instrument(self.span.clone()),
        );

        Ok(true)
    }
}
