//! Lifecycle of one accepted tunnel connection
//!
//! SSH handshake, then a bounded wait for the agent's `config` request,
//! subdomain assignment, and keepalive service until the transport closes.
//! The registry entry is removed when the connection ends.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::error::ControlError;
use ferry_core::io::FrameAdapter;
use ferry_core::traits::{BoxedStream, StreamDialer};
use ferry_core::tunnel::{spawn_control, GlobalRequest};
use ferry_protocol::{kinds, HandshakeReply, ProtocolError, TunnelConfig};
use futures::{Sink, Stream};
use russh::server::Handle;
use russh::Disconnect;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::Instrument;

use crate::error::{ProxyError, RegistryError};
use crate::server::handler::TunnelHandler;
use crate::session::HttpProxySession;
use crate::state::BrokerState;

/// How long a rejected agent gets to read its failure reply before the broker hangs up
const REJECT_LINGER: Duration = Duration::from_secs(2);

/// Why a tunnel never got a subdomain
#[derive(Error, Debug)]
enum SetupError {
    #[error("connection closed before opening a control channel")]
    NoControlChannel,

    #[error("control channel closed before the config request")]
    ControlClosed,

    #[error("expecting config request, got '{0}'")]
    UnexpectedRequest(String),

    #[error("malformed config: {0}")]
    InvalidConfig(#[from] ProtocolError),

    #[error("invalid tunnel config: {0}")]
    InvalidSession(#[from] ProxyError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Opens server-initiated logical streams over an agent's SSH connection
#[derive(Clone)]
pub struct TunnelDialer {
    handle: Handle,
}

impl TunnelDialer {
    /// Dial through the connection behind `handle`
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl StreamDialer for TunnelDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!("failed to open stream to {}:{}: {}", host, port, e),
                )
            })?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Run a tunnel over an upgraded WebSocket until it closes
pub async fn serve_tunnel<S>(state: Arc<BrokerState>, ws: S, peer: Option<SocketAddr>)
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let connection_id = state.next_connection_id();
    let span = tracing::info_span!(
        parent: &state.span,
        "tunnel",
        id = connection_id,
        peer = %peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()),
    );

    TunnelConnection {
        state,
        connection_id,
        host: None,
    }
    .run(ws, peer, span.clone())
    .instrument(span)
    .await
}

struct TunnelConnection {
    state: Arc<BrokerState>,
    connection_id: u64,
    /// Public host registered for this connection
    host: Option<String>,
}

impl TunnelConnection {
    async fn run<S>(mut self, ws: S, peer: Option<SocketAddr>, span: tracing::Span)
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
    {
        let handshake_timeout = self.state.config.handshake_timeout;
        let transport = FrameAdapter::new(ws).with_read_timeout(self.state.config.read_timeout);
        let (control_tx, control_rx) = oneshot::channel();
        let handler = TunnelHandler::new(Arc::clone(&self.state), peer, control_tx, span);

        let running = match tokio::time::timeout(
            handshake_timeout,
            russh::server::run_stream(Arc::clone(&self.state.ssh_config), transport, handler),
        )
        .await
        {
            Ok(Ok(running)) => running,
            Ok(Err(e)) => {
                tracing::error!("Failed to handshake with client: {}", e);
                return;
            }
            Err(_) => {
                tracing::warn!("SSH handshake timed out");
                return;
            }
        };
        let handle = running.handle();

        // The wait for `config` gets its own bound once the handshake is done
        let deadline = Instant::now() + handshake_timeout;
        match tokio::time::timeout_at(deadline, control_rx).await {
            Ok(Ok(channel)) => {
                let (_control, mut requests, driver) = spawn_control(channel.into_stream());
                match tokio::time::timeout_at(deadline, self.configure(&handle, &mut requests))
                    .await
                {
                    Ok(Ok(())) => {
                        serve_requests(requests).await;
                        log_control_end(driver).await;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Closing tunnel: {}", e);
                        drop(requests);
                        // The agent hangs up once it reads the failure reply
                        if tokio::time::timeout(REJECT_LINGER, driver).await.is_err() {
                            tracing::debug!("Agent kept the rejected tunnel open");
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            "No config request within {:?}, closing tunnel",
                            handshake_timeout
                        );
                        driver.abort();
                    }
                }
            }
            Ok(Err(_)) => tracing::warn!("Closing tunnel: {}", SetupError::NoControlChannel),
            Err(_) => tracing::warn!(
                "No control channel within {:?}, closing tunnel",
                handshake_timeout
            ),
        }

        if let Some(host) = self.host.take() {
            if self.state.registry.remove_if_owned(&host, self.connection_id) {
                tracing::info!("Unregistered {}", host);
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "tunnel closed".into(), "en".into())
            .await;
        match running.await {
            Ok(()) => tracing::info!("Tunnel closed"),
            Err(e) => tracing::debug!("Tunnel closed with error: {}", e),
        }
    }

    /// Answer the agent's first global request, which must be `config`
    async fn configure(
        &mut self,
        handle: &Handle,
        requests: &mut mpsc::Receiver<GlobalRequest>,
    ) -> Result<(), SetupError> {
        let request = requests.recv().await.ok_or(SetupError::ControlClosed)?;
        if request.kind != kinds::CONFIG {
            let kind = request.kind.clone();
            request.reply(false, reply_payload(&HandshakeReply::failure("expecting config request")));
            return Err(SetupError::UnexpectedRequest(kind));
        }

        match self.register(handle, &request.payload) {
            Ok(host) => {
                request.reply(true, reply_payload(&HandshakeReply::success(&host)));
                Ok(())
            }
            Err(e) => {
                request.reply(false, reply_payload(&HandshakeReply::failure(e.to_string())));
                Err(e)
            }
        }
    }

    fn register(&mut self, handle: &Handle, payload: &[u8]) -> Result<String, SetupError> {
        let config = TunnelConfig::decode(payload)?;
        let name = config.name.clone();
        let target = config.target();

        let dialer = Arc::new(TunnelDialer::new(handle.clone()));
        let session = HttpProxySession::new(self.connection_id, config, dialer)?;
        let host = self
            .state
            .registry
            .register(Arc::new(session), self.state.config.max_subdomain_draws)?;

        tracing::info!("Tunnel '{}' registered as {} -> {}", name, host, target);
        self.host = Some(host.clone());
        Ok(host)
    }
}

/// Answer keepalives until the control channel closes
async fn serve_requests(mut requests: mpsc::Receiver<GlobalRequest>) {
    while let Some(request) = requests.recv().await {
        match request.kind.as_str() {
            kinds::PING => request.reply(true, Bytes::new()),
            other => {
                // Dropping the request answers it negatively
                tracing::debug!("Ignoring unknown global request '{}'", other);
            }
        }
    }
}

async fn log_control_end(driver: JoinHandle<Result<(), ControlError>>) {
    match driver.await {
        Ok(Ok(())) => tracing::debug!("Control channel reached end of stream"),
        Ok(Err(e)) => tracing::warn!("Control channel failed: {}", e),
        Err(e) => tracing::warn!("Control channel task failed: {}", e),
    }
}

fn reply_payload(reply: &HandshakeReply) -> Bytes {
    match reply.encode() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!("Failed to encode handshake reply: {}", e);
            Bytes::new()
        }
    }
}
