//! Outbound tunnel connector
//!
//! Dials the broker over WebSocket, runs the SSH handshake across it and
//! exchanges the tunnel config on the control channel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::config::AgentConfig;
use ferry_core::error::ControlError;
use ferry_core::io::FrameAdapter;
use ferry_core::traits::{BoxedStream, TcpDialer};
use ferry_core::tunnel::{dial_and_bridge, spawn_control, ControlHandle, GlobalRequest};
use ferry_core::LocalTarget;
use ferry_protocol::{client_ssh_id, kinds, HandshakeReply, PROTOCOL_VERSION};
use russh::client::{self, Config, DisconnectReason, Handle, Msg, Session};
use russh::{Channel, Disconnect, SshId};
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::Instrument;

use crate::error::ConnectionError;
use crate::state::AgentState;
use crate::trust::{HostKeyVerifier, Verdict};

/// Subprotocol header sent with the WebSocket upgrade
const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// How long after the control channel ends the broker has to send its disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Outcome of the SSH session, reported by the client handler
type SessionEnd = oneshot::Receiver<Result<(), ConnectionError>>;

/// Establishes tunnels to the broker named in the agent config
pub struct TunnelConnector {
    /// Agent configuration
    config: AgentConfig,
    /// Whether the broker is reached over TLS
    secure: bool,
    /// `host:port` of the broker, used for host key records
    server: String,
}

impl TunnelConnector {
    /// Create a new tunnel connector, validating the server URL
    pub fn new(config: AgentConfig) -> Result<Self, ConnectionError> {
        let invalid = |message: &str| ConnectionError::InvalidServer {
            url: config.server.clone(),
            message: message.to_string(),
        };

        let uri = config
            .server
            .parse::<Uri>()
            .map_err(|e| invalid(&format!("{}", e)))?;

        let secure = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            _ => return Err(invalid("scheme must be ws or wss")),
        };
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let server = format!("{}:{}", host, port);
        Ok(Self {
            config,
            secure,
            server,
        })
    }

    /// Scheme of the public URL the broker serves
    pub fn public_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Attempt a single connection, reporting progress through `state`
    pub async fn connect(
        &self,
        state: &watch::Sender<AgentState>,
    ) -> Result<ActiveTunnel, ConnectionError> {
        let mut request = self.config.server.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));

        tracing::debug!("Dialing {}", self.config.server);
        let (ws, response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("WebSocket dial"))??;

        let negotiated = response
            .headers()
            .get(SUBPROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok());
        if negotiated != Some(PROTOCOL_VERSION) {
            return Err(ConnectionError::Other(anyhow::anyhow!(
                "broker did not accept protocol {}",
                PROTOCOL_VERSION
            )));
        }

        state.send_replace(AgentState::Handshaking);
        tokio::time::timeout(self.config.connect_timeout, self.handshake(ws, state))
            .await
            .map_err(|_| ConnectionError::Timeout("Tunnel handshake"))?
    }

    async fn handshake(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        state: &watch::Sender<AgentState>,
    ) -> Result<ActiveTunnel, ConnectionError> {
        let ssh_config = Arc::new(Config {
            client_id: SshId::Standard(client_ssh_id()),
            inactivity_timeout: None,
            ..Config::default()
        });

        let rejected = Arc::new(AtomicBool::new(false));
        let (ended_tx, ended) = oneshot::channel();
        let handler = ClientHandler {
            verifier: HostKeyVerifier::new(self.config.host_key_policy.clone(), &self.server),
            rejected: Arc::clone(&rejected),
            ended: Some(ended_tx),
            target: LocalTarget::new(
                self.config.tunnel.local_host.clone(),
                self.config.tunnel.local_port,
            ),
            span: tracing::Span::current(),
        };

        let mut session = client::connect_stream(ssh_config, FrameAdapter::new(ws), handler)
            .await
            .map_err(|e| {
                if rejected.load(Ordering::SeqCst) {
                    ConnectionError::HostKeyRejected {
                        message: format!("{} presented an untrusted host key", self.server),
                    }
                } else {
                    ConnectionError::Other(e.context("SSH handshake failed"))
                }
            })?;

        let name = self.config.tunnel.name.clone();
        let password = self.config.auth_token.clone().unwrap_or_default();
        tracing::debug!("Authenticating as '{}'", name);
        let authenticated = session
            .authenticate_password(name, password)
            .await
            .map_err(|e| anyhow::anyhow!("Authentication error: {}", e))?;

        if !authenticated {
            return Err(ConnectionError::AuthRejected);
        }

        state.send_replace(AgentState::ConfigExchange);
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open control channel: {}", e))?;
        let (control, requests, driver) = spawn_control(channel.into_stream());

        let domain = match self.exchange_config(&control).await {
            Ok(domain) => domain,
            Err(e) => {
                driver.abort();
                let _ = session
                    .disconnect(Disconnect::ByApplication, "config exchange failed", "en")
                    .await;
                return Err(e);
            }
        };

        Ok(ActiveTunnel {
            link: Link {
                handle: Arc::new(session),
                control,
            },
            requests,
            driver,
            ended,
            domain,
        })
    }

    /// Send the tunnel config and return the assigned public host
    async fn exchange_config(&self, control: &ControlHandle) -> Result<String, ConnectionError> {
        let reply = control
            .request(kinds::CONFIG, self.config.tunnel.encode()?)
            .await?;
        let handshake = HandshakeReply::decode(&reply.payload)?;
        if let Some(err) = handshake.error() {
            return Err(ConnectionError::ConfigRejected(err.to_string()));
        }
        if !reply.ok {
            return Err(ConnectionError::ConfigRejected(
                "config request refused".to_string(),
            ));
        }
        Ok(handshake.domain)
    }
}

/// Cloneable view of an established connection
#[derive(Clone)]
pub struct Link {
    handle: Arc<Handle<ClientHandler>>,
    control: ControlHandle,
}

impl Link {
    /// Send a keepalive and wait for the acknowledgement
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let reply = self.control.request(kinds::PING, Bytes::new()).await?;
        if reply.ok {
            Ok(())
        } else {
            Err(ConnectionError::Other(anyhow::anyhow!("keepalive refused")))
        }
    }

    /// Open a client-initiated logical stream to `host:port` on the broker side
    pub async fn open_stream(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("failed to open stream to {}:{}: {}", host, port, e),
                )
            })?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// An established tunnel
pub struct ActiveTunnel {
    link: Link,
    requests: mpsc::Receiver<GlobalRequest>,
    driver: JoinHandle<Result<(), ControlError>>,
    ended: SessionEnd,
    domain: String,
}

impl ActiveTunnel {
    /// Public host assigned by the broker
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Handle for pings and client-initiated streams
    pub fn link(&self) -> Link {
        self.link.clone()
    }

    /// Wait for the tunnel to close
    ///
    /// `Ok` only when the broker sent a disconnect. A transport that drops
    /// without one is an error, even if the control channel saw end of stream.
    pub async fn closed(&mut self) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                Some(request) = self.requests.recv() => {
                    // Dropping the request answers it negatively
                    tracing::debug!("Ignoring global request '{}' from broker", request.kind);
                }
                end = &mut self.ended => return session_outcome(end),
                result = &mut self.driver => {
                    match result {
                        Ok(Ok(())) => break,
                        Ok(Err(e)) => return Err(e.into()),
                        Err(e) => {
                            return Err(ConnectionError::Other(anyhow::anyhow!(
                                "control task failed: {}",
                                e
                            )))
                        }
                    }
                }
            }
        }

        match tokio::time::timeout(DISCONNECT_GRACE, &mut self.ended).await {
            Ok(end) => session_outcome(end),
            Err(_) => Err(ConnectionError::Other(anyhow::anyhow!(
                "control channel closed without a disconnect from the broker"
            ))),
        }
    }

    /// Disconnect from the broker
    pub async fn close(self) {
        if let Err(e) = self
            .link
            .handle
            .disconnect(Disconnect::ByApplication, "agent closing", "en")
            .await
        {
            tracing::debug!("Disconnect failed: {}", e);
        }
        self.driver.abort();
    }
}

fn session_outcome(
    end: Result<Result<(), ConnectionError>, oneshot::error::RecvError>,
) -> Result<(), ConnectionError> {
    end.unwrap_or_else(|_| {
        Err(ConnectionError::Other(anyhow::anyhow!(
            "SSH session ended without a disconnect"
        )))
    })
}

/// SSH client handler for the agent
pub struct ClientHandler {
    verifier: HostKeyVerifier,
    /// Set when the host key was refused, to tell it apart from other failures
    rejected: Arc<AtomicBool>,
    /// Told whether the broker disconnected or the transport failed
    ended: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    target: LocalTarget,
    span: tracing::Span,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {}", fingerprint);

        match self.verifier.verify(&fingerprint)? {
            Verdict::Trusted => Ok(true),
            Verdict::Rejected(reason) => {
                tracing::error!("Host key rejected: {}", reason);
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        let outcome = match &reason {
            DisconnectReason::ReceivedDisconnect(info)
                if matches!(info.reason_code, Disconnect::ByApplication) =>
            {
                tracing::debug!("Broker disconnected: {}", info.message);
                Ok(())
            }
            DisconnectReason::ReceivedDisconnect(info) => Err(anyhow::anyhow!(
                "broker disconnected with {:?}: {}",
                info.reason_code,
                info.message
            )),
            DisconnectReason::Error(e) => Err(anyhow::anyhow!("transport failed: {:#}", e)),
        };
        if let Some(ended) = self.ended.take() {
            let _ = ended.send(outcome.map_err(ConnectionError::Other));
        }

        match reason {
            DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            DisconnectReason::Error(e) => Err(e),
        }
    }

    /// Bridge a broker-initiated stream to the local target
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let tag_matches = connected_address == self.target.host
            && connected_port == u32::from(self.target.port);
        if !tag_matches {
            tracing::warn!(
                "Refusing stream to {}:{}, only {} is exposed",
                connected_address,
                connected_port,
                self.target
            );
            let _ = channel.close().await;
            return Ok(());
        }

        let host = self.target.host.clone();
        let port = self.target.port;
        tokio::spawn(
            async move {
                if let Err(e) = dial_and_bridge(channel.into_stream(), &TcpDialer, &host, port).await
                {
                    tracing::debug!("Stream ended with error: {}", e);
                }
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }
}
