//! Client agent: reconnect state machine and keepalive

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::config::AgentConfig;
use ferry_core::traits::{BoxedStream, StreamDialer};
use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::ConnectionError;
use crate::state::{AgentState, StopReason};
use crate::tunnel::{ExponentialBackoff, Link, TunnelConnector};

/// Keeps one tunnel to the broker open until closed or stopped
///
/// Dropping the agent stops it.
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    state: watch::Sender<AgentState>,
    /// Present while connected
    link: RwLock<Option<Link>>,
    reload: Notify,
    cancel: CancellationToken,
}

impl Agent {
    /// Start an agent under a span named after the tunnel
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: AgentConfig) -> Result<Self, ConnectionError> {
        let span = tracing::info_span!("agent", tunnel = %config.tunnel.name);
        Self::start_with_span(config, span)
    }

    /// Start an agent whose tasks all log under `span`
    pub fn start_with_span(
        config: AgentConfig,
        span: tracing::Span,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let connector = TunnelConnector::new(config.clone())?;
        let (state, _) = watch::channel(AgentState::Connecting { failures: 0 });

        let inner = Arc::new(AgentInner {
            config,
            state,
            link: RwLock::new(None),
            reload: Notify::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_connection_loop(Arc::clone(&inner), connector).instrument(span.clone()));
        tokio::spawn(run_keepalive(Arc::clone(&inner)).instrument(span));

        Ok(Self { inner })
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    /// Current state
    pub fn current_state(&self) -> AgentState {
        self.inner.state.borrow().clone()
    }

    /// Public host assigned by the broker, while connected
    pub fn domain(&self) -> Option<String> {
        match &*self.inner.state.borrow() {
            AgentState::Connected { domain } => Some(domain.clone()),
            _ => None,
        }
    }

    /// Cut a pending backoff delay short and reconnect now
    ///
    /// Has no effect unless the agent is currently waiting to retry.
    pub fn reload(&self) {
        self.inner.reload.notify_waiters();
    }

    /// Stop the agent, disconnecting from the broker
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Wait until the agent stops
    ///
    /// Returns `Ok` after [`Agent::close`] and the terminal error otherwise.
    pub async fn wait(&self) -> Result<(), ConnectionError> {
        let mut state = self.state();
        let reason = match state.wait_for(AgentState::is_stopped).await {
            Ok(current) => match &*current {
                AgentState::Stopped(reason) => reason.clone(),
                _ => StopReason::Closed,
            },
            Err(_) => StopReason::Closed,
        };
        reason.into_result()
    }

    /// Dialer opening client-initiated streams through the tunnel
    pub fn dialer(&self) -> AgentDialer {
        AgentDialer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Opens logical streams to the broker side of the tunnel
#[derive(Clone)]
pub struct AgentDialer {
    inner: Arc<AgentInner>,
}

#[async_trait]
impl StreamDialer for AgentDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let link = self.inner.link.read().await.clone();
        match link {
            Some(link) => link.open_stream(host, port).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel is not connected",
            )),
        }
    }
}

impl AgentInner {
    fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
    }

    fn stop(&self, reason: StopReason) {
        tracing::info!("Agent stopped: {:?}", reason);
        self.set_state(AgentState::Stopped(reason));
    }
}

async fn run_connection_loop(inner: Arc<AgentInner>, connector: TunnelConnector) {
    let mut backoff = ExponentialBackoff::from_config(&inner.config.backoff);
    let mut last_error: Option<ConnectionError> = None;

    loop {
        if let Some(e) = last_error.take() {
            let failures = backoff.record_failure();
            if backoff.exhausted() {
                tracing::error!("Connection error: {}", e);
                inner.stop(StopReason::RetriesExhausted { attempts: failures });
                return;
            }

            let delay = backoff.next_delay();
            if backoff.max_retries() > 0 {
                tracing::warn!(
                    "Connection error: {} (Attempt: {}/{}), retrying in {:?}",
                    e,
                    failures,
                    backoff.max_retries(),
                    delay
                );
            } else {
                tracing::warn!(
                    "Connection error: {} (Attempt: {}), retrying in {:?}",
                    e,
                    failures,
                    delay
                );
            }

            // Listen for reloads before announcing Disconnected
            let reload = inner.reload.notified();
            tokio::pin!(reload);
            reload.as_mut().enable();

            inner.set_state(AgentState::Disconnected);
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.stop(StopReason::Closed);
                    return;
                }
                _ = reload => {
                    tracing::info!("Reload requested, reconnecting now");
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        inner.set_state(AgentState::Connecting {
            failures: backoff.failures(),
        });

        let attempt = tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.stop(StopReason::Closed);
                return;
            }
            attempt = connector.connect(&inner.state) => attempt,
        };

        let mut tunnel = match attempt {
            Ok(tunnel) => tunnel,
            Err(e) => {
                if let Some(reason) = StopReason::from_error(&e) {
                    tracing::error!("{}", e);
                    inner.stop(reason);
                    return;
                }
                last_error = Some(e);
                continue;
            }
        };

        tracing::info!(
            "Service available at {}://{}",
            connector.public_scheme(),
            tunnel.domain()
        );
        backoff.reset();
        // Link is in place before Connected is published
        *inner.link.write().await = Some(tunnel.link());
        inner.set_state(AgentState::Connected {
            domain: tunnel.domain().to_string(),
        });

        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            result = tunnel.closed() => Some(result),
        };
        *inner.link.write().await = None;

        match outcome {
            None => {
                tunnel.close().await;
                inner.stop(StopReason::Closed);
                return;
            }
            Some(Ok(())) => {
                tracing::info!("Broker closed the tunnel, reconnecting");
                inner.set_state(AgentState::Disconnected);
            }
            Some(Err(e)) => last_error = Some(e),
        }
    }
}

async fn run_keepalive(inner: Arc<AgentInner>) {
    let interval = inner.config.keepalive;
    if interval.is_zero() {
        tracing::debug!("Keepalive disabled");
        return;
    }

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        if inner.state.borrow().is_stopped() {
            return;
        }

        let link = inner.link.read().await.clone();
        let Some(link) = link else {
            continue;
        };

        match tokio::time::timeout(interval, link.ping()).await {
            Ok(Ok(())) => tracing::trace!("Keepalive acknowledged"),
            Ok(Err(e)) => tracing::debug!("Keepalive failed: {}", e),
            Err(_) => tracing::debug!("Keepalive timed out"),
        }
    }
}
