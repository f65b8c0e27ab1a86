//! `ferry client`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use ferry_agent::Agent;
use ferry_core::config::{self, AgentConfig, HostKeyPolicy};
use ferry_core::types::parse_header;
use ferry_core::LocalTarget;
use tokio_util::sync::CancellationToken;

use crate::signals::{spawn_reload_listener, spawn_shutdown_listener};

/// Tunnel name used when neither a flag nor the config file sets one
const DEFAULT_TUNNEL_NAME: &str = "ferry";

/// Flags for the client agent
#[derive(Args, Debug, Clone, Default)]
pub struct ClientArgs {
    /// Broker address: ws://HOST[:PORT], wss://HOST[:PORT] or HOST:PORT
    #[arg(long)]
    pub server: Option<String>,

    /// Local service to expose: PORT, :PORT or HOST:PORT
    #[arg(long)]
    pub local: Option<LocalTarget>,

    /// Tunnel name shown in broker logs
    #[arg(long)]
    pub name: Option<String>,

    /// Host header sent to the local service
    #[arg(long)]
    pub host: Option<String>,

    /// Extra header for proxied requests, NAME=VALUE; repeatable
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Seconds between keepalives; 0 disables them
    #[arg(long, value_name = "SECS")]
    pub keepalive: Option<u64>,

    /// Consecutive failed attempts before giving up; 0 never gives up
    #[arg(long)]
    pub max_retry: Option<u32>,

    /// Longest wait between two attempts, in seconds
    #[arg(long, value_name = "SECS")]
    pub max_retry_interval: Option<u64>,

    /// Shared secret expected by the broker
    #[arg(long, env = "FERRY_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Only accept a broker host key with this SHA-256 fingerprint
    #[arg(long, conflicts_with = "known_hosts")]
    pub pin_host_key: Option<String>,

    /// Record broker host keys here and reject changed ones
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// TOML file with a full agent configuration; flags take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ClientArgs {
    /// Build the agent configuration from the config file and flags
    pub fn into_config(self) -> Result<AgentConfig> {
        let from_file = self.config.is_some();
        let mut config: AgentConfig = match &self.config {
            Some(path) => config::load_config(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => AgentConfig::default(),
        };

        match self.server {
            Some(server) => config.server = server_url(&server),
            None if !from_file => anyhow::bail!("A broker address is required (--server)"),
            None => {}
        }

        match self.local {
            Some(local) => {
                config.tunnel.local_host = local.host;
                config.tunnel.local_port = local.port;
            }
            None if !from_file => anyhow::bail!("A local address is required (--local)"),
            None => {}
        }

        if let Some(name) = self.name {
            config.tunnel.name = name;
        }
        if config.tunnel.name.is_empty() {
            config.tunnel.name = DEFAULT_TUNNEL_NAME.to_string();
        }
        if self.host.is_some() {
            config.tunnel.host = self.host;
        }
        config.tunnel.headers.extend(self.headers);

        if let Some(secs) = self.keepalive {
            config.keepalive = Duration::from_secs(secs);
        }
        if let Some(max_retry) = self.max_retry {
            config.backoff.max_retries = max_retry;
        }
        if let Some(secs) = self.max_retry_interval {
            config.backoff.max = Duration::from_secs(secs);
        }
        if self.auth_token.is_some() {
            config.auth_token = self.auth_token;
        }

        if let Some(fingerprint) = self.pin_host_key {
            config.host_key_policy = HostKeyPolicy::Pinned { fingerprint };
        } else if let Some(known_hosts) = self.known_hosts {
            config.host_key_policy = HostKeyPolicy::TrustOnFirstUse { known_hosts };
        }

        config.validate().context("Invalid client configuration")?;
        Ok(config)
    }
}

/// Accept a bare `host:port` as a plain WebSocket URL
fn server_url(server: &str) -> String {
    if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{}", server)
    }
}

/// Run the agent until it stops, Ctrl+C or SIGTERM
pub async fn run(args: ClientArgs) -> Result<()> {
    let config = args.into_config()?;
    tracing::info!(
        "Exposing {} through {}",
        config.tunnel.target(),
        config.server
    );

    let agent = Arc::new(Agent::start(config)?);

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());
    let reload_target = Arc::clone(&agent);
    spawn_reload_listener(cancel.clone(), move || reload_target.reload());

    let result = tokio::select! {
        result = agent.wait() => result,
        _ = cancel.cancelled() => {
            agent.close();
            agent.wait().await
        }
    };
    cancel.cancel();

    result.context("Client stopped")
}
