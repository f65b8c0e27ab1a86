//! `ferry server`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use ferry_core::config::{self, ServerConfig, TlsConfig};
use ferry_server::auth::load_or_generate_host_key;
use ferry_server::Broker;
use tokio_util::sync::CancellationToken;

use crate::signals::spawn_shutdown_listener;

/// Flags for the public broker
#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Tunnel top level domain; *.DOMAIN must resolve to this server
    #[arg(long)]
    pub domain: Option<String>,

    /// Address of the public HTTP(S) listener
    #[arg(long)]
    pub bind: Option<String>,

    /// PEM certificate chain; serves HTTPS together with --tls-key
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Shared secret clients must present
    #[arg(long, env = "FERRY_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// SSH host key, generated on first start when missing
    #[arg(long)]
    pub host_key: Option<PathBuf>,

    /// TOML file with a full broker configuration; flags take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    /// Build the broker configuration from the config file and flags
    pub fn into_config(self) -> Result<ServerConfig> {
        let mut config: ServerConfig = match &self.config {
            Some(path) => config::load_config(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => ServerConfig::default(),
        };

        if let Some(domain) = self.domain {
            config.domain = domain;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let (Some(cert_path), Some(key_path)) = (self.tls_cert, self.tls_key) {
            config.tls = Some(TlsConfig {
                cert_path,
                key_path,
            });
        }
        if self.auth_token.is_some() {
            config.auth_token = self.auth_token;
        }
        if self.host_key.is_some() {
            config.host_key_path = self.host_key;
        }

        if config.normalized_domain().is_empty() {
            anyhow::bail!("A tunnel domain is required (--domain)");
        }

        Ok(config)
    }
}

/// Run the broker until Ctrl+C or SIGTERM
pub async fn run(args: ServerArgs) -> Result<()> {
    let config = args.into_config()?;

    let host_key = load_or_generate_host_key(config.host_key_path.as_deref()).await?;
    let fingerprint = host_key
        .clone_public_key()
        .context("Failed to extract public key from host key")?
        .fingerprint();
    tracing::info!("Host key fingerprint: {}", fingerprint);

    if config.auth_token.is_none() {
        tracing::warn!("No auth token configured - any client may open a tunnel");
    }

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let broker = Broker::new(config, host_key);
    broker.run(cancel).await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
