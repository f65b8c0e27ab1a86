//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_secs, option_duration_secs};

/// Configuration for the tunnel broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the public HTTP(S) listener binds to
    pub bind_address: String,

    /// Top-level domain; `*.<domain>` must resolve to this server
    pub domain: String,

    /// Path to the SSH host key (generated on first start when missing)
    pub host_key_path: Option<PathBuf>,

    /// Shared secret clients must present; `None` accepts every client
    pub auth_token: Option<String>,

    /// Bound on the SSH handshake, and then separately on the wait for the
    /// agent's `config` request
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Read deadline applied to the tunnel's WebSocket frames
    #[serde(with = "option_duration_secs")]
    pub read_timeout: Option<Duration>,

    /// Serve HTTPS instead of plain HTTP
    pub tls: Option<TlsConfig>,

    /// Whether agents may open logical streams that the broker dials
    pub allow_client_streams: bool,

    /// How many labels to draw before giving up on a free subdomain
    pub max_subdomain_draws: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:80".to_string(),
            domain: "localhost".to_string(),
            host_key_path: None,
            auth_token: None,
            handshake_timeout: Duration::from_secs(10),
            read_timeout: None,
            tls: None,
            allow_client_streams: true,
            max_subdomain_draws: 8,
        }
    }
}

impl ServerConfig {
    /// Domain with any leading dot removed and lowercased
    pub fn normalized_domain(&self) -> String {
        self.domain.trim_start_matches('.').to_ascii_lowercase()
    }
}

/// Certificate and key for the HTTPS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
}
