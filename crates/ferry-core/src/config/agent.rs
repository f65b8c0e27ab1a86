//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use ferry_protocol::TunnelConfig;

use crate::error::ConfigError;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the client agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker URL, `ws://host[:port]` or `wss://host[:port]`
    pub server: String,

    /// Identity and local target announced to the broker
    pub tunnel: TunnelConfig,

    /// Interval between keepalive pings; zero disables them
    #[serde(with = "duration_secs")]
    pub keepalive: Duration,

    /// Bound on WebSocket dial plus SSH handshake
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Shared secret presented to the broker
    pub auth_token: Option<String>,

    /// How the broker's host key is verified
    pub host_key_policy: HostKeyPolicy,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:80".to_string(),
            tunnel: TunnelConfig::new("", "127.0.0.1", 80),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(45),
            auth_token: None,
            host_key_policy: HostKeyPolicy::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Check values that deserialization alone does not constrain
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,

    /// Consecutive failures before giving up; 0 retries forever
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.0,
            max_retries: 0,
        }
    }
}

impl BackoffConfig {
    /// Reject a multiplier below 1.0 and jitter outside `[0, 1]`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be a number of at least 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Trust policy for the broker's SSH host key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key, logging its fingerprint
    #[default]
    AcceptAny,
    /// Accept only the given SHA-256 fingerprint
    Pinned {
        /// Fingerprint as printed by the broker at startup
        fingerprint: String,
    },
    /// Record the first key seen per server and reject changes
    TrustOnFirstUse {
        /// File of `server fingerprint` lines
        known_hosts: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.keepalive, Duration::from_secs(60));
        assert_eq!(config.backoff.max, Duration::from_secs(300));
        assert_eq!(config.backoff.max_retries, 0);
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_backoff_validation() {
        assert!(AgentConfig::default().validate().is_ok());

        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let backoff = BackoffConfig {
                multiplier,
                ..BackoffConfig::default()
            };
            assert!(
                matches!(backoff.validate(), Err(ConfigError::Invalid(_))),
                "multiplier {} accepted",
                multiplier
            );
        }

        for jitter in [-0.1, 1.5, f64::NAN] {
            let backoff = BackoffConfig {
                jitter,
                ..BackoffConfig::default()
            };
            assert!(backoff.validate().is_err(), "jitter {} accepted", jitter);
        }

        let edge = BackoffConfig {
            multiplier: 1.0,
            jitter: 1.0,
            ..BackoffConfig::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_negative_multiplier_from_toml_is_invalid() {
        let config: AgentConfig = toml::from_str(
            r#"
[backoff]
multiplier = -1.5
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_host_key_policy_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: HostKeyPolicy,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
[policy]
mode = "pinned"
fingerprint = "SHA256:abc"
"#,
        )
        .unwrap();
        assert_eq!(
            parsed.policy,
            HostKeyPolicy::Pinned {
                fingerprint: "SHA256:abc".to_string()
            }
        );
    }
}
