//! Handshake payloads exchanged on the `config` global request
//!
//! Both types are JSON encoded with PascalCase field names so that the
//! payload reads `{"Name":..,"LocalHost":..,"LocalPort":..}` on the wire.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Client-declared identity and forwarding target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TunnelConfig {
    /// Human-readable tunnel name, used in broker logs
    #[serde(default)]
    pub name: String,

    /// Host the agent forwards to, meaningful only on the agent side
    pub local_host: String,

    /// Port the agent forwards to
    pub local_port: u16,

    /// Host header override applied to proxied requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Extra headers applied to proxied requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl TunnelConfig {
    /// Create a config forwarding to `local_host:local_port`
    pub fn new(name: impl Into<String>, local_host: impl Into<String>, local_port: u16) -> Self {
        Self {
            name: name.into(),
            local_host: local_host.into(),
            local_port,
            host: None,
            headers: BTreeMap::new(),
        }
    }

    /// The `host:port` tag used when opening logical streams to this target
    pub fn target(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Serialize as the `config` request payload
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a `config` request payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Broker's reply to the `config` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeReply {
    /// Fully qualified public domain assigned to the tunnel
    #[serde(default)]
    pub domain: String,

    /// Error message; non-empty means the tunnel was refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl HandshakeReply {
    /// A successful reply carrying the assigned domain
    pub fn success(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            err: None,
        }
    }

    /// A refusal carrying an error message
    pub fn failure(err: impl Into<String>) -> Self {
        Self {
            domain: String::new(),
            err: Some(err.into()),
        }
    }

    /// Error message if the tunnel was refused
    pub fn error(&self) -> Option<&str> {
        self.err.as_deref().filter(|e| !e.is_empty())
    }

    /// Serialize as the reply payload
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a reply payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_config_roundtrip() {
        let mut config = TunnelConfig::new("web", "127.0.0.1", 3000);
        config.host = Some("app.internal".to_string());
        config
            .headers
            .insert("X-Forwarded-Proto".to_string(), "https".to_string());

        let encoded = config.encode().unwrap();
        let decoded = TunnelConfig::decode(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_tunnel_config_wire_names() {
        let config = TunnelConfig::new("web", "10.0.0.5", 8080);
        let json: serde_json::Value = serde_json::from_slice(&config.encode().unwrap()).unwrap();
        assert_eq!(json["Name"], "web");
        assert_eq!(json["LocalHost"], "10.0.0.5");
        assert_eq!(json["LocalPort"], 8080);
    }

    #[test]
    fn test_tunnel_config_minimal_payload() {
        let config =
            TunnelConfig::decode(br#"{"Name":"x","LocalHost":"db","LocalPort":5432}"#).unwrap();
        assert_eq!(config.target(), "db:5432");
        assert!(config.host.is_none());
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_tunnel_config_malformed() {
        assert!(matches!(
            TunnelConfig::decode(b"not json"),
            Err(ProtocolError::InvalidPayload(_))
        ));
        assert!(TunnelConfig::decode(br#"{"Name":"x"}"#).is_err());
    }

    #[test]
    fn test_handshake_reply_error() {
        let ok = HandshakeReply::decode(br#"{"Domain":"abc.example.com"}"#).unwrap();
        assert_eq!(ok.error(), None);
        assert_eq!(ok.domain, "abc.example.com");

        let empty_err = HandshakeReply::decode(br#"{"Domain":"a","Err":""}"#).unwrap();
        assert_eq!(empty_err.error(), None);

        let failed = HandshakeReply::failure("expecting config request");
        let decoded = HandshakeReply::decode(&failed.encode().unwrap()).unwrap();
        assert_eq!(decoded.error(), Some("expecting config request"));
    }
}
