//! Core domain types

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TargetError;

/// Number of characters in a generated subdomain label
pub const SUBDOMAIN_LEN: usize = 10;

const SUBDOMAIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Draw a random subdomain label of `SUBDOMAIN_LEN` characters from `[a-z0-9]`
pub fn generate_subdomain() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBDOMAIN_LEN)
        .map(|_| SUBDOMAIN_ALPHABET[rng.gen_range(0..SUBDOMAIN_ALPHABET.len())] as char)
        .collect()
}

/// Join a label and a top-level domain into the public host name
pub fn public_host(label: &str, domain: &str) -> String {
    format!("{}.{}", label, domain.trim_start_matches('.'))
}

/// Normalize an HTTP `Host` value for registry lookups
///
/// Strips an optional `:port` suffix and lowercases the name. IPv6 literals
/// keep their brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let name = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// The local service an agent forwards to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTarget {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl LocalTarget {
    /// Host used when only a port is given
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";

    /// Create a new target
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for LocalTarget {
    type Err = TargetError;

    /// Accepts `3000`, `:3000` and `192.168.0.12:8000`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (host, port) = match parts.as_slice() {
            [port] => ("", *port),
            [host, port] => (*host, *port),
            _ => return Err(TargetError::InvalidLocal(s.to_string())),
        };

        let port = parse_port(port)?;
        let host = if host.is_empty() {
            Self::DEFAULT_HOST
        } else {
            host
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(s: &str) -> Result<u16, TargetError> {
    match s.parse::<u16>() {
        Ok(port) if port > 0 && port < u16::MAX => Ok(port),
        _ => Err(TargetError::InvalidPort(s.to_string())),
    }
}

/// Parse a `NAME=VALUE` header flag
pub fn parse_header(s: &str) -> Result<(String, String), TargetError> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(TargetError::InvalidHeader(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_subdomains_shape() {
        for _ in 0..1000 {
            let label = generate_subdomain();
            assert_eq!(label.len(), SUBDOMAIN_LEN);
            assert!(label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_public_host() {
        assert_eq!(public_host("abc", "example.com"), "abc.example.com");
        assert_eq!(public_host("abc", ".example.com"), "abc.example.com");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("ABC.example.com"), "abc.example.com");
        assert_eq!(normalize_host("abc.example.com:8080"), "abc.example.com");
        assert_eq!(normalize_host("abc.example.com."), "abc.example.com");
        assert_eq!(normalize_host("[::1]:80"), "[::1]");
    }

    #[test]
    fn test_local_target_parse() {
        assert_eq!(
            "3000".parse::<LocalTarget>().unwrap(),
            LocalTarget::new("127.0.0.1", 3000)
        );
        assert_eq!(
            ":3000".parse::<LocalTarget>().unwrap(),
            LocalTarget::new("127.0.0.1", 3000)
        );
        assert_eq!(
            "192.168.0.12:8000".parse::<LocalTarget>().unwrap(),
            LocalTarget::new("192.168.0.12", 8000)
        );
    }

    #[test]
    fn test_local_target_invalid() {
        assert!(matches!(
            "a:b:c".parse::<LocalTarget>(),
            Err(TargetError::InvalidLocal(_))
        ));
        assert!(matches!(
            "0".parse::<LocalTarget>(),
            Err(TargetError::InvalidPort(_))
        ));
        assert!(matches!(
            "65535".parse::<LocalTarget>(),
            Err(TargetError::InvalidPort(_))
        ));
        assert!("host:http".parse::<LocalTarget>().is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("host=example.com").unwrap(),
            ("host".to_string(), "example.com".to_string())
        );
        assert_eq!(
            parse_header("X-Token = a=b").unwrap(),
            ("X-Token".to_string(), "a=b".to_string())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=x").is_err());
    }
}
