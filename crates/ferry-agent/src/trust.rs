//! Broker host key verification

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use ferry_core::config::HostKeyPolicy;

/// Outcome of checking a presented host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Key accepted
    Trusted,
    /// Key refused, with the reason
    Rejected(String),
}

/// Applies a [`HostKeyPolicy`] to the key a broker presents
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    /// `host:port` the fingerprint is recorded under
    server: String,
}

impl HostKeyVerifier {
    /// Create a verifier for `server`
    pub fn new(policy: HostKeyPolicy, server: impl Into<String>) -> Self {
        Self {
            policy,
            server: server.into(),
        }
    }

    /// Check a SHA-256 host key fingerprint
    pub fn verify(&self, fingerprint: &str) -> io::Result<Verdict> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                tracing::warn!(
                    "Accepting unverified host key {} for {}",
                    fingerprint,
                    self.server
                );
                Ok(Verdict::Trusted)
            }
            HostKeyPolicy::Pinned { fingerprint: pinned } => {
                if pinned == fingerprint {
                    tracing::debug!("Host key matches pinned fingerprint");
                    Ok(Verdict::Trusted)
                } else {
                    Ok(Verdict::Rejected(format!(
                        "expected {}, got {}",
                        pinned, fingerprint
                    )))
                }
            }
            HostKeyPolicy::TrustOnFirstUse { known_hosts } => {
                self.verify_known_host(known_hosts, fingerprint)
            }
        }
    }

    fn verify_known_host(&self, path: &Path, fingerprint: &str) -> io::Result<Verdict> {
        if let Some(known) = lookup_known_host(path, &self.server)? {
            if known == fingerprint {
                return Ok(Verdict::Trusted);
            }
            return Ok(Verdict::Rejected(format!(
                "host key for {} changed: recorded {}, got {}",
                self.server, known, fingerprint
            )));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{} {}", self.server, fingerprint)?;

        tracing::info!(
            "Trusting host key {} for {} on first use",
            fingerprint,
            self.server
        );
        Ok(Verdict::Trusted)
    }
}

/// Find the recorded fingerprint for `server`
fn lookup_known_host(path: &Path, server: &str) -> io::Result<Option<String>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        if let (Some(host), Some(fingerprint)) = (parts.next(), parts.next()) {
            if host == server {
                return Ok(Some(fingerprint.to_string()));
            }
        }
    }

    Ok(None)
}
