//! Subdomain to session registry
//!
//! Written by tunnel connections as they register and close, read by every
//! routed HTTP request. Sharded locks keep the two paths independent.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferry_core::types::{generate_subdomain, normalize_host, public_host};

use crate::error::RegistryError;
use crate::session::HttpProxySession;

/// Live sessions keyed by their full public host name
pub struct SessionRegistry {
    /// Lowercased top-level domain
    domain: String,
    /// `label.domain` -> session
    sessions: DashMap<String, Arc<HttpProxySession>>,
}

impl SessionRegistry {
    /// Create an empty registry for `domain`
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            sessions: DashMap::new(),
        }
    }

    /// Top-level domain sessions are registered under
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register a session under a freshly drawn subdomain
    ///
    /// Draws up to `max_draws` labels and takes the first free one. Returns
    /// the full public host name.
    pub fn register(
        &self,
        session: Arc<HttpProxySession>,
        max_draws: u32,
    ) -> Result<String, RegistryError> {
        self.register_with(session, max_draws, generate_subdomain)
    }

    fn register_with(
        &self,
        session: Arc<HttpProxySession>,
        max_draws: u32,
        mut draw: impl FnMut() -> String,
    ) -> Result<String, RegistryError> {
        let draws = max_draws.max(1);

        for _ in 0..draws {
            let host = public_host(&draw(), &self.domain);
            match self.sessions.entry(host.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(session);
                    return Ok(host);
                }
                Entry::Occupied(_) => {
                    tracing::debug!("Subdomain {} already taken, drawing again", host);
                }
            }
        }

        Err(RegistryError::Exhausted { draws })
    }

    /// Find the session for an HTTP `Host` value
    pub fn lookup(&self, host: &str) -> Option<Arc<HttpProxySession>> {
        self.sessions
            .get(&normalize_host(host))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `host` if it still belongs to `connection_id`
    pub fn remove_if_owned(&self, host: &str, connection_id: u64) -> bool {
        self.sessions
            .remove_if(host, |_, session| session.connection_id() == connection_id)
            .is_some()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::traits::TcpDialer;
    use ferry_protocol::TunnelConfig;

    fn session(connection_id: u64) -> Arc<HttpProxySession> {
        let config = TunnelConfig::new("web", "127.0.0.1", 3000);
        Arc::new(HttpProxySession::new(connection_id, config, Arc::new(TcpDialer)).unwrap())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new("example.com");
        let host = registry.register(session(1), 8).unwrap();

        let label = host.strip_suffix(".example.com").unwrap();
        assert_eq!(label.len(), 10);

        assert_eq!(registry.lookup(&host).unwrap().connection_id(), 1);
        assert!(registry.lookup(&format!("{}:8080", host)).is_some());
        assert!(registry.lookup(&host.to_uppercase()).is_some());
        assert!(registry.lookup("nonexistent.example.com").is_none());
    }

    #[test]
    fn test_collision_redraws() {
        let registry = SessionRegistry::new("example.com");
        let mut labels = vec!["aaaaaaaaaa", "aaaaaaaaaa", "bbbbbbbbbb"].into_iter();

        let first = registry
            .register_with(session(1), 8, || labels.next().unwrap().to_string())
            .unwrap();
        let second = registry
            .register_with(session(2), 8, || labels.next().unwrap().to_string())
            .unwrap();

        assert_eq!(first, "aaaaaaaaaa.example.com");
        assert_eq!(second, "bbbbbbbbbb.example.com");
        assert_eq!(registry.lookup(&first).unwrap().connection_id(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_collision_exhausted() {
        let registry = SessionRegistry::new("example.com");
        registry
            .register_with(session(1), 1, || "aaaaaaaaaa".to_string())
            .unwrap();

        let result = registry.register_with(session(2), 3, || "aaaaaaaaaa".to_string());
        assert_eq!(result, Err(RegistryError::Exhausted { draws: 3 }));
        assert_eq!(registry.lookup("aaaaaaaaaa.example.com").unwrap().connection_id(), 1);
    }

    #[test]
    fn test_remove_only_by_owner() {
        let registry = SessionRegistry::new("example.com");
        let host = registry.register(session(1), 8).unwrap();

        assert!(!registry.remove_if_owned(&host, 2));
        assert!(registry.lookup(&host).is_some());

        assert!(registry.remove_if_owned(&host, 1));
        assert!(registry.lookup(&host).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_and_lookup() {
        let registry = Arc::new(SessionRegistry::new("example.com"));

        let (registered_tx, registered_rx) = std::sync::mpsc::channel::<String>();

        let writers: Vec<_> = (0..8)
            .map(|id| {
                let registry = Arc::clone(&registry);
                let registered = registered_tx.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let host = registry.register(session(id), 8).unwrap();
                        registered.send(host).unwrap();
                    }
                })
            })
            .collect();
        drop(registered_tx);

        // Look hosts up while other threads are still registering
        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut hosts = Vec::new();
                for host in registered_rx {
                    assert!(registry.lookup(&host).is_some());
                    hosts.push(host);
                }
                hosts
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        let hosts = reader.join().unwrap();

        assert_eq!(registry.len(), hosts.len());
        for host in hosts {
            assert!(registry.lookup(&host).is_some());
        }
    }
}
