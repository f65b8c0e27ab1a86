//! Shared broker state

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferry_core::config::ServerConfig;
use ferry_protocol::server_ssh_id;
use russh::{MethodSet, SshId};
use russh_keys::key::KeyPair;
use tracing::Span;

use crate::session::SessionRegistry;

/// State shared by the HTTP routing path and every tunnel connection
pub struct BrokerState {
    /// Configuration
    pub config: ServerConfig,
    /// Subdomain registry
    pub registry: SessionRegistry,
    /// russh server configuration with the host key
    pub ssh_config: Arc<russh::server::Config>,
    /// Parent span for everything the broker logs
    pub span: Span,
    /// Source of tunnel connection ids
    next_connection_id: AtomicU64,
}

impl BrokerState {
    /// Create broker state
    pub fn new(config: ServerConfig, host_key: KeyPair, span: Span) -> Self {
        let registry = SessionRegistry::new(config.normalized_domain());
        Self {
            ssh_config: Arc::new(ssh_config(host_key)),
            registry,
            config,
            span,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new tunnel connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn ssh_config(host_key: KeyPair) -> russh::server::Config {
    russh::server::Config {
        server_id: SshId::Standard(server_ssh_id()),
        methods: MethodSet::PASSWORD,
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: None,
        ..Default::default()
    }
}
