//! End-to-end tests
//!
//! These tests run a broker and an agent in-process and drive public
//! traffic through the tunnel to a local service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use ferry_agent::{Agent, AgentState, ConnectionError};
use ferry_core::config::{AgentConfig, HostKeyPolicy, ServerConfig};
use ferry_core::traits::StreamDialer;
use ferry_server::Broker;
use futures::{SinkExt, StreamExt};
use russh_keys::key::KeyPair;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const DOMAIN: &str = "example.com";

struct TestBroker {
    addr: SocketAddr,
    broker: Arc<Broker>,
    fingerprint: String,
    cancel: CancellationToken,
}

impl TestBroker {
    async fn start(auth_token: Option<&str>) -> Self {
        let config = ServerConfig {
            domain: DOMAIN.to_string(),
            auth_token: auth_token.map(str::to_string),
            ..ServerConfig::default()
        };
        let key = KeyPair::generate_ed25519().unwrap();
        let fingerprint = key.clone_public_key().unwrap().fingerprint();

        let broker = Arc::new(Broker::new(config, key));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let serving = Arc::clone(&broker);
        let shutdown = cancel.clone();
        tokio::spawn(async move { serving.serve(listener, shutdown).await });

        Self {
            addr,
            broker,
            fingerprint,
            cancel,
        }
    }

    fn agent_config(&self, local_port: u16) -> AgentConfig {
        let mut config = AgentConfig {
            server: format!("ws://{}", self.addr),
            keepalive: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(5),
            ..AgentConfig::default()
        };
        config.tunnel.name = "e2e".to_string();
        config.tunnel.local_host = "127.0.0.1".to_string();
        config.tunnel.local_port = local_port;
        config.backoff.initial = Duration::from_millis(20);
        config.backoff.max = Duration::from_millis(200);
        config
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Local HTTP service answering with the path and the Host it saw
async fn start_local_http() -> u16 {
    async fn echo(Path(path): Path<String>, headers: HeaderMap) -> String {
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        format!("echo {} via {}", path, host)
    }

    let app = Router::new().route("/*path", get(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await });
    port
}

/// Local TCP service echoing every byte
async fn start_local_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Local WebSocket service echoing every message
async fn start_local_ws_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Wait until the agent is connected and return its public host
async fn connected_domain(agent: &Agent) -> String {
    let mut state = agent.state();
    let current = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| matches!(s, AgentState::Connected { .. } | AgentState::Stopped(_))),
    )
    .await
    .expect("agent did not connect in time")
    .unwrap()
    .clone();

    match current {
        AgentState::Connected { domain } => domain,
        other => panic!("agent stopped: {:?}", other),
    }
}

/// TCP relay in front of the broker whose connections can all be reset at once
async fn start_resetting_relay(upstream: SocketAddr) -> (SocketAddr, Arc<Notify>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reset = Arc::new(Notify::new());

    let trigger = Arc::clone(&reset);
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                continue;
            };
            // Closing with a zero linger sends RST instead of FIN
            #[allow(deprecated)]
            let _ = inbound.set_linger(Some(Duration::ZERO));

            let trigger = Arc::clone(&trigger);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                    _ = trigger.notified() => {}
                }
            });
        }
    });

    (addr, reset)
}

fn assert_public_host(domain: &str) {
    let label = domain
        .strip_suffix(".example.com")
        .unwrap_or_else(|| panic!("unexpected domain {}", domain));
    assert_eq!(label.len(), 10);
    assert!(label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
}

#[tokio::test]
async fn test_proxied_request_reaches_local_service() {
    let broker = TestBroker::start(None).await;
    let local = start_local_http().await;
    let agent = Agent::start(broker.agent_config(local)).unwrap();

    let domain = connected_domain(&agent).await;
    assert_public_host(&domain);
    assert_eq!(agent.domain().as_deref(), Some(domain.as_str()));

    let response = reqwest::Client::new()
        .get(broker.url("/hello/world"))
        .header("Host", &domain)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.text().await.unwrap(),
        format!("echo hello/world via {}", domain)
    );

    // Host matching ignores case and port
    let response = reqwest::Client::new()
        .get(broker.url("/again"))
        .header("Host", format!("{}:8080", domain.to_uppercase()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    agent.close();
    agent.wait().await.unwrap();
}

#[tokio::test]
async fn test_unknown_host_is_bad_gateway() {
    let broker = TestBroker::start(None).await;

    let response = reqwest::Client::new()
        .get(broker.url("/"))
        .header("Host", "nonexistent.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "No upstream found");
}

#[tokio::test]
async fn test_auxiliary_routes() {
    let broker = TestBroker::start(None).await;

    let health = reqwest::get(broker.url("/health")).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap().trim(), "OK");

    let version = reqwest::get(broker.url("/version")).await.unwrap();
    assert_eq!(version.status(), 200);
    assert!(!version.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_protocol_upgrade_is_plain_http() {
    let broker = TestBroker::start(None).await;

    let response = reqwest::Client::new()
        .get(broker.url("/"))
        .header("Host", "nonexistent.example.com")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .header("Sec-WebSocket-Protocol", "ferry-v0")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "No upstream found");
}

#[tokio::test]
async fn test_websocket_upgrade_is_proxied() {
    let broker = TestBroker::start(None).await;
    let local = start_local_ws_echo().await;
    let agent = Agent::start(broker.agent_config(local)).unwrap();
    let domain = connected_domain(&agent).await;

    let tcp = TcpStream::connect(broker.addr).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(format!("ws://{}/chat", domain), tcp)
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("through the tunnel".to_string()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Text("through the tunnel".to_string()));

    agent.close();
}

#[tokio::test]
async fn test_agent_initiated_stream() {
    let broker = TestBroker::start(None).await;
    let local = start_local_http().await;
    let echo = start_local_tcp_echo().await;
    let agent = Agent::start(broker.agent_config(local)).unwrap();
    connected_domain(&agent).await;

    let mut stream = agent.dialer().dial("127.0.0.1", echo).await.unwrap();
    stream.write_all(b"over a client stream").await.unwrap();

    let mut buf = [0u8; 20];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over a client stream");

    agent.close();
}

#[tokio::test]
async fn test_auth_token_mismatch_is_terminal() {
    let broker = TestBroker::start(Some("right")).await;
    let mut config = broker.agent_config(start_local_http().await);
    config.auth_token = Some("wrong".to_string());
    config.backoff.max_retries = 0;

    let agent = Agent::start(config).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), agent.wait())
        .await
        .unwrap();
    assert!(matches!(result, Err(ConnectionError::AuthRejected)));
    assert!(broker.broker.state().registry.is_empty());
}

#[tokio::test]
async fn test_auth_token_match() {
    let broker = TestBroker::start(Some("right")).await;
    let mut config = broker.agent_config(start_local_http().await);
    config.auth_token = Some("right".to_string());

    let agent = Agent::start(config).unwrap();
    assert_public_host(&connected_domain(&agent).await);
    agent.close();
}

#[tokio::test]
async fn test_pinned_host_key() {
    let broker = TestBroker::start(None).await;
    let local = start_local_http().await;

    let mut wrong = broker.agent_config(local);
    wrong.host_key_policy = HostKeyPolicy::Pinned {
        fingerprint: "SHA256:not-the-broker".to_string(),
    };
    let agent = Agent::start(wrong).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), agent.wait())
        .await
        .unwrap();
    assert!(matches!(result, Err(ConnectionError::HostKeyRejected { .. })));

    let mut right = broker.agent_config(local);
    right.host_key_policy = HostKeyPolicy::Pinned {
        fingerprint: broker.fingerprint.clone(),
    };
    let agent = Agent::start(right).unwrap();
    connected_domain(&agent).await;
    agent.close();
}

#[tokio::test]
async fn test_trust_on_first_use_records_fingerprint() {
    let broker = TestBroker::start(None).await;
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("known_hosts");

    let mut config = broker.agent_config(start_local_http().await);
    config.host_key_policy = HostKeyPolicy::TrustOnFirstUse {
        known_hosts: known_hosts.clone(),
    };
    let agent = Agent::start(config).unwrap();
    connected_domain(&agent).await;
    agent.close();

    let contents = std::fs::read_to_string(&known_hosts).unwrap();
    assert_eq!(
        contents,
        format!("{} {}\n", broker.addr, broker.fingerprint)
    );
}

#[tokio::test]
async fn test_session_removed_when_agent_closes() {
    let broker = TestBroker::start(None).await;
    let agent = Agent::start(broker.agent_config(start_local_http().await)).unwrap();
    let domain = connected_domain(&agent).await;
    assert_eq!(broker.broker.state().registry.len(), 1);

    agent.close();
    agent.wait().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !broker.broker.state().registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let response = reqwest::Client::new()
        .get(broker.url("/"))
        .header("Host", &domain)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_agents_get_distinct_hosts() {
    let broker = TestBroker::start(None).await;
    let local = start_local_http().await;

    let first = Agent::start(broker.agent_config(local)).unwrap();
    let second = Agent::start(broker.agent_config(local)).unwrap();
    let first_domain = connected_domain(&first).await;
    let second_domain = connected_domain(&second).await;

    assert_ne!(first_domain, second_domain);
    assert_eq!(broker.broker.state().registry.len(), 2);

    first.close();
    second.close();
}

#[tokio::test]
async fn test_reset_transport_goes_through_backoff() {
    let broker = TestBroker::start(None).await;
    let (relay, reset) = start_resetting_relay(broker.addr).await;

    let mut config = broker.agent_config(start_local_http().await);
    config.server = format!("ws://{}", relay);
    config.backoff.initial = Duration::from_secs(60);
    config.backoff.max = Duration::from_secs(60);

    let agent = Agent::start(config).unwrap();
    connected_domain(&agent).await;

    reset.notify_waiters();

    let mut state = agent.state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == AgentState::Disconnected),
    )
    .await
    .expect("agent did not notice the reset")
    .unwrap();

    // A dropped transport is a failure: the agent waits out its backoff
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agent.current_state(), AgentState::Disconnected);
    assert!(agent.domain().is_none());

    agent.close();
    agent.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dial_right_after_connected() {
    let broker = TestBroker::start(None).await;
    let local = start_local_http().await;
    let echo = start_local_tcp_echo().await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let config = broker.agent_config(local);
            tokio::spawn(async move {
                let agent = Agent::start(config).unwrap();
                connected_domain(&agent).await;

                let mut stream = agent.dialer().dial("127.0.0.1", echo).await.unwrap();
                stream.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");

                agent.close();
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
}
