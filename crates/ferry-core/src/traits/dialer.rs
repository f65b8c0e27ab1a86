//! Opening logical streams to a host:port tag

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any bidirectional byte stream a tunnel can carry
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// Type-erased logical stream
pub type BoxedStream = Box<dyn TunnelIo>;

/// Something that can open a stream to `host:port`
///
/// The broker implements this over an agent's SSH connection; the agent
/// uses [`TcpDialer`] for its local service.
#[async_trait]
pub trait StreamDialer: Send + Sync {
    /// Open a new stream tagged with `host` and `port`
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<BoxedStream>;
}

/// Dials plain TCP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl StreamDialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}
