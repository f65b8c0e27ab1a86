//! Bridging a logical stream to a TCP target

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::io::{pipe, PipeStats};
use crate::traits::StreamDialer;

/// Dial `host:port` and pipe `stream` to it until either side closes
///
/// If the dial fails the logical stream is shut down and the error returned.
pub async fn dial_and_bridge<S, D>(
    mut stream: S,
    dialer: &D,
    host: &str,
    port: u16,
) -> std::io::Result<PipeStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: StreamDialer + ?Sized,
{
    let target = match dialer.dial(host, port).await {
        Ok(target) => target,
        Err(e) => {
            tracing::error!("Failed to dial {}:{}: {}", host, port, e);
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let stats = pipe(stream, target).await;
    tracing::debug!(
        "Stream to {}:{} closed ({} bytes out, {} bytes in)",
        host,
        port,
        stats.a_to_b,
        stats.b_to_a
    );
    Ok(stats)
}
