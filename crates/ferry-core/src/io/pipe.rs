//! Bidirectional copy between two byte streams

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction by [`pipe`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Bytes read from `a` and written to `b`
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`
    pub b_to_a: u64,
}

/// Copy bytes both ways until either side reaches EOF or fails
///
/// The first direction to stop ends the other one as well. Both endpoints
/// are then shut down exactly once and dropped, whatever caused the end.
pub async fn pipe<A, B>(a: A, b: B) -> PipeStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let done = CancellationToken::new();

    let (a_to_b, b_to_a) = tokio::join!(
        copy_until_done(&mut a_read, &mut b_write, &done),
        copy_until_done(&mut b_read, &mut a_write, &done),
    );

    let _ = tokio::join!(a_write.shutdown(), b_write.shutdown());

    PipeStats { a_to_b, b_to_a }
}

async fn copy_until_done<R, W>(reader: &mut R, writer: &mut W, done: &CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Pipe read ended: {}", e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = done.cancelled() => break,
            written = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => written,
        };

        if let Err(e) = written {
            tracing::debug!("Pipe write ended: {}", e);
            break;
        }
        copied += n as u64;
    }

    done.cancel();
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    /// Duplex endpoint that counts shutdown calls
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl CountingStream {
        fn new(inner: DuplexStream) -> (Self, Arc<AtomicUsize>) {
            let shutdowns = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    inner,
                    shutdowns: Arc::clone(&shutdowns),
                },
                shutdowns,
            )
        }
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_pipe_copies_both_directions() {
        let (a_local, mut a_remote) = tokio::io::duplex(1024);
        let (b_local, mut b_remote) = tokio::io::duplex(1024);

        let task = tokio::spawn(pipe(a_local, b_local));

        a_remote.write_all(b"request bytes").await.unwrap();
        let mut buf = [0u8; 13];
        b_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request bytes");

        b_remote.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        a_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(a_remote);
        let stats = task.await.unwrap();
        assert_eq!(stats, PipeStats { a_to_b: 13, b_to_a: 5 });

        // The other side observes the close
        let mut rest = Vec::new();
        b_remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_large_transfer() {
        let (a_local, mut a_remote) = tokio::io::duplex(4096);
        let (b_local, mut b_remote) = tokio::io::duplex(4096);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();

        let task = tokio::spawn(pipe(a_local, b_local));

        let sent = data.clone();
        let writer = tokio::spawn(async move {
            a_remote.write_all(&sent).await.unwrap();
            a_remote.shutdown().await.unwrap();
            a_remote
        });

        let mut received = Vec::new();
        b_remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, data);

        let _a_remote = writer.await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.a_to_b, data.len() as u64);
    }

    #[tokio::test]
    async fn test_each_endpoint_closed_exactly_once() {
        let (a_local, a_remote) = tokio::io::duplex(1024);
        let (b_local, b_remote) = tokio::io::duplex(1024);
        let (a, a_shutdowns) = CountingStream::new(a_local);
        let (b, b_shutdowns) = CountingStream::new(b_local);

        // Both peers vanish at once so both directions fail together
        drop(a_remote);
        drop(b_remote);

        pipe(a, b).await;

        assert_eq!(a_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(b_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_side_closing_ends_the_other() {
        let (a_local, a_remote) = tokio::io::duplex(1024);
        let (b_local, mut b_remote) = tokio::io::duplex(1024);
        let (a, a_shutdowns) = CountingStream::new(a_local);
        let (b, b_shutdowns) = CountingStream::new(b_local);

        let task = tokio::spawn(pipe(a, b));
        drop(a_remote);

        // b's peer is still open but the pipe must finish anyway
        let stats = task.await.unwrap();
        assert_eq!(stats, PipeStats::default());
        assert_eq!(a_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(b_shutdowns.load(Ordering::SeqCst), 1);

        let mut rest = Vec::new();
        b_remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
