//! Message-oriented WebSocket presented as an ordered byte stream
//!
//! SSH needs a plain `AsyncRead + AsyncWrite` transport. Each write becomes
//! exactly one binary WebSocket message; reads drain the current message
//! and keep the remainder for the next call.
//!
//! Safe for one concurrent reader and one concurrent writer (e.g. after
//! `tokio::io::split`), not for several on the same side.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Byte-stream view over a WebSocket connection
pub struct FrameAdapter<S> {
    /// Underlying WebSocket stream
    inner: S,
    /// Unread tail of the last received message
    leftover: Bytes,
    /// Idle bound on waiting for the next inbound message
    read_timeout: Option<Duration>,
    /// Armed while a read is waiting on the socket
    read_deadline: Option<Pin<Box<Sleep>>>,
    /// Length of the message queued but not yet flushed
    write_in_flight: Option<usize>,
}

impl<S> FrameAdapter<S> {
    /// Wrap a WebSocket stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            leftover: Bytes::new(),
            read_timeout: None,
            read_deadline: None,
            write_in_flight: None,
        }
    }

    /// Fail reads that wait longer than `timeout` for the next message
    ///
    /// Writes are never bounded.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn poll_read_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(timeout) = self.read_timeout else {
            return Poll::Pending;
        };

        let deadline = self
            .read_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));

        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.read_deadline = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "websocket read deadline exceeded",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn into_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for FrameAdapter<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.leftover.is_empty() {
                let n = this.leftover.len().min(buf.remaining());
                buf.put_slice(&this.leftover[..n]);
                this.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }

            let next = match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(next) => {
                    this.read_deadline = None;
                    next
                }
                Poll::Pending => return this.poll_read_deadline(cx),
            };

            match next {
                // A zero-length fill signals EOF
                None => return Poll::Ready(Ok(())),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()))
                }
                Some(Err(e)) => return Poll::Ready(Err(into_io_error(e))),
                Some(Ok(Message::Binary(data))) => this.leftover = Bytes::from(data),
                Some(Ok(Message::Text(text))) => {
                    tracing::warn!("Received non-binary websocket message");
                    this.leftover = Bytes::from(text.into_bytes());
                }
                Some(Ok(Message::Close(_))) => return Poll::Ready(Ok(())),
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
            }
        }
    }
}

impl<S> AsyncWrite for FrameAdapter<S>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.write_in_flight.is_none() {
            ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(into_io_error)?;
            Pin::new(&mut this.inner)
                .start_send(Message::Binary(buf.to_vec()))
                .map_err(into_io_error)?;
            this.write_in_flight = Some(buf.len());
        }

        // The whole message is on the wire before the write is reported
        let flushed = ready!(Pin::new(&mut this.inner).poll_flush(cx));
        let written = this.write_in_flight.take().unwrap_or(buf.len());
        flushed.map_err(into_io_error)?;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(into_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            // Peer already gone
            Err(WsError::Io(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                ) =>
            {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(into_io_error(e))),
        }
    }
}
