//! Global requests over a framed control stream
//!
//! Each side of a tunnel opens one control stream next to its logical
//! streams. Requests carry a kind and an opaque payload; requests with
//! `want_reply` receive exactly one reply correlated by request id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use ferry_protocol::{Frame, FrameCodec, Message, RequestId};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::ControlError;

/// Capacity of the inbound and outbound frame queues
const CONTROL_QUEUE_CAPACITY: usize = 64;

/// Reply to a global request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalReply {
    /// Whether the peer accepted the request
    pub ok: bool,
    /// Reply payload
    pub payload: Bytes,
}

impl GlobalReply {
    /// Negative reply with no payload
    pub fn failure() -> Self {
        Self::default()
    }
}

/// A global request received from the peer
///
/// If the peer wants a reply and none is sent, dropping the request
/// answers it with `ok = false`.
#[derive(Debug)]
pub struct GlobalRequest {
    /// Request kind
    pub kind: String,
    /// Request payload
    pub payload: Bytes,
    responder: Option<oneshot::Sender<GlobalReply>>,
}

impl GlobalRequest {
    /// Answer the request; a no-op if the peer did not ask for a reply
    pub fn reply(mut self, ok: bool, payload: Bytes) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(GlobalReply { ok, payload });
        }
    }
}

impl Drop for GlobalRequest {
    fn drop(&mut self) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(GlobalReply::failure());
        }
    }
}

/// Sending side of a control channel
#[derive(Clone)]
pub struct ControlHandle {
    outbound: mpsc::Sender<Frame>,
    pending: Arc<DashMap<u32, oneshot::Sender<GlobalReply>>>,
    next_id: Arc<AtomicU32>,
    closed: CancellationToken,
}

impl ControlHandle {
    /// Send a request and wait for the peer's reply
    pub async fn request(&self, kind: &str, payload: Bytes) -> Result<GlobalReply, ControlError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = Frame::new(RequestId::new(id), Message::request(kind, true, payload));
        if self.outbound.send(frame).await.is_err() {
            self.pending.remove(&id);
            return Err(ControlError::Closed);
        }

        tokio::select! {
            reply = rx => reply.map_err(|_| ControlError::Closed),
            _ = self.closed.cancelled() => {
                self.pending.remove(&id);
                Err(ControlError::Closed)
            }
        }
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != RequestId::UNSOLICITED.as_u32() {
                return id;
            }
        }
    }

    fn dispatch(&self, frame: Frame, incoming: &mpsc::Sender<GlobalRequest>) {
        let request_id = frame.request_id;

        match frame.message {
            Message::Reply { ok, payload } => match self.pending.remove(&request_id.as_u32()) {
                Some((_, tx)) => {
                    let _ = tx.send(GlobalReply { ok, payload });
                }
                None => tracing::warn!("Dropping reply for unknown {}", request_id),
            },
            Message::Request {
                kind,
                want_reply,
                payload,
            } => {
                let responder = want_reply.then(|| {
                    let (tx, rx) = oneshot::channel::<GlobalReply>();
                    let outbound = self.outbound.clone();
                    tokio::spawn(
                        async move {
                            if let Ok(reply) = rx.await {
                                let frame =
                                    Frame::new(request_id, Message::reply(reply.ok, reply.payload));
                                let _ = outbound.send(frame).await;
                            }
                        }
                        .in_current_span(),
                    );
                    tx
                });

                let request = GlobalRequest {
                    kind,
                    payload,
                    responder,
                };

                // A full or abandoned queue drops the request, which answers it negatively
                if let Err(e) = incoming.try_send(request) {
                    tracing::warn!("Discarding global request: {}", e);
                }
            }
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        self.pending.clear();
    }
}

/// Start a control channel over `stream`
///
/// Returns the sending handle, the queue of requests sent by the peer, and
/// the driver task. The driver resolves to `Ok(())` when the peer closes the
/// stream cleanly and to an error on I/O or framing failures.
pub fn spawn_control<S>(
    stream: S,
) -> (
    ControlHandle,
    mpsc::Receiver<GlobalRequest>,
    JoinHandle<Result<(), ControlError>>,
)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(read_half, FrameCodec::new());
    let mut frames_out = FramedWrite::new(write_half, FrameCodec::new());

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(CONTROL_QUEUE_CAPACITY);
    let (incoming_tx, incoming_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

    let handle = ControlHandle {
        outbound: outbound_tx,
        pending: Arc::new(DashMap::new()),
        next_id: Arc::new(AtomicU32::new(1)),
        closed: CancellationToken::new(),
    };

    let driver = handle.clone();
    let task = tokio::spawn(
        async move {
            let result = loop {
                tokio::select! {
                    frame = frames_in.next() => match frame {
                        None => break Ok(()),
                        Some(Err(e)) => break Err(ControlError::from(e)),
                        Some(Ok(frame)) => driver.dispatch(frame, &incoming_tx),
                    },
                    Some(frame) = outbound_rx.recv() => {
                        if let Err(e) = frames_out.send(frame).await {
                            break Err(ControlError::from(e));
                        }
                    }
                }
            };

            driver.shutdown();
            let _ = frames_out.close().await;
            tracing::debug!("Control channel closed");
            result
        }
        .in_current_span(),
    );

    (handle, incoming_rx, task)
}
