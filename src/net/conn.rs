//! Per-connection transport adapter.
//!
//! One WebSocket connection gets a bounded command queue drained by a single
//! writer task; sessions enqueue encoded frames without blocking. Queue
//! overflow force-closes the connection (close code 1009) rather than
//! buffering without bound. The adapter holds no RPC state.

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Orderly shutdown (replaced connection, evicted session).
pub(crate) const CLOSE_NORMAL: u16 = 1000;
/// Protocol violation on the wire (bad frame).
pub(crate) const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Outbound queue overflowed.
pub(crate) const CLOSE_OVERFLOW: u16 = 1009;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) enum ConnCommand {
    Frame(Bytes),
    Close { code: u16, reason: &'static str },
}

/// Cheap handle to a connection's writer task.
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    id: u64,
    tx: mpsc::Sender<ConnCommand>,
    force_close: Arc<Notify>,
}

impl Connection {
    /// Create a connection handle plus the receiver its writer task drains.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<ConnCommand>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(depth);
        let force_close = Arc::new(Notify::new());
        let conn = Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            force_close: force_close.clone(),
        };
        (conn, rx, force_close)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue an encoded frame. Never blocks; a full queue force-closes the
    /// connection instead.
    pub fn send_frame(&self, frame: Bytes) {
        match self.tx.try_send(ConnCommand::Frame(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = self.id, "send queue overflow, closing connection");
                // notify_one stores a permit, so the writer sees this even
                // if it has not reached its select yet.
                self.force_close.notify_one();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn = self.id, "send on closed connection dropped");
            }
        }
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        if self
            .tx
            .try_send(ConnCommand::Close { code, reason })
            .is_err()
        {
            self.force_close.notify_one();
        }
    }
}

/// Single writer per connection: drains queued commands into the sink until
/// a close is requested, the peer goes away, or overflow forces shutdown.
pub(crate) async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ConnCommand>,
    force_close: Arc<Notify>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ConnCommand::Frame(frame)) => {
                    if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(ConnCommand::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            () = force_close.notified() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(CLOSE_OVERFLOW),
                        reason: "send queue overflow".into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
