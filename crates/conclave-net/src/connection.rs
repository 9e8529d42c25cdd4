//! One multiplexed connection: a single reader task, a write path, and a
//! single-slot correlation rendezvous.
//!
//! A connection carries at most one outstanding synchronous call at a
//! time. The reader compares every inbound frame against the installed
//! correlation key: a match is handed to the suspended caller, and the
//! reader does not read again until the caller has taken the reply —
//! matched-reply delivery strictly precedes any further dispatch on that
//! connection. Every other frame is dispatched to the [`InboundHandler`]
//! on the reader task itself; handlers spawn workers for anything slow.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex, Notify};

use conclave_core::wire::{Action, CorrelationKey, Frame, ResourceKind};

use crate::frame::{read_frame, write_frame};
use crate::transport::BoxedStream;
use crate::NetError;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Receives frames the correlation engine does not claim, plus the close
/// notification that drives membership cleanup.
pub trait InboundHandler: Send + Sync + 'static {
    /// An unsolicited inbound request or notification. Runs on the
    /// connection's reader task — frames on one connection are handled in
    /// arrival order.
    fn on_frame(&self, conn: Arc<Connection>, frame: Frame) -> impl Future<Output = ()> + Send;

    /// The connection is gone: I/O failure, protocol terminate, or
    /// explicit close. Called exactly once.
    fn on_closed(&self, conn: Arc<Connection>) -> impl Future<Output = ()> + Send;
}

struct PendingCall {
    key: CorrelationKey,
    reply: oneshot::Sender<MatchedReply>,
}

/// A reply handed to a suspended caller. Taking it resumes the reader.
pub struct MatchedReply {
    frame: Frame,
    resume: oneshot::Sender<()>,
}

impl MatchedReply {
    fn take(self) -> Frame {
        let _ = self.resume.send(());
        self.frame
    }
}

pub struct Connection {
    id: u64,
    label: String,
    peer_addr: Option<SocketAddr>,
    /// `None` once the close cascade has shut the write half down.
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    pending: StdMutex<Option<PendingCall>>,
    next_request: AtomicU32,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    /// Wrap an established stream and spawn its reader task.
    pub fn establish<H: InboundHandler>(
        stream: BoxedStream,
        handler: Arc<H>,
        label: impl Into<String>,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<Connection> {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Arc::new(Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            peer_addr,
            writer: Mutex::new(Some(write_half)),
            pending: StdMutex::new(None),
            next_request: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        tokio::spawn(reader_loop(conn.clone(), read_half, handler));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Peer address, when the transport has one (TCP). Loopback has none.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the reader task to shut the connection down. The close cascade
    /// (pending-caller wakeup, handler notification) runs on the reader
    /// task.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Send a correlated request and suspend until the matching reply
    /// arrives, the timeout elapses, or the connection fails.
    ///
    /// At most one call may be in flight per connection; a second
    /// concurrent caller gets [`NetError::Busy`]. A timeout releases the
    /// caller but leaves the key installed — the late reply is drained and
    /// discarded by the reader when it eventually arrives.
    pub async fn call(
        &self,
        session: u16,
        resource: ResourceKind,
        action: Action,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Frame, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let key = CorrelationKey::pack(request_id, session, resource, action);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().expect("pending lock");
            if slot.is_some() {
                return Err(NetError::Busy);
            }
            *slot = Some(PendingCall {
                key,
                reply: reply_tx,
            });
        }

        let frame = Frame::new(session, request_id, resource, action, payload);
        if let Err(e) = self.send(&frame).await {
            // The request never went out; nothing will match the key.
            self.pending.lock().expect("pending lock").take();
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(matched)) => Ok(matched.take()),
            // Sender dropped: the connection was torn down under us.
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => {
                tracing::debug!(
                    conn = self.id,
                    request_id,
                    "call timed out; key stays installed to drain the late reply"
                );
                Err(NetError::TimedOut)
            }
        }
    }

    /// Uncorrelated write: replies and server pushes.
    pub async fn send(&self, frame: &Frame) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(NetError::Closed);
        };
        match write_frame(w, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(writer);
                // Writer failure kills the whole connection; the reader
                // may be idle so it must be told.
                self.close();
                Err(e)
            }
        }
    }

    /// Shut the write half down and drop it so the peer observes EOF.
    async fn shutdown_writer(&self) {
        let taken = self.writer.lock().await.take();
        if let Some(mut w) = taken {
            let _ = w.shutdown().await;
        }
    }

    /// Take the pending call if `frame` matches its key.
    fn try_match(&self, frame: &Frame) -> Option<PendingCall> {
        let key = CorrelationKey::of(frame);
        let mut slot = self.pending.lock().expect("pending lock");
        match slot.as_ref() {
            Some(pending) if pending.key == key => slot.take(),
            _ => None,
        }
    }

    /// Mark closed; returns true for the caller that performed the
    /// transition. Dropping the pending call wakes a suspended caller
    /// with a connection failure.
    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.pending.lock().expect("pending lock").take();
        }
        first
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn reader_loop<H: InboundHandler>(
    conn: Arc<Connection>,
    mut reader: ReadHalf<BoxedStream>,
    handler: Arc<H>,
) {
    loop {
        tokio::select! {
            _ = conn.shutdown.notified() => {
                tracing::debug!(conn = conn.id, label = %conn.label, "connection close requested");
                break;
            }

            result = read_frame(&mut reader) => match result {
                Ok(Some(frame)) => {
                    if let Some(pending) = conn.try_match(&frame) {
                        let (resume_tx, resume_rx) = oneshot::channel();
                        let delivered = pending
                            .reply
                            .send(MatchedReply { frame, resume: resume_tx })
                            .is_ok();
                        if delivered {
                            // Block further reads until the caller takes
                            // the reply.
                            let _ = resume_rx.await;
                        } else {
                            tracing::trace!(conn = conn.id, "late reply for abandoned call discarded");
                        }
                    } else {
                        handler.on_frame(conn.clone(), frame).await;
                    }
                }
                Ok(None) => {
                    tracing::debug!(conn = conn.id, label = %conn.label, "peer closed the stream");
                    break;
                }
                Err(e) => {
                    tracing::warn!(conn = conn.id, label = %conn.label, error = %e, "read failed");
                    break;
                }
            }
        }
    }

    // Tear the write half down first so the peer reads EOF and runs its
    // own cleanup even while handles to this connection stay alive.
    conn.shutdown_writer().await;
    if conn.mark_closed() {
        handler.on_closed(conn.clone()).await;
    }
}
