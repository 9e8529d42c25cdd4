//! The pluggable byte-stream seam.
//!
//! The protocol core only needs "give me a byte stream to this address".
//! TCP is the production implementation; the in-process loopback serves
//! tests and embedded single-process deployments. A TLS factory would plug
//! in here the same way.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Any bidirectional byte stream the framing layer can drive.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Creates byte-stream connections. One implementation per transport.
pub trait StreamFactory: Send + Sync + 'static {
    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<BoxedStream>> + Send;
}

// ── TCP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFactory;

impl StreamFactory for TcpFactory {
    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<BoxedStream>> + Send {
        let addr = addr.to_string();
        async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        }
    }
}

// ── In-process loopback ──────────────────────────────────────────────────────

/// Buffer size of each loopback pipe.
const LOOPBACK_BUF: usize = 256 * 1024;

/// Connect side of an in-process transport. Cloneable; every `connect`
/// hands the listener the server end of a fresh duplex pipe.
#[derive(Clone)]
pub struct LoopbackConnector {
    tx: mpsc::UnboundedSender<BoxedStream>,
}

/// Accept side of an in-process transport.
pub struct LoopbackListener {
    rx: mpsc::UnboundedReceiver<BoxedStream>,
}

/// A connected loopback transport pair.
pub fn loopback_pair() -> (LoopbackConnector, LoopbackListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LoopbackConnector { tx }, LoopbackListener { rx })
}

impl StreamFactory for LoopbackConnector {
    fn connect(&self, _addr: &str) -> impl Future<Output = io::Result<BoxedStream>> + Send {
        let tx = self.tx.clone();
        async move {
            let (client, server) = tokio::io::duplex(LOOPBACK_BUF);
            tx.send(Box::new(server) as BoxedStream)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
            Ok(Box::new(client) as BoxedStream)
        }
    }
}

impl LoopbackListener {
    /// Next inbound stream, or `None` once every connector is dropped.
    pub async fn accept(&mut self) -> Option<BoxedStream> {
        self.rx.recv().await
    }
}
