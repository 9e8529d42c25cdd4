//! conclave-net — framed transport and the per-connection correlation
//! engine.
//!
//! A [`Connection`] carries many concurrent logical exchanges over one
//! byte stream: correlated request/reply calls plus unsolicited pushes,
//! demultiplexed by a single reader task per connection.

pub mod connection;
pub mod datagram;
pub mod frame;
pub mod transport;

pub use connection::{Connection, InboundHandler};
pub use datagram::DatagramEndpoint;
pub use transport::{loopback_pair, BoxedStream, LoopbackConnector, LoopbackListener, StreamFactory, TcpFactory};

use conclave_core::wire::WireError;
use conclave_core::ProtocolError;

/// Transport-level failures, distinct from protocol [`ProtocolError`]s.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connection is closed")]
    Closed,

    #[error("a call is already in flight on this connection")]
    Busy,

    #[error("timed out waiting for reply")]
    TimedOut,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<NetError> for ProtocolError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::TimedOut => ProtocolError::TimedOut,
            NetError::Wire(_) | NetError::Io(_) | NetError::Closed | NetError::Busy => {
                ProtocolError::ConnectionFailure
            }
        }
    }
}
