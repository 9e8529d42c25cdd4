//! Fire-and-forget datagram path for unreliable channels.
//!
//! Same 13-byte header as the stream transport, one frame per datagram, no
//! length prefix and no correlation — a lost or reordered datagram is the
//! channel's stated service level.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use conclave_core::wire::Frame;

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Clone)]
pub struct DatagramEndpoint {
    socket: Arc<UdpSocket>,
}

impl DatagramEndpoint {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_to(&self, frame: &Frame, addr: SocketAddr) -> std::io::Result<()> {
        let body = frame.encode();
        self.socket.send_to(&body, addr).await?;
        Ok(())
    }

    /// Receive the next well-formed frame. Malformed datagrams are logged
    /// and skipped — there is nobody to report them to.
    pub async fn recv(&self) -> std::io::Result<(Frame, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match Frame::decode(bytes::Bytes::copy_from_slice(&buf[..len])) {
                Ok(frame) => return Ok((frame, from)),
                Err(e) => {
                    tracing::debug!(from = %from, error = %e, "dropping malformed datagram");
                }
            }
        }
    }
}
