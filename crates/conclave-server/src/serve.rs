//! Accept loops: TCP for deployments, the in-process loopback for tests,
//! and the inbound datagram task.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use conclave_core::payload::PayloadReader;
use conclave_core::wire::{Action, Frame, ResourceKind};
use conclave_net::transport::LoopbackListener;
use conclave_net::{BoxedStream, Connection, DatagramEndpoint};

use crate::dispatch::ServerHandler;

/// Bind and run the stream accept loop until shutdown.
pub async fn serve_tcp(
    handler: Arc<ServerHandler>,
    addr: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening for stream connections");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let boxed: BoxedStream = Box::new(stream);
                let conn = Connection::establish(boxed, handler.clone(), "client", Some(peer));
                tracing::info!(conn = conn.id(), peer = %peer, "connection accepted");
                handler.state().connections.register(conn);
            }
        }
    }

    handler.state().connections.close_all();
    Ok(())
}

/// Accept loop over the in-process loopback transport. Same handler path
/// as TCP; connections just have no peer address.
pub async fn serve_loopback(
    handler: Arc<ServerHandler>,
    mut listener: LoopbackListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                let Some(stream) = accepted else { break };
                let conn = Connection::establish(stream, handler.clone(), "loopback", None);
                tracing::debug!(conn = conn.id(), "loopback connection accepted");
                handler.state().connections.register(conn);
            }
        }
    }
    handler.state().connections.close_all();
}

/// Inbound datagram task. The only traffic accepted is unreliable channel
/// sends; a datagram carries no connection identity, so the sender name is
/// taken at face value — that is the unreliable channel's service level.
pub async fn serve_datagram(
    handler: Arc<ServerHandler>,
    endpoint: DatagramEndpoint,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            received = endpoint.recv() => {
                match received {
                    Ok((frame, from)) => handler.handle_datagram(frame, from).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "datagram receive failed");
                        break;
                    }
                }
            }
        }
    }
}

impl ServerHandler {
    /// One inbound datagram: an unreliable channel send, fanned out like
    /// its stream counterpart but never answered.
    pub async fn handle_datagram(&self, frame: Frame, from: std::net::SocketAddr) {
        if frame.resource != ResourceKind::Channel
            || frame.action != Action::Send
            || frame.request_id != 0
        {
            tracing::debug!(%from, resource = %frame.resource, action = ?frame.action, "unexpected datagram dropped");
            return;
        }
        let mut r = PayloadReader::new(frame.payload.clone());
        let parsed = (|| -> Result<_, conclave_core::wire::WireError> {
            let name = r.get_string()?;
            let sender = r.get_string()?;
            let data = r.get_bytes()?;
            Ok((name, sender, data))
        })();
        let Ok((name, sender, data)) = parsed else {
            tracing::debug!(%from, "malformed channel datagram dropped");
            return;
        };
        if let Err(e) = self.fan_out_channel_data(frame.session, &name, &sender, data).await {
            tracing::debug!(%from, session = frame.session, name, sender, error = %e, "channel datagram not delivered");
        }
    }
}
