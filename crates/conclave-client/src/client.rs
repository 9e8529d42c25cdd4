//! The client connection and its call plumbing.

use std::sync::Arc;
use std::time::Duration;

use conclave_core::config::ProtocolConfig;
use conclave_core::payload::{PayloadReader, PayloadWriter};
use conclave_core::url::SessionUrl;
use conclave_core::wire::{Action, ResourceKind, REGISTRY_SESSION};
use conclave_core::ProtocolError;
use conclave_net::{Connection, DatagramEndpoint, StreamFactory};

use crate::events::ClientIdentity;
use crate::handler::ClientHandler;
use crate::registry::RegistryProxy;
use crate::session::SessionProxy;

/// Shared by every proxy handed out by one client.
pub(crate) struct ClientInner {
    pub(crate) conn: Arc<Connection>,
    pub(crate) handler: Arc<ClientHandler>,
    pub(crate) identity: Arc<dyn ClientIdentity>,
    reply_timeout: Duration,
    /// Bound once by [`ConclaveClient::bind_datagram`]; the local port is
    /// announced when this client registers an unreliable consumer.
    datagram: std::sync::OnceLock<DatagramEndpoint>,
}

impl ClientInner {
    pub(crate) fn name(&self) -> &str {
        self.identity.name()
    }

    pub(crate) fn datagram_port(&self) -> u16 {
        self.datagram
            .get()
            .and_then(|e| e.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub(crate) fn datagram(&self) -> Option<&DatagramEndpoint> {
        self.datagram.get()
    }

    /// One correlated round trip. The reply's leading status is consumed
    /// and turned into a `ProtocolError` when it is not Ok; the returned
    /// reader is positioned at the first result field.
    pub(crate) async fn call(
        &self,
        session: u16,
        resource: ResourceKind,
        action: Action,
        build: impl FnOnce(&mut PayloadWriter),
    ) -> Result<PayloadReader, ProtocolError> {
        let mut w = PayloadWriter::new();
        build(&mut w);
        let reply = self
            .conn
            .call(session, resource, action, w.finish(), self.reply_timeout)
            .await?;
        let mut r = PayloadReader::new(reply.payload);
        r.get_status()?.into_result()?;
        Ok(r)
    }

    /// Token variant: the reply carries a token status after the result
    /// status, on success and on denial alike.
    pub(crate) async fn token_call(
        &self,
        session: u16,
        action: Action,
        build: impl FnOnce(&mut PayloadWriter),
    ) -> Result<conclave_core::TokenStatus, ProtocolError> {
        let mut w = PayloadWriter::new();
        build(&mut w);
        let reply = self
            .conn
            .call(session, ResourceKind::Token, action, w.finish(), self.reply_timeout)
            .await?;
        let mut r = PayloadReader::new(reply.payload);
        let status = r.get_status()?;
        let token_status = r.get_token_status()?;
        status.into_result()?;
        Ok(token_status)
    }
}

/// A connection to a conclave server, with one identity.
pub struct ConclaveClient {
    inner: Arc<ClientInner>,
}

impl ConclaveClient {
    /// Connect over any stream transport.
    pub async fn connect<F: StreamFactory>(
        factory: &F,
        addr: &str,
        identity: Arc<dyn ClientIdentity>,
        protocol: &ProtocolConfig,
    ) -> std::io::Result<Self> {
        let stream = factory.connect(addr).await?;
        let handler = ClientHandler::new(identity.clone());
        let conn = Connection::establish(stream, handler.clone(), "server", None);
        tracing::info!(conn = conn.id(), addr, client = identity.name(), "connected");
        Ok(Self {
            inner: Arc::new(ClientInner {
                conn,
                handler,
                identity,
                reply_timeout: protocol.reply_timeout(),
                datagram: std::sync::OnceLock::new(),
            }),
        })
    }

    /// Bind a local UDP socket for unreliable channel delivery and start
    /// routing its frames. The bound port is announced when this client
    /// registers an unreliable consumer.
    pub async fn bind_datagram(&self, addr: &str) -> std::io::Result<u16> {
        let endpoint = DatagramEndpoint::bind(addr).await?;
        let port = endpoint.local_addr()?.port();
        let _ = self.inner.datagram.set(endpoint.clone());

        let handler = self.inner.handler.clone();
        let conn = self.inner.conn.clone();
        tokio::spawn(async move {
            loop {
                match endpoint.recv().await {
                    Ok((frame, _)) if frame.request_id == 0 => handler.route(&conn, &frame),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "client datagram receive stopped");
                        break;
                    }
                }
            }
        });
        Ok(port)
    }

    pub fn client_name(&self) -> &str {
        self.inner.name()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.conn.is_closed()
    }

    /// Close the connection. The server unwinds everything this client
    /// joined, held, or bound.
    pub fn close(&self) {
        self.inner.conn.close();
    }

    pub fn registry(&self) -> RegistryProxy {
        RegistryProxy::new(self.inner.clone())
    }

    /// Create a session and bind `url` to it.
    pub async fn create_session(&self, url: &SessionUrl) -> Result<SessionProxy, ProtocolError> {
        let mut r = self
            .inner
            .call(REGISTRY_SESSION, ResourceKind::Session, Action::Create, |w| {
                w.put_string(&url.to_string()).put_string(self.inner.name());
            })
            .await?;
        let number = r.get_u16()?;
        Ok(SessionProxy::new(self.inner.clone(), number, url.name.clone()))
    }

    /// Look an existing session up by its URL.
    pub async fn lookup_session(&self, url: &SessionUrl) -> Result<SessionProxy, ProtocolError> {
        let number = self.registry().lookup(url).await?;
        Ok(SessionProxy::new(self.inner.clone(), number, url.name.clone()))
    }
}
