//! Process-wide server state shared by every connection handler.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use conclave_core::config::ConclaveConfig;
use conclave_core::url::SessionUrl;
use conclave_core::wire::REGISTRY_SESSION;
use conclave_core::ProtocolError;
use conclave_net::DatagramEndpoint;

use crate::authorize::AuthTable;
use crate::connections::Connections;
use crate::registry::Registry;
use crate::session::ServerSession;

pub struct ServerState {
    pub config: ConclaveConfig,
    pub connections: Connections,
    pub registry: Registry,
    pub pending_auth: AuthTable,
    sessions: DashMap<u16, Arc<ServerSession>>,
    next_session: AtomicU16,
    datagram: OnceLock<DatagramEndpoint>,
}

impl ServerState {
    pub fn new(config: ConclaveConfig) -> Arc<Self> {
        let queue_depth = config.protocol.max_pending_events;
        Arc::new(Self {
            config,
            connections: Connections::new(queue_depth),
            registry: Registry::new(),
            pending_auth: AuthTable::new(),
            sessions: DashMap::new(),
            next_session: AtomicU16::new(1),
            datagram: OnceLock::new(),
        })
    }

    /// Install the UDP endpoint once at boot. Unreliable channel delivery
    /// is disabled until this is called.
    pub fn set_datagram(&self, endpoint: DatagramEndpoint) {
        let _ = self.datagram.set(endpoint);
    }

    pub fn datagram(&self) -> Option<&DatagramEndpoint> {
        self.datagram.get()
    }

    pub fn session(&self, number: u16) -> Result<Arc<ServerSession>, ProtocolError> {
        if number == REGISTRY_SESSION {
            return Err(ProtocolError::NoSuchSession);
        }
        self.sessions
            .get(&number)
            .map(|e| e.value().clone())
            .ok_or(ProtocolError::NoSuchSession)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a session and bind its URL in one step. The binding is the
    /// session's public identity; if the URL is taken the session is not
    /// created.
    pub fn create_session(
        &self,
        url: &SessionUrl,
        owner_conn: u64,
    ) -> Result<(u16, Arc<ServerSession>), ProtocolError> {
        let number = self.allocate_session_number()?;
        let session = Arc::new(ServerSession::new(number, url.to_string(), url.name.clone()));
        self.sessions.insert(number, session.clone());
        if let Err(err) = self.registry.bind(url, number, owner_conn) {
            self.sessions.remove(&number);
            return Err(err);
        }
        Ok((number, session))
    }

    /// Tear a session out of the tables. The caller owns event fan-out and
    /// resource draining; this only unlinks.
    pub fn remove_session(&self, number: u16) -> Result<Arc<ServerSession>, ProtocolError> {
        let (_, session) = self
            .sessions
            .remove(&number)
            .ok_or(ProtocolError::NoSuchSession)?;
        // Unbind whatever URL still points here.
        if let Ok(url) = SessionUrl::parse(&session.url) {
            if let Ok(binding) = self.registry.lookup(&url) {
                if binding.session == number {
                    let _ = self.registry.unbind(&url, binding.owner_conn);
                }
            }
        }
        Ok(session)
    }

    /// Sessions a departed connection has touched, for the teardown walk.
    pub fn sessions_snapshot(&self) -> Vec<Arc<ServerSession>> {
        let mut all: Vec<Arc<ServerSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.number);
        all
    }

    fn allocate_session_number(&self) -> Result<u16, ProtocolError> {
        // Wraps past u16::MAX, skipping 0 and live numbers. Bails once the
        // space is exhausted rather than spinning.
        for _ in 0..=u16::MAX as u32 {
            let n = self.next_session.fetch_add(1, Ordering::Relaxed);
            if n != REGISTRY_SESSION && !self.sessions.contains_key(&n) {
                return Ok(n);
            }
        }
        Err(ProtocolError::NoSuchSession)
    }
}
