//! Data channel: any member may send, registered consumers receive.
//!
//! Consumers pick reliable (stream) or unreliable (datagram) delivery at
//! registration time. The dispatcher fans DATA_RECEIVED out; this module
//! only keeps the consumer set consistent with membership.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use conclave_core::wire::ResourceKind;
use conclave_core::ProtocolError;

use crate::membership::Membership;

#[derive(Debug, Clone)]
pub struct Consumer {
    pub reliable: bool,
    /// Where unreliable data is addressed. Always `Some` for an
    /// unreliable consumer.
    pub datagram: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct ServerChannel {
    pub membership: Membership,
    consumers: Mutex<BTreeMap<String, Consumer>>,
}

impl ServerChannel {
    pub fn new(session: u16, name: impl Into<String>) -> Self {
        Self {
            membership: Membership::new(ResourceKind::Channel, session, name),
            consumers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a member as a consumer. Consuming twice is a name clash,
    /// not an upgrade.
    pub fn add_consumer(
        &self,
        client: &str,
        reliable: bool,
        datagram: Option<SocketAddr>,
    ) -> Result<(), ProtocolError> {
        if !self.membership.contains(client) {
            return Err(ProtocolError::NoSuchClient);
        }
        if !reliable && datagram.is_none() {
            return Err(ProtocolError::InvalidClient);
        }
        let mut consumers = self.consumers.lock().expect("consumers lock");
        if consumers.contains_key(client) {
            return Err(ProtocolError::NameInUse);
        }
        consumers.insert(client.to_string(), Consumer { reliable, datagram });
        Ok(())
    }

    pub fn remove_consumer(&self, client: &str) -> Result<(), ProtocolError> {
        self.consumers
            .lock()
            .expect("consumers lock")
            .remove(client)
            .map(|_| ())
            .ok_or(ProtocolError::NoSuchClient)
    }

    pub fn is_consumer(&self, client: &str) -> bool {
        self.consumers
            .lock()
            .expect("consumers lock")
            .contains_key(client)
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers
            .lock()
            .expect("consumers lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot for a send fan-out, minus the sender itself (a sender that
    /// also consumes does not hear its own data echoed back).
    pub fn consumers_except(&self, sender: &str) -> Vec<(String, Consumer)> {
        self.consumers
            .lock()
            .expect("consumers lock")
            .iter()
            .filter(|(name, _)| name.as_str() != sender)
            .map(|(name, c)| (name.clone(), c.clone()))
            .collect()
    }

    /// Connection-loss path: drop the consumer registration silently.
    pub fn remove_consumer_quiet(&self, client: &str) {
        self.consumers.lock().expect("consumers lock").remove(client);
    }
}
