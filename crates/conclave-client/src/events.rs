//! The callback surfaces an application implements: its identity, event
//! listeners, channel consumers, and the resource manager.
//!
//! Listener callbacks run on fan-out tasks spawned by the inbound handler,
//! never on the connection's reader task — a slow callback delays other
//! callbacks on this client, not protocol traffic.

use std::future::Future;
use std::pin::Pin;

use conclave_core::wire::{Action, ResourceKind};

/// Who this client claims to be, and how it answers a manager's challenge.
pub trait ClientIdentity: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Answer a challenge. The bytes are opaque end to end — the manager
    /// and the client agree on their meaning, the protocol just carries
    /// them.
    fn authenticate(&self, challenge: &[u8]) -> Vec<u8>;
}

/// A named identity that answers every challenge with nothing. Enough for
/// unmanaged resources and managers that do not challenge.
pub struct PlainIdentity {
    name: String,
}

impl PlainIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ClientIdentity for PlainIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn authenticate(&self, _challenge: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

/// Membership events on a session, channel, or the registry. Every method
/// defaults to a no-op; implement the ones the listener's mask selects.
pub trait SessionEvents: Send + Sync + 'static {
    fn joined(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
    fn left(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
    fn invited(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
    fn expelled(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
    fn destroyed(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
}

/// Byte-array events: membership plus value changes.
pub trait ByteArrayEvents: SessionEvents {
    fn value_changed(&self, name: &str, client: &str, value: &[u8]) {
        let _ = (name, client, value);
    }
}

/// Token events: membership plus the token lifecycle.
pub trait TokenEvents: SessionEvents {
    fn released(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
    /// `client` offered the token to `receiver`; the receiver claims it by
    /// grabbing.
    fn given(&self, name: &str, client: &str, receiver: &str) {
        let _ = (name, client, receiver);
    }
    fn requested(&self, name: &str, client: &str) {
        let _ = (name, client);
    }
}

/// Receives channel data. Registered per channel with a delivery mode, not
/// with an event mask.
pub trait ChannelConsumer: Send + Sync + 'static {
    fn data_received(&self, channel: &str, sender: &str, data: &[u8]);
}

/// A privileged operation forwarded by the server for a decision.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub resource: ResourceKind,
    pub name: String,
    pub client: String,
    pub action: Action,
}

/// Boxed decision future; managers often consult something slow.
pub type Decision = Pin<Box<dyn Future<Output = bool> + Send>>;

/// The manager side of deferred authorization. Attach one per resource
/// with `attach_manager`.
pub trait ResourceManager: Send + Sync + 'static {
    /// Admit or deny. Runs on a spawned task.
    fn authorize(&self, request: AuthorizeRequest) -> Decision;

    /// Optional challenge sent to the requesting client before
    /// [`ResourceManager::authorize`] is consulted. `None` skips the
    /// challenge round.
    fn challenge_for(&self, client: &str) -> Option<Vec<u8>> {
        let _ = client;
        None
    }

    /// Check the client's answer to the challenge. A failed check denies
    /// without consulting `authorize`.
    fn verify(&self, client: &str, response: &[u8]) -> bool {
        let _ = (client, response);
        true
    }
}
