//! One hosted session: its own membership plus named tables of
//! byte-arrays, channels, and tokens.
//!
//! The connection index tracks which resources each connection has ever
//! touched, so that losing a connection walks only its own footprint
//! instead of every resource in the session. Entries are insert-only and
//! may go stale (a client can leave politely first); the cleanup path
//! tolerates that with quiet, idempotent removals.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use conclave_core::wire::ResourceKind;
use conclave_core::ProtocolError;

use crate::bytearray::ServerByteArray;
use crate::channel::ServerChannel;
use crate::membership::Membership;
use crate::token::ServerToken;

#[derive(Debug)]
pub struct ServerSession {
    pub number: u16,
    pub url: String,
    pub membership: Membership,
    byte_arrays: DashMap<String, Arc<ServerByteArray>>,
    channels: DashMap<String, Arc<ServerChannel>>,
    tokens: DashMap<String, Arc<ServerToken>>,
    conn_index: DashMap<u64, HashSet<(ResourceKind, String)>>,
}

impl ServerSession {
    pub fn new(number: u16, url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            number,
            url: url.into(),
            membership: Membership::new(ResourceKind::Session, number, name),
            byte_arrays: DashMap::new(),
            channels: DashMap::new(),
            tokens: DashMap::new(),
            conn_index: DashMap::new(),
        }
    }

    // ── resource creation ────────────────────────────────────────────────

    /// Create-or-get: a second create of the same name yields the existing
    /// resource untouched. Returns whether this call created it.
    pub fn create_byte_array(&self, name: &str, initial: bytes::Bytes) -> (Arc<ServerByteArray>, bool) {
        match self.byte_arrays.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let ba = Arc::new(ServerByteArray::new(self.number, name, initial));
                e.insert(ba.clone());
                (ba, true)
            }
        }
    }

    pub fn create_channel(&self, name: &str) -> (Arc<ServerChannel>, bool) {
        match self.channels.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let ch = Arc::new(ServerChannel::new(self.number, name));
                e.insert(ch.clone());
                (ch, true)
            }
        }
    }

    pub fn create_token(&self, name: &str) -> (Arc<ServerToken>, bool) {
        match self.tokens.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let tok = Arc::new(ServerToken::new(self.number, name));
                e.insert(tok.clone());
                (tok, true)
            }
        }
    }

    // ── lookup ───────────────────────────────────────────────────────────

    pub fn byte_array(&self, name: &str) -> Result<Arc<ServerByteArray>, ProtocolError> {
        self.byte_arrays
            .get(name)
            .map(|e| e.value().clone())
            .ok_or(ProtocolError::NoSuchByteArray)
    }

    pub fn channel(&self, name: &str) -> Result<Arc<ServerChannel>, ProtocolError> {
        self.channels
            .get(name)
            .map(|e| e.value().clone())
            .ok_or(ProtocolError::NoSuchChannel)
    }

    pub fn token(&self, name: &str) -> Result<Arc<ServerToken>, ProtocolError> {
        self.tokens
            .get(name)
            .map(|e| e.value().clone())
            .ok_or(ProtocolError::NoSuchToken)
    }

    /// Membership of any resource in the session, by kind and name.
    pub fn resource_membership(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Arc<dyn AsMembership>, ProtocolError> {
        match kind {
            ResourceKind::ByteArray => Ok(self.byte_array(name)?),
            ResourceKind::Channel => Ok(self.channel(name)?),
            ResourceKind::Token => Ok(self.token(name)?),
            _ => Err(ProtocolError::InvalidClient),
        }
    }

    pub fn byte_array_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.byte_arrays.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn token_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tokens.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ── destruction ──────────────────────────────────────────────────────

    pub fn destroy_byte_array(&self, name: &str) -> Result<Arc<ServerByteArray>, ProtocolError> {
        self.byte_arrays
            .remove(name)
            .map(|(_, ba)| ba)
            .ok_or(ProtocolError::NoSuchByteArray)
    }

    pub fn destroy_channel(&self, name: &str) -> Result<Arc<ServerChannel>, ProtocolError> {
        self.channels
            .remove(name)
            .map(|(_, ch)| ch)
            .ok_or(ProtocolError::NoSuchChannel)
    }

    pub fn destroy_token(&self, name: &str) -> Result<Arc<ServerToken>, ProtocolError> {
        self.tokens
            .remove(name)
            .map(|(_, tok)| tok)
            .ok_or(ProtocolError::NoSuchToken)
    }

    /// Drain every resource for session teardown, in a stable order.
    pub fn drain_resources(&self) -> Vec<Arc<dyn AsMembership>> {
        let mut out: Vec<Arc<dyn AsMembership>> = Vec::new();
        let mut names: Vec<String> = self.byte_arrays.iter().map(|e| e.key().clone()).collect();
        names.sort();
        for n in names {
            if let Some((_, ba)) = self.byte_arrays.remove(&n) {
                out.push(ba);
            }
        }
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        for n in names {
            if let Some((_, ch)) = self.channels.remove(&n) {
                out.push(ch);
            }
        }
        let mut names: Vec<String> = self.tokens.iter().map(|e| e.key().clone()).collect();
        names.sort();
        for n in names {
            if let Some((_, tok)) = self.tokens.remove(&n) {
                out.push(tok);
            }
        }
        out
    }

    // ── connection index ─────────────────────────────────────────────────

    pub fn touch(&self, conn_id: u64, kind: ResourceKind, name: &str) {
        self.conn_index
            .entry(conn_id)
            .or_default()
            .insert((kind, name.to_string()));
    }

    /// Take a connection's footprint for teardown; sorted for
    /// deterministic event order.
    pub fn take_footprint(&self, conn_id: u64) -> Vec<(ResourceKind, String)> {
        let mut refs: Vec<_> = self
            .conn_index
            .remove(&conn_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        refs.sort();
        refs
    }
}

/// The one seam the teardown cascade needs: every resource exposes its
/// membership uniformly.
pub trait AsMembership: Send + Sync {
    fn membership(&self) -> &Membership;
    fn token(&self) -> Option<&ServerToken> {
        None
    }
    fn channel(&self) -> Option<&ServerChannel> {
        None
    }
}

impl AsMembership for ServerByteArray {
    fn membership(&self) -> &Membership {
        &self.membership
    }
}

impl AsMembership for ServerChannel {
    fn membership(&self) -> &Membership {
        &self.membership
    }
    fn channel(&self) -> Option<&ServerChannel> {
        Some(self)
    }
}

impl AsMembership for ServerToken {
    fn membership(&self) -> &Membership {
        &self.membership
    }
    fn token(&self) -> Option<&ServerToken> {
        Some(self)
    }
}
