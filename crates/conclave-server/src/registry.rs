//! The naming registry: session-URL bindings, scoped to session number 0.
//!
//! The registry is itself a manageable resource — clients join it, a
//! manager may vet binds and joins — so it carries the same membership
//! core as every session resource.

use dashmap::DashMap;

use conclave_core::url::SessionUrl;
use conclave_core::wire::{ResourceKind, REGISTRY_SESSION};
use conclave_core::ProtocolError;

use crate::membership::Membership;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub url: String,
    pub session: u16,
    /// Connection that bound the name; bindings die with their binder.
    pub owner_conn: u64,
}

pub struct Registry {
    pub membership: Membership,
    /// Keyed by the URL's normalized binding key, not its literal text, so
    /// `conclave://localhost/x` and `conclave://127.0.0.1/x` collide.
    bindings: DashMap<String, Binding>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            membership: Membership::new(ResourceKind::Registry, REGISTRY_SESSION, "registry"),
            bindings: DashMap::new(),
        }
    }

    pub fn bind(&self, url: &SessionUrl, session: u16, owner_conn: u64) -> Result<(), ProtocolError> {
        match self.bindings.entry(url.binding_key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ProtocolError::AlreadyBound),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Binding {
                    url: url.to_string(),
                    session,
                    owner_conn,
                });
                Ok(())
            }
        }
    }

    /// Only the binder may unbind.
    pub fn unbind(&self, url: &SessionUrl, conn_id: u64) -> Result<Binding, ProtocolError> {
        let key = url.binding_key();
        let owned_by_caller = {
            let entry = self.bindings.get(&key).ok_or(ProtocolError::NotBound)?;
            entry.owner_conn == conn_id
        };
        if !owned_by_caller {
            return Err(ProtocolError::PermissionDenied);
        }
        self.bindings
            .remove_if(&key, |_, b| b.owner_conn == conn_id)
            .map(|(_, b)| b)
            .ok_or(ProtocolError::NotBound)
    }

    pub fn lookup(&self, url: &SessionUrl) -> Result<Binding, ProtocolError> {
        self.bindings
            .get(&url.binding_key())
            .map(|e| e.value().clone())
            .ok_or(ProtocolError::NotBound)
    }

    pub fn exists(&self, url: &SessionUrl) -> bool {
        self.bindings.contains_key(&url.binding_key())
    }

    pub fn bound_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.bindings.iter().map(|e| e.url.clone()).collect();
        urls.sort();
        urls
    }

    /// Connection-loss path: drop everything the departed connection had
    /// bound, returning the orphaned bindings for session teardown.
    pub fn remove_owned(&self, conn_id: u64) -> Vec<Binding> {
        let keys: Vec<String> = self
            .bindings
            .iter()
            .filter(|e| e.owner_conn == conn_id)
            .map(|e| e.key().clone())
            .collect();
        let mut removed: Vec<Binding> = keys
            .into_iter()
            .filter_map(|k| self.bindings.remove(&k).map(|(_, b)| b))
            .collect();
        removed.sort_by(|a, b| a.url.cmp(&b.url));
        removed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
