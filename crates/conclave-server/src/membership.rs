//! The manageable-resource core: joined clients, listener groups, and the
//! optional manager, shared by byte-arrays, channels, tokens, sessions,
//! and the registry.
//!
//! Listeners are grouped by originating connection so that tearing one
//! connection down removes exactly its listeners in one step, without a
//! scan by listener identity.

use std::collections::HashMap;
use std::sync::Mutex;

use conclave_core::wire::{EventMask, ResourceKind};
use conclave_core::ProtocolError;

#[derive(Debug, Clone, Copy)]
pub struct ListenerEntry {
    pub id: u32,
    pub mask: EventMask,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerRef {
    pub conn_id: u64,
    pub mask: EventMask,
}

#[derive(Debug, Default)]
struct MemberState {
    /// client name -> owning connection.
    clients: HashMap<String, u64>,
    /// connection -> that connection's listeners.
    listeners: HashMap<u64, Vec<ListenerEntry>>,
    next_listener_id: u32,
    manager: Option<ManagerRef>,
}

/// Membership state of one manageable resource.
#[derive(Debug)]
pub struct Membership {
    kind: ResourceKind,
    session: u16,
    name: String,
    state: Mutex<MemberState>,
}

impl Membership {
    pub fn new(kind: ResourceKind, session: u16, name: impl Into<String>) -> Self {
        Self {
            kind,
            session,
            name: name.into(),
            state: Mutex::new(MemberState::default()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Clients ──────────────────────────────────────────────────────────

    /// Add a client. `NameInUse` if the name is already joined.
    pub fn join(&self, client: &str, conn_id: u64) -> Result<(), ProtocolError> {
        let mut s = self.state.lock().expect("membership lock");
        if s.clients.contains_key(client) {
            return Err(ProtocolError::NameInUse);
        }
        s.clients.insert(client.to_string(), conn_id);
        Ok(())
    }

    /// Remove a client. `NoSuchClient` if not joined.
    pub fn leave(&self, client: &str) -> Result<u64, ProtocolError> {
        let mut s = self.state.lock().expect("membership lock");
        s.clients.remove(client).ok_or(ProtocolError::NoSuchClient)
    }

    /// Teardown-path leave: a no-op when the client already left.
    pub fn leave_quiet(&self, client: &str) -> Option<u64> {
        self.state
            .lock()
            .expect("membership lock")
            .clients
            .remove(client)
    }

    pub fn contains(&self, client: &str) -> bool {
        self.state
            .lock()
            .expect("membership lock")
            .clients
            .contains_key(client)
    }

    /// The connection on record for a joined client.
    pub fn client_conn(&self, client: &str) -> Option<u64> {
        self.state
            .lock()
            .expect("membership lock")
            .clients
            .get(client)
            .copied()
    }

    /// Verify the caller is a joined client speaking on the connection it
    /// joined from. An unknown name is a lookup failure; a known name on
    /// the wrong connection is an authorization violation.
    pub fn verify_member(&self, client: &str, conn_id: u64) -> Result<(), ProtocolError> {
        match self.client_conn(client) {
            Some(recorded) if recorded == conn_id => Ok(()),
            Some(_) => Err(ProtocolError::PermissionDenied),
            None => Err(ProtocolError::NoSuchClient),
        }
    }

    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .expect("membership lock")
            .clients
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().expect("membership lock").clients.len()
    }

    /// Clients joined from one connection.
    pub fn conn_clients(&self, conn_id: u64) -> Vec<String> {
        self.state
            .lock()
            .expect("membership lock")
            .clients
            .iter()
            .filter(|(_, &c)| c == conn_id)
            .map(|(name, _)| name.clone())
            .collect()
    }

    // ── Listeners ────────────────────────────────────────────────────────

    pub fn add_listener(&self, conn_id: u64, mask: EventMask) -> u32 {
        let mut s = self.state.lock().expect("membership lock");
        s.next_listener_id += 1;
        let id = s.next_listener_id;
        s.listeners
            .entry(conn_id)
            .or_default()
            .push(ListenerEntry { id, mask });
        id
    }

    pub fn remove_listener(&self, listener_id: u32) -> Result<(), ProtocolError> {
        let mut s = self.state.lock().expect("membership lock");
        for entries in s.listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == listener_id) {
                entries.remove(pos);
                return Ok(());
            }
        }
        Err(ProtocolError::NoSuchListener)
    }

    /// Drop every listener a connection registered, in one step.
    pub fn remove_conn_listeners(&self, conn_id: u64) {
        self.state
            .lock()
            .expect("membership lock")
            .listeners
            .remove(&conn_id);
    }

    /// Connections that should receive an event with the given mask bit:
    /// any connection with a matching listener, plus the manager if its
    /// mask matches. Deduplicated.
    pub fn event_targets(&self, mask_bit: EventMask) -> Vec<u64> {
        let s = self.state.lock().expect("membership lock");
        let mut targets: Vec<u64> = s
            .listeners
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.mask & mask_bit != 0))
            .map(|(&conn, _)| conn)
            .collect();
        if let Some(manager) = &s.manager {
            if manager.mask & mask_bit != 0 {
                targets.push(manager.conn_id);
            }
        }
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    // ── Manager ──────────────────────────────────────────────────────────

    /// At most one manager at a time; the slot reopens if the manager's
    /// connection dies.
    pub fn attach_manager(&self, conn_id: u64, mask: EventMask) -> Result<(), ProtocolError> {
        let mut s = self.state.lock().expect("membership lock");
        if s.manager.is_some() {
            return Err(ProtocolError::ManagerExists);
        }
        s.manager = Some(ManagerRef { conn_id, mask });
        Ok(())
    }

    pub fn manager(&self) -> Option<ManagerRef> {
        self.state.lock().expect("membership lock").manager
    }

    pub fn is_managed(&self) -> bool {
        self.manager().is_some()
    }

    pub fn change_manager_mask(&self, mask: EventMask) -> Result<(), ProtocolError> {
        let mut s = self.state.lock().expect("membership lock");
        match &mut s.manager {
            Some(m) => {
                m.mask = mask;
                Ok(())
            }
            None => Err(ProtocolError::PermissionDenied),
        }
    }

    /// Detach the manager when its connection dies. Pending authorizations
    /// referencing it are failed by the authorize table, not here.
    pub fn drop_manager_conn(&self, conn_id: u64) {
        let mut s = self.state.lock().expect("membership lock");
        if matches!(s.manager, Some(m) if m.conn_id == conn_id) {
            s.manager = None;
        }
    }
}
