//! Deferred authorization: privileged requests parked while the manager
//! decides.
//!
//! Each pending entry is completed exactly once, by whichever comes
//! first: the manager's decision, the manager's connection dying, the
//! requester's connection dying, or the sweep timing it out. The table
//! hands the entry out by value; the caller finishes the request.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use conclave_core::wire::{Action, Frame, ResourceKind};
use conclave_core::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthKey {
    pub session: u16,
    pub kind: ResourceKind,
    pub name: String,
    pub client: String,
}

#[derive(Debug)]
pub struct PendingAuth {
    /// Connection waiting on the parked request.
    pub requester_conn: u64,
    /// The original request, replayed against the dispatcher on accept
    /// and answered with a status on deny.
    pub request: Frame,
    /// The action the manager was asked about; a decision naming a
    /// different action does not resolve this entry.
    pub action: Action,
    pub manager_conn: u64,
    created: Instant,
}

impl PendingAuth {
    pub fn new(requester_conn: u64, request: Frame, action: Action, manager_conn: u64) -> Self {
        Self {
            requester_conn,
            request,
            action,
            manager_conn,
            created: Instant::now(),
        }
    }
}

#[derive(Default)]
pub struct AuthTable {
    pending: DashMap<AuthKey, PendingAuth>,
}

impl AuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request. A second privileged request for the same client and
    /// resource while one is pending is refused outright.
    pub fn insert(&self, key: AuthKey, pending: PendingAuth) -> Result<(), ProtocolError> {
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ProtocolError::AuthorizationInProgress)
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(pending);
                Ok(())
            }
        }
    }

    /// Take the entry a manager decision names. `None` when nothing is
    /// pending under that key or the decision's action does not match
    /// (stale or confused manager — the entry stays parked).
    pub fn resolve(&self, key: &AuthKey, action: Action) -> Option<PendingAuth> {
        self.pending
            .remove_if(key, |_, p| p.action == action)
            .map(|(_, p)| p)
    }

    /// Look up the two ends of a pending entry without resolving it —
    /// challenge/authenticate traffic is routed through here while the
    /// decision is still open.
    pub fn peek(&self, key: &AuthKey) -> Option<(u64, u64)> {
        self.pending
            .get(key)
            .map(|p| (p.requester_conn, p.manager_conn))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Manager connection died: everything it was deciding fails back to
    /// the requesters.
    pub fn take_for_manager(&self, conn_id: u64) -> Vec<PendingAuth> {
        self.take_where(|p| p.manager_conn == conn_id)
    }

    /// Requester connection died: its parked requests have nobody left to
    /// answer.
    pub fn take_for_requester(&self, conn_id: u64) -> Vec<PendingAuth> {
        self.take_where(|p| p.requester_conn == conn_id)
    }

    /// Entries older than `timeout`, removed for a TIMED_OUT reply.
    pub fn take_expired(&self, timeout: Duration) -> Vec<PendingAuth> {
        let now = Instant::now();
        self.take_where(|p| now.duration_since(p.created) >= timeout)
    }

    fn take_where(&self, keep: impl Fn(&PendingAuth) -> bool) -> Vec<PendingAuth> {
        let keys: Vec<AuthKey> = self
            .pending
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.pending.remove_if(&k, |_, p| keep(p)).map(|(_, p)| p))
            .collect()
    }
}
