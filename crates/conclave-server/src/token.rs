//! The distributed mutual-exclusion token.
//!
//! The status and the holder set are one compound state, mutated together
//! under a single lock: no observer ever sees GRABBED with two holders or
//! NOT_IN_USE with one.

use std::collections::BTreeSet;
use std::sync::Mutex;

use conclave_core::wire::{ResourceKind, TokenStatus};
use conclave_core::ProtocolError;

use crate::membership::Membership;

/// An in-flight give: the sole holder has designated a receiver and the
/// transfer completes when the receiver grabs. No timeout — the protocol
/// leaves an unclaimed give pending until a connection involved dies.
#[derive(Debug, Clone)]
struct Giving {
    giver: String,
    receiver: String,
    /// Status to restore if the give is cancelled rather than completed.
    prior: TokenStatus,
}

#[derive(Debug)]
struct Machine {
    status: TokenStatus,
    holders: BTreeSet<String>,
    giving: Option<Giving>,
}

/// Outcome of a grab attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum GrabOutcome {
    /// The caller now holds the token.
    Granted { status: TokenStatus },
    /// A give completed: the giver was released first, then the receiver
    /// granted. The caller fans out RELEASED for the giver before the
    /// grant notification.
    CompletedGive {
        status: TokenStatus,
        released_giver: String,
    },
    /// Grab during someone else's give: nothing changes, the caller just
    /// reads the current status back.
    NoOp { status: TokenStatus },
}

/// What a connection-loss sweep did to the token.
#[derive(Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The departed client held the token (or was mid-give as the giver):
    /// fan out one RELEASED for it.
    Released(TokenStatus),
    /// The departed client was only the pending receiver of a give. The
    /// transfer is cancelled, nothing was released.
    GiveCancelled(TokenStatus),
}

/// A denied token operation still reports the status the caller observed.
#[derive(Debug, PartialEq, Eq)]
pub struct TokenDenied {
    pub error: ProtocolError,
    pub status: TokenStatus,
}

#[derive(Debug)]
pub struct ServerToken {
    pub membership: Membership,
    machine: Mutex<Machine>,
}

impl ServerToken {
    pub fn new(session: u16, name: impl Into<String>) -> Self {
        Self {
            membership: Membership::new(ResourceKind::Token, session, name),
            machine: Mutex::new(Machine {
                status: TokenStatus::NotInUse,
                holders: BTreeSet::new(),
                giving: None,
            }),
        }
    }

    pub fn status(&self) -> TokenStatus {
        self.machine.lock().expect("token lock").status
    }

    pub fn holder_names(&self) -> Vec<String> {
        self.machine
            .lock()
            .expect("token lock")
            .holders
            .iter()
            .cloned()
            .collect()
    }

    pub fn holder_count(&self) -> usize {
        self.machine.lock().expect("token lock").holders.len()
    }

    pub fn grab(&self, client: &str, exclusive: bool) -> Result<GrabOutcome, TokenDenied> {
        let mut m = self.machine.lock().expect("token lock");
        match m.status {
            TokenStatus::NotInUse => {
                m.holders.insert(client.to_string());
                m.status = if exclusive {
                    TokenStatus::Grabbed
                } else {
                    TokenStatus::Inhibited
                };
                Ok(GrabOutcome::Granted { status: m.status })
            }
            TokenStatus::Inhibited => {
                if exclusive || m.holders.contains(client) {
                    return Err(TokenDenied {
                        error: ProtocolError::PermissionDenied,
                        status: m.status,
                    });
                }
                m.holders.insert(client.to_string());
                Ok(GrabOutcome::Granted { status: m.status })
            }
            TokenStatus::Grabbed => Err(TokenDenied {
                error: ProtocolError::PermissionDenied,
                status: m.status,
            }),
            TokenStatus::Giving => {
                let giving = m.giving.clone().expect("giving state without pair");
                if client != giving.receiver {
                    return Ok(GrabOutcome::NoOp { status: m.status });
                }
                // Giver released first, then the receiver granted.
                m.holders.remove(&giving.giver);
                m.giving = None;
                m.holders.insert(client.to_string());
                m.status = if exclusive {
                    TokenStatus::Grabbed
                } else {
                    TokenStatus::Inhibited
                };
                Ok(GrabOutcome::CompletedGive {
                    status: m.status,
                    released_giver: giving.giver,
                })
            }
        }
    }

    pub fn release(&self, client: &str) -> Result<TokenStatus, TokenDenied> {
        let mut m = self.machine.lock().expect("token lock");
        if m.status == TokenStatus::Giving {
            let error = if m.giving.as_ref().is_some_and(|g| g.giver == client) {
                ProtocolError::ClientNotReleased
            } else {
                ProtocolError::ClientNotGrabbing
            };
            return Err(TokenDenied {
                error,
                status: m.status,
            });
        }
        if !m.holders.remove(client) {
            return Err(TokenDenied {
                error: ProtocolError::ClientNotGrabbing,
                status: m.status,
            });
        }
        m.status = if m.holders.is_empty() {
            TokenStatus::NotInUse
        } else {
            TokenStatus::Inhibited
        };
        Ok(m.status)
    }

    /// Begin a transfer. The giver must be the sole current holder.
    pub fn give(&self, giver: &str, receiver: &str) -> Result<TokenStatus, TokenDenied> {
        let mut m = self.machine.lock().expect("token lock");
        if m.status == TokenStatus::Giving {
            return Err(TokenDenied {
                error: ProtocolError::ClientNotReleased,
                status: m.status,
            });
        }
        if m.holders.len() != 1 || !m.holders.contains(giver) {
            return Err(TokenDenied {
                error: ProtocolError::PermissionDenied,
                status: m.status,
            });
        }
        m.giving = Some(Giving {
            giver: giver.to_string(),
            receiver: receiver.to_string(),
            prior: m.status,
        });
        m.status = TokenStatus::Giving;
        Ok(m.status)
    }

    /// Connection-loss path: drop a client's hold (or its side of an
    /// in-flight give) without an explicit release. Returns `None` when the
    /// client was not involved with the token at all.
    pub fn release_for_cleanup(&self, client: &str) -> Option<CleanupOutcome> {
        let mut m = self.machine.lock().expect("token lock");
        let give = m
            .giving
            .as_ref()
            .filter(|g| g.giver == client || g.receiver == client)
            .cloned();
        if let Some(give) = &give {
            m.giving = None;
            if give.receiver == client && give.giver != client {
                // Cancelled transfer: the giver keeps holding with the
                // status it had before offering.
                m.status = give.prior;
                return Some(CleanupOutcome::GiveCancelled(m.status));
            }
        }
        let held = m.holders.remove(client);
        if !held && give.is_none() {
            return None;
        }
        m.status = if m.holders.is_empty() {
            TokenStatus::NotInUse
        } else {
            TokenStatus::Inhibited
        };
        Some(CleanupOutcome::Released(m.status))
    }
}
