//! Client-side inbound handler: routes server pushes to the registered
//! listeners, answers challenges, and runs the manager side of deferred
//! authorization.
//!
//! Replies to this client's own calls never reach this handler — the
//! connection's correlation slot claims them first. Everything arriving
//! here is an unsolicited push.

use std::sync::Arc;

use dashmap::DashMap;

use conclave_core::payload::PayloadReader;
use conclave_core::wire::{event_mask, Action, EventMask, Frame, ResourceKind};
use conclave_net::{Connection, InboundHandler};

use crate::events::{
    AuthorizeRequest, ByteArrayEvents, ChannelConsumer, ClientIdentity, ResourceManager,
    SessionEvents, TokenEvents,
};
use crate::wire_util::one_way;

type ResourceKey = (u16, ResourceKind, String);

struct Listener<T: ?Sized> {
    id: u32,
    mask: EventMask,
    callback: Arc<T>,
}

pub struct ClientHandler {
    identity: Arc<dyn ClientIdentity>,
    /// Membership listeners for sessions, channels, and the registry.
    membership: DashMap<ResourceKey, Vec<Listener<dyn SessionEvents>>>,
    byte_arrays: DashMap<ResourceKey, Vec<Listener<dyn ByteArrayEvents>>>,
    tokens: DashMap<ResourceKey, Vec<Listener<dyn TokenEvents>>>,
    /// Channel consumers, keyed like listeners but identified by client
    /// name rather than listener id.
    consumers: DashMap<(u16, String), Vec<(String, Arc<dyn ChannelConsumer>)>>,
    /// At most one manager per resource on this client.
    managers: DashMap<ResourceKey, Arc<dyn ResourceManager>>,
    /// Authorize requests this manager has challenged and not yet decided.
    open_challenges: DashMap<(u16, ResourceKind, String, String), AuthorizeRequest>,
}

impl ClientHandler {
    pub fn new(identity: Arc<dyn ClientIdentity>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            membership: DashMap::new(),
            byte_arrays: DashMap::new(),
            tokens: DashMap::new(),
            consumers: DashMap::new(),
            managers: DashMap::new(),
            open_challenges: DashMap::new(),
        })
    }

    // ── registration (called by the proxies) ─────────────────────────────

    pub(crate) fn add_membership_listener(
        &self,
        key: ResourceKey,
        id: u32,
        mask: EventMask,
        callback: Arc<dyn SessionEvents>,
    ) {
        self.membership
            .entry(key)
            .or_default()
            .push(Listener { id, mask, callback });
    }

    pub(crate) fn add_byte_array_listener(
        &self,
        key: ResourceKey,
        id: u32,
        mask: EventMask,
        callback: Arc<dyn ByteArrayEvents>,
    ) {
        self.byte_arrays
            .entry(key)
            .or_default()
            .push(Listener { id, mask, callback });
    }

    pub(crate) fn add_token_listener(
        &self,
        key: ResourceKey,
        id: u32,
        mask: EventMask,
        callback: Arc<dyn TokenEvents>,
    ) {
        self.tokens
            .entry(key)
            .or_default()
            .push(Listener { id, mask, callback });
    }

    pub(crate) fn remove_listener(&self, key: &ResourceKey, id: u32) {
        match key.1 {
            ResourceKind::ByteArray => {
                if let Some(mut v) = self.byte_arrays.get_mut(key) {
                    v.retain(|l| l.id != id);
                }
            }
            ResourceKind::Token => {
                if let Some(mut v) = self.tokens.get_mut(key) {
                    v.retain(|l| l.id != id);
                }
            }
            _ => {
                if let Some(mut v) = self.membership.get_mut(key) {
                    v.retain(|l| l.id != id);
                }
            }
        }
    }

    pub(crate) fn add_consumer(
        &self,
        session: u16,
        channel: String,
        client: String,
        consumer: Arc<dyn ChannelConsumer>,
    ) {
        self.consumers
            .entry((session, channel))
            .or_default()
            .push((client, consumer));
    }

    pub(crate) fn remove_consumer(&self, session: u16, channel: &str, client: &str) {
        if let Some(mut v) = self.consumers.get_mut(&(session, channel.to_string())) {
            v.retain(|(c, _)| c != client);
        }
    }

    pub(crate) fn set_manager(&self, key: ResourceKey, manager: Arc<dyn ResourceManager>) {
        self.managers.insert(key, manager);
    }

    // ── event routing ────────────────────────────────────────────────────

    /// Route one push frame. Shared by the stream handler and the client's
    /// datagram receive task.
    pub(crate) fn route(&self, conn: &Arc<Connection>, frame: &Frame) {
        let mut r = PayloadReader::new(frame.payload.clone());
        let Ok(name) = r.get_string() else {
            tracing::debug!(action = ?frame.action, "malformed push dropped");
            return;
        };
        let key = (frame.session, frame.resource, name.clone());

        match frame.action {
            Action::Joined
            | Action::Left
            | Action::Invited
            | Action::Expelled
            | Action::Destroyed => {
                let Ok(client) = r.get_string() else { return };
                self.fan_membership(&key, frame.action, name, client);
            }
            Action::ValueChanged => {
                let (Ok(client), Ok(value)) = (r.get_string(), r.get_bytes()) else {
                    return;
                };
                let targets = self.collect(&self.byte_arrays, &key, event_mask::VALUE_CHANGED);
                tokio::spawn(async move {
                    for cb in targets {
                        cb.value_changed(&name, &client, &value);
                    }
                });
            }
            Action::Released | Action::Requested => {
                let Ok(client) = r.get_string() else { return };
                let bit = if frame.action == Action::Released {
                    event_mask::RELEASED
                } else {
                    event_mask::REQUESTED
                };
                let released = frame.action == Action::Released;
                let targets = self.collect(&self.tokens, &key, bit);
                tokio::spawn(async move {
                    for cb in targets {
                        if released {
                            cb.released(&name, &client);
                        } else {
                            cb.requested(&name, &client);
                        }
                    }
                });
            }
            Action::TokenGiven => {
                let (Ok(client), Ok(receiver)) = (r.get_string(), r.get_string()) else {
                    return;
                };
                let targets = self.collect(&self.tokens, &key, event_mask::GIVEN);
                tokio::spawn(async move {
                    for cb in targets {
                        cb.given(&name, &client, &receiver);
                    }
                });
            }
            Action::DataReceived => {
                let (Ok(sender), Ok(data)) = (r.get_string(), r.get_bytes()) else {
                    return;
                };
                let targets: Vec<Arc<dyn ChannelConsumer>> = self
                    .consumers
                    .get(&(frame.session, name.clone()))
                    .map(|v| v.iter().map(|(_, c)| c.clone()).collect())
                    .unwrap_or_default();
                tokio::spawn(async move {
                    for cb in targets {
                        cb.data_received(&name, &sender, &data);
                    }
                });
            }
            Action::Challenge => {
                let (Ok(client), Ok(challenge)) = (r.get_string(), r.get_bytes()) else {
                    return;
                };
                self.answer_challenge(conn, frame, name, client, challenge);
            }
            Action::Authorize => {
                let (Ok(client), Ok(action)) = (r.get_string(), r.get_u16()) else {
                    return;
                };
                let Ok(action) = Action::try_from(action) else { return };
                self.decide(conn, frame, key, name, client, action);
            }
            Action::Authenticate => {
                let (Ok(client), Ok(response)) = (r.get_string(), r.get_bytes()) else {
                    return;
                };
                self.check_response(conn, frame, key, name, client, response);
            }
            other => {
                tracing::debug!(action = ?other, "unexpected push dropped");
            }
        }
    }

    fn fan_membership(&self, key: &ResourceKey, action: Action, name: String, client: String) {
        let bit = match action {
            Action::Joined => event_mask::JOINED,
            Action::Left => event_mask::LEFT,
            Action::Invited => event_mask::INVITED,
            Action::Expelled => event_mask::EXPELLED,
            _ => event_mask::DESTROYED,
        };
        // Membership events fan to whichever table knows this resource.
        let mut plain = self.collect(&self.membership, key, bit);
        let bas = self.collect(&self.byte_arrays, key, bit);
        let toks = self.collect(&self.tokens, key, bit);
        plain.extend(bas.into_iter().map(|cb| cb as Arc<dyn SessionEvents>));
        plain.extend(toks.into_iter().map(|cb| cb as Arc<dyn SessionEvents>));
        if plain.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for cb in plain {
                match action {
                    Action::Joined => cb.joined(&name, &client),
                    Action::Left => cb.left(&name, &client),
                    Action::Invited => cb.invited(&name, &client),
                    Action::Expelled => cb.expelled(&name, &client),
                    _ => cb.destroyed(&name, &client),
                }
            }
        });
    }

    fn collect<T: ?Sized>(
        &self,
        map: &DashMap<ResourceKey, Vec<Listener<T>>>,
        key: &ResourceKey,
        bit: EventMask,
    ) -> Vec<Arc<T>> {
        map.get(key)
            .map(|v| {
                v.iter()
                    .filter(|l| l.mask & bit != 0)
                    .map(|l| l.callback.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── manager handshake ────────────────────────────────────────────────

    /// A manager challenged this client's pending join. Answer one-way.
    fn answer_challenge(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        name: String,
        client: String,
        challenge: bytes::Bytes,
    ) {
        if client != self.identity.name() {
            tracing::debug!(client, "challenge for a different identity dropped");
            return;
        }
        let response = self.identity.authenticate(&challenge);
        tracing::debug!(
            name,
            challenge = %hex::encode(&challenge),
            "answering manager challenge"
        );
        let reply = one_way(frame.session, frame.resource, Action::Authenticate, |w| {
            w.put_string(&name).put_string(&client).put_bytes(&response);
        });
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn.send(&reply).await;
        });
    }

    /// An authorize request for a resource this client manages. Challenge
    /// first when the manager wants one, otherwise decide directly.
    fn decide(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        key: ResourceKey,
        name: String,
        client: String,
        action: Action,
    ) {
        let Some(manager) = self.managers.get(&key).map(|m| Arc::clone(m.value())) else {
            tracing::warn!(name, client, "authorize request for an unmanaged resource");
            return;
        };
        let request = AuthorizeRequest {
            resource: frame.resource,
            name: name.clone(),
            client: client.clone(),
            action,
        };

        if let Some(challenge) = manager.challenge_for(&client) {
            self.open_challenges
                .insert((frame.session, frame.resource, name.clone(), client.clone()), request);
            let push = one_way(frame.session, frame.resource, Action::Challenge, |w| {
                w.put_string(&name).put_string(&client).put_bytes(&challenge);
            });
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.send(&push).await;
            });
            return;
        }

        let conn = conn.clone();
        let session = frame.session;
        let resource = frame.resource;
        tokio::spawn(async move {
            let admitted = manager.authorize(request).await;
            let decision = one_way(session, resource, Action::Authorize, |w| {
                w.put_string(&name)
                    .put_string(&client)
                    .put_u16(action as u16)
                    .put_bool(admitted);
            });
            let _ = conn.send(&decision).await;
        });
    }

    /// The challenged client answered; verify, then consult the manager.
    fn check_response(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        key: ResourceKey,
        name: String,
        client: String,
        response: bytes::Bytes,
    ) {
        let Some(manager) = self.managers.get(&key).map(|m| Arc::clone(m.value())) else {
            return;
        };
        let Some((_, request)) = self
            .open_challenges
            .remove(&(frame.session, frame.resource, name.clone(), client.clone()))
        else {
            tracing::debug!(name, client, "response without an open challenge dropped");
            return;
        };

        let action = request.action;
        let conn = conn.clone();
        let session = frame.session;
        let resource = frame.resource;
        tokio::spawn(async move {
            let admitted =
                manager.verify(&client, &response) && manager.authorize(request).await;
            let decision = one_way(session, resource, Action::Authorize, |w| {
                w.put_string(&name)
                    .put_string(&client)
                    .put_u16(action as u16)
                    .put_bool(admitted);
            });
            let _ = conn.send(&decision).await;
        });
    }
}

impl InboundHandler for ClientHandler {
    fn on_frame(
        &self,
        conn: Arc<Connection>,
        frame: Frame,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            if frame.request_id != 0 {
                // A reply nobody is waiting for (e.g. after a timeout the
                // reader drains it via the correlation slot, not here).
                tracing::debug!(
                    request_id = frame.request_id,
                    action = ?frame.action,
                    "unexpected correlated frame on client connection"
                );
                return;
            }
            self.route(&conn, &frame);
        }
    }

    fn on_closed(&self, conn: Arc<Connection>) -> impl std::future::Future<Output = ()> + Send {
        async move {
            tracing::info!(conn = conn.id(), "server connection closed");
        }
    }
}
