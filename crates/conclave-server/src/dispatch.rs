//! Frame dispatch: every inbound request is matched exhaustively on its
//! (resource, action) pair and answered with a status-first reply.
//!
//! Requests run on the owning connection's reader task, so requests from
//! one client are handled strictly in arrival order. Privileged operations
//! on a managed resource are not answered here at all — they are parked in
//! the authorization table and finished when the manager decides (or the
//! timeout sweep / a connection loss decides for it).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use conclave_core::payload::{PayloadReader, PayloadWriter};
use conclave_core::url::SessionUrl;
use conclave_core::wire::{event_mask, Action, EventMask, Frame, ResourceKind, REGISTRY_SESSION};
use conclave_core::{ProtocolError, Status};
use conclave_net::{Connection, InboundHandler};

use crate::authorize::{AuthKey, PendingAuth};
use crate::membership::Membership;
use crate::session::ServerSession;
use crate::state::ServerState;
use crate::token::{CleanupOutcome, GrabOutcome};

/// What a request handler produced: a reply payload, or nothing yet
/// because the request went to the manager.
enum Outcome {
    Reply(Bytes),
    Deferred,
}

fn ok_reply() -> Outcome {
    Outcome::Reply(PayloadWriter::reply(Status::Ok).finish())
}

pub struct ServerHandler {
    state: Arc<ServerState>,
    /// Signalled by the registry Stop operation; the daemon's run loop
    /// listens on it.
    stop: broadcast::Sender<()>,
}

impl ServerHandler {
    pub fn new(state: Arc<ServerState>, stop: broadcast::Sender<()>) -> Arc<Self> {
        Arc::new(Self { state, stop })
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    // ── event fan-out ────────────────────────────────────────────────────

    /// Push `action` for `client` to everyone listening for `bit` on this
    /// resource.
    fn emit(&self, m: &Membership, bit: EventMask, action: Action, client: &str) {
        self.emit_with(m, bit, action, client, &[], |_| {});
    }

    /// Like [`emit`], with extra connections added to the target set and a
    /// hook to append extra payload fields.
    fn emit_with(
        &self,
        m: &Membership,
        bit: EventMask,
        action: Action,
        client: &str,
        extra_targets: &[u64],
        extend: impl FnOnce(&mut PayloadWriter),
    ) {
        let mut targets = m.event_targets(bit);
        targets.extend_from_slice(extra_targets);
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            return;
        }
        let mut w = PayloadWriter::new();
        w.put_string(m.name()).put_string(client);
        extend(&mut w);
        let frame = Frame::push(m.session(), m.kind(), action, w.finish());
        self.state.connections.notify(&targets, &frame);
    }

    // ── deferred authorization ───────────────────────────────────────────

    /// Manager gate for a privileged operation. `Ok(None)` means proceed;
    /// `Ok(Some(Deferred))` means the request was parked and forwarded.
    fn defer_if_managed(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        m: &Membership,
        action: Action,
        client: &str,
        authorized: bool,
    ) -> Result<Option<Outcome>, ProtocolError> {
        if authorized {
            return Ok(None);
        }
        let Some(manager) = m.manager() else {
            return Ok(None);
        };
        if manager.conn_id == conn.id() {
            return Ok(None);
        }

        let key = AuthKey {
            session: m.session(),
            kind: m.kind(),
            name: m.name().to_string(),
            client: client.to_string(),
        };
        self.state.pending_auth.insert(
            key,
            PendingAuth::new(conn.id(), frame.clone(), action, manager.conn_id),
        )?;

        let mut w = PayloadWriter::new();
        w.put_string(m.name())
            .put_string(client)
            .put_u16(action as u16);
        let ask = Frame::push(m.session(), m.kind(), Action::Authorize, w.finish());
        self.state.connections.push_event(manager.conn_id, ask);
        tracing::debug!(
            conn = conn.id(),
            resource = %m.kind(),
            name = m.name(),
            client,
            action = ?action,
            "privileged request parked for manager decision"
        );
        Ok(Some(Outcome::Deferred))
    }

    // ── request handling ─────────────────────────────────────────────────

    async fn handle_request(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        if frame.session == REGISTRY_SESSION {
            return match frame.resource {
                ResourceKind::Registry => self.registry_op(conn, frame, authorized),
                ResourceKind::Session if frame.action == Action::Create => {
                    self.create_session(conn, frame, authorized)
                }
                _ => Err(ProtocolError::NoSuchSession),
            };
        }

        let session = self.state.session(frame.session)?;
        match frame.resource {
            ResourceKind::Session => self.session_op(conn, frame, &session, authorized).await,
            ResourceKind::ByteArray => self.byte_array_op(conn, frame, &session, authorized),
            ResourceKind::Channel => self.channel_op(conn, frame, &session, authorized).await,
            ResourceKind::Token => self.token_op(conn, frame, &session, authorized),
            _ => Err(ProtocolError::InvalidClient),
        }
    }

    // ── registry scope ───────────────────────────────────────────────────

    fn registry_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        let registry = &self.state.registry;
        let mut r = PayloadReader::new(frame.payload.clone());
        match frame.action {
            Action::Bind => {
                let url = SessionUrl::parse(&r.get_string()?)?;
                let session = r.get_u16()?;
                self.state.session(session)?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &registry.membership,
                    Action::Bind,
                    &url.name,
                    authorized,
                )? {
                    return Ok(out);
                }
                registry.bind(&url, session, conn.id())?;
                tracing::info!(conn = conn.id(), url = %url, session, "url bound");
                Ok(ok_reply())
            }
            Action::Unbind => {
                let url = SessionUrl::parse(&r.get_string()?)?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &registry.membership,
                    Action::Unbind,
                    &url.name,
                    authorized,
                )? {
                    return Ok(out);
                }
                registry.unbind(&url, conn.id())?;
                tracing::info!(conn = conn.id(), url = %url, "url unbound");
                Ok(ok_reply())
            }
            Action::Lookup | Action::GetSessionNumber => {
                let url = SessionUrl::parse(&r.get_string()?)?;
                let binding = registry.lookup(&url)?;
                let mut w = PayloadWriter::reply(Status::Ok);
                w.put_u16(binding.session);
                Ok(Outcome::Reply(w.finish()))
            }
            Action::List => {
                let mut w = PayloadWriter::reply(Status::Ok);
                w.put_string_list(&registry.bound_urls());
                Ok(Outcome::Reply(w.finish()))
            }
            Action::Exists => {
                let url = SessionUrl::parse(&r.get_string()?)?;
                let mut w = PayloadWriter::reply(Status::Ok);
                w.put_bool(registry.exists(&url));
                Ok(Outcome::Reply(w.finish()))
            }
            Action::IsAlive => Ok(ok_reply()),
            Action::Stop => {
                tracing::info!(conn = conn.id(), "stop requested over the wire");
                let _ = self.stop.send(());
                Ok(ok_reply())
            }
            _ => self.generic_op(conn, frame, &registry.membership, None, authorized, &mut r),
        }
    }

    fn create_session(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        let mut r = PayloadReader::new(frame.payload.clone());
        let url = SessionUrl::parse(&r.get_string()?)?;
        let client = r.get_string()?;
        if let Some(out) = self.defer_if_managed(
            conn,
            frame,
            &self.state.registry.membership,
            Action::Create,
            &client,
            authorized,
        )? {
            return Ok(out);
        }

        let (number, _session) = self.state.create_session(&url, conn.id())?;
        tracing::info!(conn = conn.id(), url = %url, session = number, client, "session created");
        let mut w = PayloadWriter::reply(Status::Ok);
        w.put_u16(number);
        Ok(Outcome::Reply(w.finish()))
    }

    // ── session scope ────────────────────────────────────────────────────

    async fn session_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        session: &Arc<ServerSession>,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        let mut r = PayloadReader::new(frame.payload.clone());
        match frame.action {
            Action::CreateByteArray => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let value = r.get_bytes()?;
                session.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &session.membership,
                    Action::CreateByteArray,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                let (ba, created) = session.create_byte_array(&name, value);
                self.join_creator(conn, session, &ba.membership, &client)?;
                session.touch(conn.id(), ResourceKind::ByteArray, &name);
                if created {
                    tracing::debug!(session = session.number, name, client, "byte-array created");
                }
                // The reply carries the live value: an idempotent re-create
                // is how a late joiner reads the current contents.
                let mut w = PayloadWriter::reply(Status::Ok);
                w.put_bytes(&ba.value());
                Ok(Outcome::Reply(w.finish()))
            }
            Action::CreateChannel => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                session.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &session.membership,
                    Action::CreateChannel,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                let (ch, created) = session.create_channel(&name);
                self.join_creator(conn, session, &ch.membership, &client)?;
                session.touch(conn.id(), ResourceKind::Channel, &name);
                if created {
                    tracing::debug!(session = session.number, name, client, "channel created");
                }
                Ok(ok_reply())
            }
            Action::CreateToken => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                session.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &session.membership,
                    Action::CreateToken,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                let (tok, created) = session.create_token(&name);
                self.join_creator(conn, session, &tok.membership, &client)?;
                session.touch(conn.id(), ResourceKind::Token, &name);
                if created {
                    tracing::debug!(session = session.number, name, client, "token created");
                }
                Ok(ok_reply())
            }
            Action::ByteArrayExists => {
                let name = r.get_string()?;
                self.bool_reply(session.byte_array(&name).is_ok())
            }
            Action::ChannelExists => {
                let name = r.get_string()?;
                self.bool_reply(session.channel(&name).is_ok())
            }
            Action::TokenExists => {
                let name = r.get_string()?;
                self.bool_reply(session.token(&name).is_ok())
            }
            Action::ByteArrayJoined => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                self.bool_reply(session.byte_array(&name)?.membership.contains(&client))
            }
            Action::ChannelJoined => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                self.bool_reply(session.channel(&name)?.membership.contains(&client))
            }
            Action::TokenJoined => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                self.bool_reply(session.token(&name)?.membership.contains(&client))
            }
            Action::ListByteArrayNames => self.list_reply(session.byte_array_names()),
            Action::ListChannelNames => self.list_reply(session.channel_names()),
            Action::ListTokenNames => self.list_reply(session.token_names()),
            Action::Close => {
                let _name = r.get_string()?;
                let client = r.get_string()?;
                session.membership.verify_member(&client, conn.id())?;
                // Detach only: the session and its resources outlive the
                // departing connection.
                self.teardown_session_footprint(session, conn.id(), false);
                tracing::info!(
                    session = session.number,
                    client,
                    "connection detached from session"
                );
                Ok(ok_reply())
            }
            Action::Destroy => {
                let _name = r.get_string()?;
                let client = r.get_string()?;
                session.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &session.membership,
                    Action::Destroy,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                self.destroy_session(session.number, &client)?;
                Ok(ok_reply())
            }
            _ => self.generic_op(
                conn,
                frame,
                &session.membership,
                Some(session),
                authorized,
                &mut r,
            ),
        }
    }

    /// Creating a resource joins its creator; re-creating while already
    /// joined is not an error.
    fn join_creator(
        &self,
        conn: &Arc<Connection>,
        _session: &Arc<ServerSession>,
        m: &Membership,
        client: &str,
    ) -> Result<(), ProtocolError> {
        match m.join(client, conn.id()) {
            Ok(()) => {
                self.emit(m, event_mask::JOINED, Action::Joined, client);
                Ok(())
            }
            Err(ProtocolError::NameInUse) if m.client_conn(client) == Some(conn.id()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn destroy_session(&self, number: u16, initiator: &str) -> Result<(), ProtocolError> {
        let session = self.state.remove_session(number)?;
        for res in session.drain_resources() {
            self.emit(
                res.membership(),
                event_mask::DESTROYED,
                Action::Destroyed,
                initiator,
            );
        }
        self.emit(
            &session.membership,
            event_mask::DESTROYED,
            Action::Destroyed,
            initiator,
        );
        tracing::info!(session = number, initiator, "session destroyed");
        Ok(())
    }

    // ── byte-array scope ─────────────────────────────────────────────────

    fn byte_array_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        session: &Arc<ServerSession>,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        let mut r = PayloadReader::new(frame.payload.clone());
        match frame.action {
            Action::SetValue => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let value = r.get_bytes()?;
                let ba = session.byte_array(&name)?;
                ba.membership.verify_member(&client, conn.id())?;
                let version = ba.set_value(value.clone());
                tracing::debug!(
                    session = frame.session,
                    array = %name,
                    client = %client,
                    version,
                    len = value.len(),
                    "byte-array value replaced"
                );
                self.emit_with(
                    &ba.membership,
                    event_mask::VALUE_CHANGED,
                    Action::ValueChanged,
                    &client,
                    &[],
                    |w| {
                        w.put_bytes(&value);
                    },
                );
                Ok(ok_reply())
            }
            Action::Destroy => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let ba = session.byte_array(&name)?;
                ba.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &ba.membership,
                    Action::Destroy,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                let ba = session.destroy_byte_array(&name)?;
                self.emit(
                    &ba.membership,
                    event_mask::DESTROYED,
                    Action::Destroyed,
                    &client,
                );
                Ok(ok_reply())
            }
            _ => {
                let name = r.get_string()?;
                let ba = session.byte_array(&name)?;
                let out =
                    self.generic_membership_op(conn, frame, &ba.membership, session, authorized, &mut r)?;
                session.touch(conn.id(), ResourceKind::ByteArray, &name);
                Ok(out)
            }
        }
    }

    // ── channel scope ────────────────────────────────────────────────────

    async fn channel_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        session: &Arc<ServerSession>,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        let mut r = PayloadReader::new(frame.payload.clone());
        match frame.action {
            Action::AddConsumer => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let reliable = r.get_bool()?;
                let datagram_port = r.get_u16()?;
                let ch = session.channel(&name)?;
                ch.membership.verify_member(&client, conn.id())?;
                let datagram = if reliable {
                    None
                } else {
                    let peer = conn.peer_addr().ok_or(ProtocolError::InvalidClient)?;
                    if datagram_port == 0 {
                        return Err(ProtocolError::InvalidClient);
                    }
                    Some(std::net::SocketAddr::new(peer.ip(), datagram_port))
                };
                ch.add_consumer(&client, reliable, datagram)?;
                session.touch(conn.id(), ResourceKind::Channel, &name);
                Ok(ok_reply())
            }
            Action::RemoveConsumer => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let ch = session.channel(&name)?;
                ch.membership.verify_member(&client, conn.id())?;
                ch.remove_consumer(&client)?;
                Ok(ok_reply())
            }
            Action::Send => {
                let name = r.get_string()?;
                let sender = r.get_string()?;
                let data = r.get_bytes()?;
                session
                    .channel(&name)?
                    .membership
                    .verify_member(&sender, conn.id())?;
                self.fan_out_channel_data(session.number, &name, &sender, data)
                    .await?;
                Ok(ok_reply())
            }
            Action::ListConsumerNames => {
                let name = r.get_string()?;
                self.list_reply(session.channel(&name)?.consumer_names())
            }
            Action::Destroy => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let ch = session.channel(&name)?;
                ch.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &ch.membership,
                    Action::Destroy,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                let ch = session.destroy_channel(&name)?;
                self.emit(
                    &ch.membership,
                    event_mask::DESTROYED,
                    Action::Destroyed,
                    &client,
                );
                Ok(ok_reply())
            }
            _ => {
                let name = r.get_string()?;
                let ch = session.channel(&name)?;
                let out =
                    self.generic_membership_op(conn, frame, &ch.membership, session, authorized, &mut r)?;
                session.touch(conn.id(), ResourceKind::Channel, &name);
                Ok(out)
            }
        }
    }

    /// DATA_RECEIVED fan-out, shared by the stream Send handler and the
    /// datagram task. The sender is excluded from its own fan-out.
    pub(crate) async fn fan_out_channel_data(
        &self,
        session_no: u16,
        name: &str,
        sender: &str,
        data: Bytes,
    ) -> Result<(), ProtocolError> {
        let session = self.state.session(session_no)?;
        let ch = session.channel(name)?;
        if !ch.membership.contains(sender) {
            return Err(ProtocolError::NoSuchClient);
        }

        let mut w = PayloadWriter::new();
        w.put_string(name).put_string(sender).put_bytes(&data);
        let push = Frame::push(
            session_no,
            ResourceKind::Channel,
            Action::DataReceived,
            w.finish(),
        );
        for (consumer, entry) in ch.consumers_except(sender) {
            if entry.reliable {
                if let Some(conn_id) = ch.membership.client_conn(&consumer) {
                    self.state.connections.push_event(conn_id, push.clone());
                }
            } else if let (Some(endpoint), Some(addr)) = (self.state.datagram(), entry.datagram) {
                if let Err(e) = endpoint.send_to(&push, addr).await {
                    tracing::debug!(consumer, %addr, error = %e, "datagram send failed");
                }
            }
        }
        Ok(())
    }

    // ── token scope ──────────────────────────────────────────────────────

    fn token_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        session: &Arc<ServerSession>,
        authorized: bool,
    ) -> Result<Outcome, ProtocolError> {
        let mut r = PayloadReader::new(frame.payload.clone());
        match frame.action {
            Action::Grab => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let exclusive = r.get_bool()?;
                let tok = session.token(&name)?;
                tok.membership.verify_member(&client, conn.id())?;
                match tok.grab(&client, exclusive) {
                    Ok(GrabOutcome::Granted { status })
                    | Ok(GrabOutcome::NoOp { status }) => {
                        Ok(self.token_reply(Status::Ok, status))
                    }
                    Ok(GrabOutcome::CompletedGive {
                        status,
                        released_giver,
                    }) => {
                        // The giver's hold ended when the transfer landed.
                        self.emit(
                            &tok.membership,
                            event_mask::RELEASED,
                            Action::Released,
                            &released_giver,
                        );
                        Ok(self.token_reply(Status::Ok, status))
                    }
                    Err(denied) => Ok(self.token_reply(denied.error.status(), denied.status)),
                }
            }
            Action::Release => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let tok = session.token(&name)?;
                tok.membership.verify_member(&client, conn.id())?;
                match tok.release(&client) {
                    Ok(status) => {
                        self.emit(
                            &tok.membership,
                            event_mask::RELEASED,
                            Action::Released,
                            &client,
                        );
                        Ok(self.token_reply(Status::Ok, status))
                    }
                    Err(denied) => Ok(self.token_reply(denied.error.status(), denied.status)),
                }
            }
            Action::Give => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let receiver = r.get_string()?;
                let tok = session.token(&name)?;
                tok.membership.verify_member(&client, conn.id())?;
                if !tok.membership.contains(&receiver) {
                    return Err(ProtocolError::NoSuchClient);
                }
                match tok.give(&client, &receiver) {
                    Ok(status) => {
                        let receiver_conn =
                            tok.membership.client_conn(&receiver).into_iter().collect::<Vec<_>>();
                        self.emit_with(
                            &tok.membership,
                            event_mask::GIVEN,
                            Action::TokenGiven,
                            &client,
                            &receiver_conn,
                            |w| {
                                w.put_string(&receiver);
                            },
                        );
                        Ok(self.token_reply(Status::Ok, status))
                    }
                    Err(denied) => Ok(self.token_reply(denied.error.status(), denied.status)),
                }
            }
            Action::Request => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let tok = session.token(&name)?;
                tok.membership.verify_member(&client, conn.id())?;
                // Holders hear the request even without a listener.
                let holder_conns: Vec<u64> = tok
                    .holder_names()
                    .iter()
                    .filter_map(|h| tok.membership.client_conn(h))
                    .collect();
                self.emit_with(
                    &tok.membership,
                    event_mask::REQUESTED,
                    Action::Requested,
                    &client,
                    &holder_conns,
                    |_| {},
                );
                Ok(self.token_reply(Status::Ok, tok.status()))
            }
            Action::Test => {
                let name = r.get_string()?;
                let tok = session.token(&name)?;
                Ok(self.token_reply(Status::Ok, tok.status()))
            }
            Action::ListHolderNames => {
                let name = r.get_string()?;
                self.list_reply(session.token(&name)?.holder_names())
            }
            Action::Destroy => {
                let name = r.get_string()?;
                let client = r.get_string()?;
                let tok = session.token(&name)?;
                tok.membership.verify_member(&client, conn.id())?;
                if let Some(out) = self.defer_if_managed(
                    conn,
                    frame,
                    &tok.membership,
                    Action::Destroy,
                    &client,
                    authorized,
                )? {
                    return Ok(out);
                }
                let tok = session.destroy_token(&name)?;
                self.emit(
                    &tok.membership,
                    event_mask::DESTROYED,
                    Action::Destroyed,
                    &client,
                );
                Ok(ok_reply())
            }
            _ => {
                let name = r.get_string()?;
                let tok = session.token(&name)?;
                let out =
                    self.generic_membership_op(conn, frame, &tok.membership, session, authorized, &mut r)?;
                session.touch(conn.id(), ResourceKind::Token, &name);
                Ok(out)
            }
        }
    }

    // ── generic membership operations ────────────────────────────────────

    /// Session/registry entry point: the payload still has the resource
    /// name in front (the session's or registry's own name), which the
    /// kind-specific handlers consumed already for child resources.
    fn generic_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        m: &Membership,
        session: Option<&Arc<ServerSession>>,
        authorized: bool,
        r: &mut PayloadReader,
    ) -> Result<Outcome, ProtocolError> {
        let _name = r.get_string()?;
        match session {
            Some(s) => self.generic_membership_op(conn, frame, m, s, authorized, r),
            None => self.generic_membership_op_inner(conn, frame, m, None, authorized, r),
        }
    }

    fn generic_membership_op(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        m: &Membership,
        session: &Arc<ServerSession>,
        authorized: bool,
        r: &mut PayloadReader,
    ) -> Result<Outcome, ProtocolError> {
        self.generic_membership_op_inner(conn, frame, m, Some(session), authorized, r)
    }

    fn generic_membership_op_inner(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
        m: &Membership,
        session: Option<&Arc<ServerSession>>,
        authorized: bool,
        r: &mut PayloadReader,
    ) -> Result<Outcome, ProtocolError> {
        match frame.action {
            Action::Join => {
                let client = r.get_string()?;
                if client.is_empty() {
                    return Err(ProtocolError::InvalidClient);
                }
                if let Some(out) =
                    self.defer_if_managed(conn, frame, m, Action::Join, &client, authorized)?
                {
                    return Ok(out);
                }
                m.join(&client, conn.id())?;
                tracing::debug!(
                    conn = conn.id(),
                    resource = %m.kind(),
                    name = m.name(),
                    client,
                    "client joined"
                );
                self.emit(m, event_mask::JOINED, Action::Joined, &client);
                Ok(ok_reply())
            }
            Action::Leave => {
                let client = r.get_string()?;
                m.verify_member(&client, conn.id())?;
                m.leave(&client)?;
                self.emit(m, event_mask::LEFT, Action::Left, &client);
                Ok(ok_reply())
            }
            Action::Invite => {
                let client = r.get_string()?;
                let invitee = r.get_string()?;
                m.verify_member(&client, conn.id())?;
                if let Some(out) =
                    self.defer_if_managed(conn, frame, m, Action::Invite, &client, authorized)?
                {
                    return Ok(out);
                }
                // The invitee hears the invitation if this server can find
                // its connection; listeners with the INVITED bit hear it
                // regardless.
                let invitee_conn: Vec<u64> = session
                    .and_then(|s| s.membership.client_conn(&invitee))
                    .or_else(|| self.state.registry.membership.client_conn(&invitee))
                    .into_iter()
                    .collect();
                self.emit_with(
                    m,
                    event_mask::INVITED,
                    Action::Invited,
                    &invitee,
                    &invitee_conn,
                    |_| {},
                );
                Ok(ok_reply())
            }
            Action::Expel => {
                let client = r.get_string()?;
                let expelled = r.get_string_list()?;
                m.verify_member(&client, conn.id())?;
                if let Some(out) =
                    self.defer_if_managed(conn, frame, m, Action::Expel, &client, authorized)?
                {
                    return Ok(out);
                }
                // Partial failure: each entry reports its own status and
                // the rest proceed.
                let mut w = PayloadWriter::reply(Status::Ok);
                w.put_u16(expelled.len() as u16);
                for name in &expelled {
                    match m.leave(name) {
                        Ok(_) => {
                            self.emit(m, event_mask::EXPELLED, Action::Expelled, name);
                            w.put_status(Status::Ok);
                        }
                        Err(e) => {
                            w.put_status(e.status());
                        }
                    }
                }
                Ok(Outcome::Reply(w.finish()))
            }
            Action::AddListener => {
                let mask = r.get_u16()?;
                let id = m.add_listener(conn.id(), mask);
                let mut w = PayloadWriter::reply(Status::Ok);
                w.put_u32(id);
                Ok(Outcome::Reply(w.finish()))
            }
            Action::RemoveListener => {
                let id = r.get_u32()?;
                m.remove_listener(id)?;
                Ok(ok_reply())
            }
            Action::AttachManager => {
                let mask = r.get_u16()?;
                m.attach_manager(conn.id(), mask)?;
                tracing::info!(
                    conn = conn.id(),
                    resource = %m.kind(),
                    name = m.name(),
                    "manager attached"
                );
                Ok(ok_reply())
            }
            Action::IsManaged => self.bool_reply(m.is_managed()),
            Action::ChangeManagerMask => {
                let mask = r.get_u16()?;
                if m.manager().map(|mg| mg.conn_id) != Some(conn.id()) {
                    return Err(ProtocolError::PermissionDenied);
                }
                m.change_manager_mask(mask)?;
                Ok(ok_reply())
            }
            Action::ListClientNames => self.list_reply(m.client_names()),
            _ => Err(ProtocolError::InvalidClient),
        }
    }

    // ── reply builders ───────────────────────────────────────────────────

    fn bool_reply(&self, v: bool) -> Result<Outcome, ProtocolError> {
        let mut w = PayloadWriter::reply(Status::Ok);
        w.put_bool(v);
        Ok(Outcome::Reply(w.finish()))
    }

    fn list_reply(&self, items: Vec<String>) -> Result<Outcome, ProtocolError> {
        let mut w = PayloadWriter::reply(Status::Ok);
        w.put_string_list(&items);
        Ok(Outcome::Reply(w.finish()))
    }

    fn token_reply(&self, status: Status, token_status: conclave_core::TokenStatus) -> Outcome {
        let mut w = PayloadWriter::reply(status);
        w.put_token_status(token_status);
        Outcome::Reply(w.finish())
    }

    // ── one-way traffic (manager handshake) ──────────────────────────────

    async fn handle_one_way(&self, conn: &Arc<Connection>, frame: &Frame) {
        match frame.action {
            Action::Authorize => self.finish_authorization(conn, frame).await,
            Action::Challenge => self.route_challenge(conn, frame),
            Action::Authenticate => self.route_authenticate(conn, frame),
            other => {
                tracing::debug!(conn = conn.id(), action = ?other, "ignoring unexpected one-way frame");
            }
        }
    }

    fn auth_key_of(frame: &Frame, name: &str, client: &str) -> AuthKey {
        AuthKey {
            session: frame.session,
            kind: frame.resource,
            name: name.to_string(),
            client: client.to_string(),
        }
    }

    /// The manager's verdict. Accept replays the parked request with the
    /// gate open; deny answers the requester with PERMISSION_DENIED.
    async fn finish_authorization(&self, conn: &Arc<Connection>, frame: &Frame) {
        let mut r = PayloadReader::new(frame.payload.clone());
        let parsed = (|| -> Result<_, ProtocolError> {
            let name = r.get_string()?;
            let client = r.get_string()?;
            let action = Action::try_from(r.get_u16()?)?;
            let admitted = r.get_bool()?;
            Ok((name, client, action, admitted))
        })();
        let Ok((name, client, action, admitted)) = parsed else {
            tracing::warn!(conn = conn.id(), "malformed authorization decision dropped");
            return;
        };

        let key = Self::auth_key_of(frame, &name, &client);
        match self.state.pending_auth.peek(&key) {
            Some((_, manager_conn)) if manager_conn == conn.id() => {}
            Some(_) => {
                tracing::warn!(
                    conn = conn.id(),
                    name,
                    client,
                    "authorization decision from a connection that is not the manager"
                );
                return;
            }
            None => {
                tracing::debug!(conn = conn.id(), name, client, "decision for nothing pending");
                return;
            }
        }
        let Some(pending) = self.state.pending_auth.resolve(&key, action) else {
            return;
        };

        let Some(requester) = self.state.connections.get(pending.requester_conn) else {
            tracing::debug!(name, client, "requester gone before the decision arrived");
            return;
        };

        if admitted {
            tracing::info!(name, client, action = ?action, "manager admitted the request");
            let result = self.handle_request(&requester, &pending.request, true).await;
            self.send_result(&requester, &pending.request, result).await;
        } else {
            tracing::info!(name, client, action = ?action, "manager denied the request");
            let reply = Frame::reply_to(
                &pending.request,
                PayloadWriter::reply(Status::PermissionDenied).finish(),
            );
            let _ = requester.send(&reply).await;
        }
    }

    /// Manager → joining client, while the authorization is pending.
    fn route_challenge(&self, conn: &Arc<Connection>, frame: &Frame) {
        let mut r = PayloadReader::new(frame.payload.clone());
        let Ok(name) = r.get_string() else { return };
        let Ok(client) = r.get_string() else { return };
        let key = Self::auth_key_of(frame, &name, &client);
        match self.state.pending_auth.peek(&key) {
            Some((requester_conn, manager_conn)) if manager_conn == conn.id() => {
                let push = Frame::push(frame.session, frame.resource, Action::Challenge, frame.payload.clone());
                self.state.connections.push_event(requester_conn, push);
            }
            _ => {
                tracing::debug!(conn = conn.id(), name, client, "challenge with nothing pending dropped");
            }
        }
    }

    /// Joining client → manager: the response to a challenge.
    fn route_authenticate(&self, conn: &Arc<Connection>, frame: &Frame) {
        let mut r = PayloadReader::new(frame.payload.clone());
        let Ok(name) = r.get_string() else { return };
        let Ok(client) = r.get_string() else { return };
        let key = Self::auth_key_of(frame, &name, &client);
        match self.state.pending_auth.peek(&key) {
            Some((requester_conn, manager_conn)) if requester_conn == conn.id() => {
                let push = Frame::push(frame.session, frame.resource, Action::Authenticate, frame.payload.clone());
                self.state.connections.push_event(manager_conn, push);
            }
            _ => {
                tracing::debug!(conn = conn.id(), name, client, "authenticate with nothing pending dropped");
            }
        }
    }

    async fn send_result(
        &self,
        conn: &Arc<Connection>,
        request: &Frame,
        result: Result<Outcome, ProtocolError>,
    ) {
        let payload = match result {
            Ok(Outcome::Reply(payload)) => payload,
            Ok(Outcome::Deferred) => return,
            Err(err) => {
                tracing::debug!(
                    conn = conn.id(),
                    resource = %request.resource,
                    action = ?request.action,
                    error = %err,
                    "request failed"
                );
                PayloadWriter::reply(err.status()).finish()
            }
        };
        let reply = Frame::reply_to(request, payload);
        if let Err(e) = conn.send(&reply).await {
            tracing::debug!(conn = conn.id(), error = %e, "reply could not be delivered");
        }
    }

    // ── housekeeping ─────────────────────────────────────────────────────

    /// Periodic sweep: pending authorizations past the deadline fail back
    /// to their requesters with TIMED_OUT.
    pub async fn sweep_stale_authorizations(&self) {
        let timeout = self.state.config.protocol.authorize_timeout();
        for pending in self.state.pending_auth.take_expired(timeout) {
            tracing::info!(
                requester = pending.requester_conn,
                manager = pending.manager_conn,
                action = ?pending.action,
                "pending authorization timed out"
            );
            if let Some(conn) = self.state.connections.get(pending.requester_conn) {
                let reply = Frame::reply_to(
                    &pending.request,
                    PayloadWriter::reply(Status::TimedOut).finish(),
                );
                let _ = conn.send(&reply).await;
            }
        }
    }

    /// Everything one dead connection leaves behind: its queue, its parked
    /// authorizations, its registry bindings, every membership it holds,
    /// and any session it created.
    async fn cleanup_connection(&self, conn_id: u64) {
        self.state.connections.remove(conn_id);

        for pending in self.state.pending_auth.take_for_manager(conn_id) {
            if let Some(requester) = self.state.connections.get(pending.requester_conn) {
                let reply = Frame::reply_to(
                    &pending.request,
                    PayloadWriter::reply(Status::ConnectionFailure).finish(),
                );
                let _ = requester.send(&reply).await;
            }
        }
        self.state.pending_auth.take_for_requester(conn_id);

        let orphaned = self.state.registry.remove_owned(conn_id);

        let registry_m = &self.state.registry.membership;
        for client in registry_m.conn_clients(conn_id) {
            if registry_m.leave_quiet(&client).is_some() {
                self.emit(registry_m, event_mask::LEFT, Action::Left, &client);
            }
        }
        registry_m.drop_manager_conn(conn_id);
        registry_m.remove_conn_listeners(conn_id);

        for session in self.state.sessions_snapshot() {
            self.teardown_session_footprint(&session, conn_id, true);
        }

        // Sessions die with the connection that created them.
        for binding in orphaned {
            if self.state.session(binding.session).is_ok() {
                let _ = self.destroy_session(binding.session, "");
            }
        }

        tracing::info!(
            conn = conn_id,
            connections = self.state.connections.len(),
            sessions = self.state.session_count(),
            "connection state torn down"
        );
    }

    /// Unwinds one connection's traces inside one session: token holds
    /// released, consumer registrations dropped, memberships left, listeners
    /// removed. `drop_manager` distinguishes a dead connection (the manager
    /// slot frees up) from an orderly detach (an attached manager keeps its
    /// slot).
    fn teardown_session_footprint(
        &self,
        session: &Arc<ServerSession>,
        conn_id: u64,
        drop_manager: bool,
    ) {
        for (kind, name) in session.take_footprint(conn_id) {
            let Ok(res) = session.resource_membership(kind, &name) else {
                // Destroyed since it was touched; nothing to unwind.
                continue;
            };
            let m = res.membership();
            for client in m.conn_clients(conn_id) {
                if let Some(tok) = res.token() {
                    if let Some(CleanupOutcome::Released(_)) = tok.release_for_cleanup(&client) {
                        self.emit(m, event_mask::RELEASED, Action::Released, &client);
                    }
                }
                if let Some(ch) = res.channel() {
                    ch.remove_consumer_quiet(&client);
                }
                if m.leave_quiet(&client).is_some() {
                    self.emit(m, event_mask::LEFT, Action::Left, &client);
                }
            }
            if drop_manager {
                m.drop_manager_conn(conn_id);
            }
            m.remove_conn_listeners(conn_id);
        }

        let m = &session.membership;
        for client in m.conn_clients(conn_id) {
            if m.leave_quiet(&client).is_some() {
                self.emit(m, event_mask::LEFT, Action::Left, &client);
            }
        }
        if drop_manager {
            m.drop_manager_conn(conn_id);
        }
        m.remove_conn_listeners(conn_id);
    }
}

impl InboundHandler for ServerHandler {
    fn on_frame(
        &self,
        conn: Arc<Connection>,
        frame: Frame,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            if frame.request_id == 0 {
                self.handle_one_way(&conn, &frame).await;
                return;
            }
            let result = self.handle_request(&conn, &frame, false).await;
            self.send_result(&conn, &frame, result).await;
        }
    }

    fn on_closed(&self, conn: Arc<Connection>) -> impl std::future::Future<Output = ()> + Send {
        async move {
            tracing::debug!(conn = conn.id(), label = conn.label(), "connection closed");
            self.cleanup_connection(conn.id()).await;
        }
    }
}
