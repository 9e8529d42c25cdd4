//! Proxy for a message channel.

use std::net::SocketAddr;
use std::sync::Arc;

use conclave_core::wire::{Action, EventMask, Frame, ResourceKind};
use conclave_core::{ProtocolError, Status};

use crate::client::ClientInner;
use crate::events::{ChannelConsumer, ResourceManager, SessionEvents};
use crate::membership::MembershipOps;
use crate::wire_util::payload;

pub struct ChannelProxy {
    ops: MembershipOps,
}

impl ChannelProxy {
    pub(crate) fn new(inner: Arc<ClientInner>, session: u16, name: String) -> Self {
        Self {
            ops: MembershipOps::new(inner, session, ResourceKind::Channel, name),
        }
    }

    pub fn name(&self) -> &str {
        &self.ops.name
    }

    fn inner(&self) -> &Arc<ClientInner> {
        &self.ops.inner
    }

    /// Register this client as a consumer. Unreliable consumers receive
    /// over the datagram endpoint, which must be bound first (the local
    /// port is announced here).
    pub async fn add_consumer(
        &self,
        reliable: bool,
        consumer: Arc<dyn ChannelConsumer>,
    ) -> Result<(), ProtocolError> {
        let port = self.inner().datagram_port();
        if !reliable && port == 0 {
            return Err(ProtocolError::InvalidClient);
        }
        self.inner()
            .call(self.ops.session, ResourceKind::Channel, Action::AddConsumer, |w| {
                w.put_string(&self.ops.name)
                    .put_string(self.inner().name())
                    .put_bool(reliable)
                    .put_u16(port);
            })
            .await?;
        self.inner().handler.add_consumer(
            self.ops.session,
            self.ops.name.clone(),
            self.inner().name().to_string(),
            consumer,
        );
        Ok(())
    }

    pub async fn remove_consumer(&self) -> Result<(), ProtocolError> {
        self.inner()
            .call(self.ops.session, ResourceKind::Channel, Action::RemoveConsumer, |w| {
                w.put_string(&self.ops.name).put_string(self.inner().name());
            })
            .await?;
        self.inner()
            .handler
            .remove_consumer(self.ops.session, &self.ops.name, self.inner().name());
        Ok(())
    }

    /// Send to every consumer except this client. The server acknowledges
    /// acceptance, not delivery.
    pub async fn send(&self, data: &[u8]) -> Result<(), ProtocolError> {
        self.inner()
            .call(self.ops.session, ResourceKind::Channel, Action::Send, |w| {
                w.put_string(&self.ops.name)
                    .put_string(self.inner().name())
                    .put_bytes(data);
            })
            .await?;
        Ok(())
    }

    /// Fire-and-forget send over the datagram endpoint: no acknowledgement,
    /// no delivery guarantee. Requires a bound endpoint.
    pub async fn send_datagram(
        &self,
        server: SocketAddr,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let endpoint = self
            .inner()
            .datagram()
            .ok_or(ProtocolError::InvalidClient)?;
        let body = payload(|w| {
            w.put_string(&self.ops.name)
                .put_string(self.inner().name())
                .put_bytes(data);
        });
        let frame = Frame::push(self.ops.session, ResourceKind::Channel, Action::Send, body);
        endpoint
            .send_to(&frame, server)
            .await
            .map_err(|_| ProtocolError::ConnectionFailure)?;
        Ok(())
    }

    pub async fn consumer_names(&self) -> Result<Vec<String>, ProtocolError> {
        let mut r = self
            .inner()
            .call(
                self.ops.session,
                ResourceKind::Channel,
                Action::ListConsumerNames,
                |w| {
                    w.put_string(&self.ops.name);
                },
            )
            .await?;
        Ok(r.get_string_list()?)
    }

    pub async fn destroy(&self) -> Result<(), ProtocolError> {
        self.ops.destroy().await
    }

    // ── membership ───────────────────────────────────────────────────────

    pub async fn join(&self) -> Result<(), ProtocolError> {
        self.ops.join().await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.ops.leave().await
    }

    pub async fn invite(&self, invitee: &str) -> Result<(), ProtocolError> {
        self.ops.invite(invitee).await
    }

    pub async fn expel(&self, clients: &[&str]) -> Result<Vec<Status>, ProtocolError> {
        self.ops.expel(clients).await
    }

    pub async fn add_listener(
        &self,
        mask: EventMask,
        callback: Arc<dyn SessionEvents>,
    ) -> Result<u32, ProtocolError> {
        let id = self.ops.add_listener_raw(mask).await?;
        self.inner()
            .handler
            .add_membership_listener(self.ops.key(), id, mask, callback);
        Ok(id)
    }

    pub async fn remove_listener(&self, id: u32) -> Result<(), ProtocolError> {
        self.ops.remove_listener(id).await
    }

    pub async fn attach_manager(
        &self,
        mask: EventMask,
        manager: Arc<dyn ResourceManager>,
    ) -> Result<(), ProtocolError> {
        self.ops.attach_manager(mask, manager).await
    }

    pub async fn is_managed(&self) -> Result<bool, ProtocolError> {
        self.ops.is_managed().await
    }

    pub async fn change_manager_mask(&self, mask: EventMask) -> Result<(), ProtocolError> {
        self.ops.change_manager_mask(mask).await
    }

    pub async fn client_names(&self) -> Result<Vec<String>, ProtocolError> {
        self.ops.client_names().await
    }
}
