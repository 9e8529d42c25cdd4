//! Proxy for one session and the resources it contains.

use std::sync::Arc;

use conclave_core::wire::{Action, EventMask, ResourceKind};
use conclave_core::{ProtocolError, Status};

use crate::bytearray::ByteArrayProxy;
use crate::channel::ChannelProxy;
use crate::client::ClientInner;
use crate::events::{ResourceManager, SessionEvents};
use crate::membership::MembershipOps;
use crate::token::TokenProxy;

pub struct SessionProxy {
    ops: MembershipOps,
    number: u16,
}

impl SessionProxy {
    pub(crate) fn new(inner: Arc<ClientInner>, number: u16, name: String) -> Self {
        Self {
            ops: MembershipOps::new(inner, number, ResourceKind::Session, name),
            number,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.ops.name
    }

    fn inner(&self) -> &Arc<ClientInner> {
        &self.ops.inner
    }

    // ── resource creation and lookup ─────────────────────────────────────

    /// Create (or re-open) a byte array. Creation joins this client; when
    /// the array already exists `initial` is ignored and the live value is
    /// returned instead.
    pub async fn create_byte_array(
        &self,
        name: &str,
        initial: &[u8],
    ) -> Result<(ByteArrayProxy, bytes::Bytes), ProtocolError> {
        let mut r = self
            .inner()
            .call(self.number, ResourceKind::Session, Action::CreateByteArray, |w| {
                w.put_string(name)
                    .put_string(self.inner().name())
                    .put_bytes(initial);
            })
            .await?;
        let value = r.get_bytes()?;
        let proxy = ByteArrayProxy::new(self.inner().clone(), self.number, name.to_string());
        Ok((proxy, value))
    }

    /// Create (or re-open) a channel; creation joins this client.
    pub async fn create_channel(&self, name: &str) -> Result<ChannelProxy, ProtocolError> {
        self.inner()
            .call(self.number, ResourceKind::Session, Action::CreateChannel, |w| {
                w.put_string(name).put_string(self.inner().name());
            })
            .await?;
        Ok(ChannelProxy::new(self.inner().clone(), self.number, name.to_string()))
    }

    /// Create (or re-open) a token; creation joins this client.
    pub async fn create_token(&self, name: &str) -> Result<TokenProxy, ProtocolError> {
        self.inner()
            .call(self.number, ResourceKind::Session, Action::CreateToken, |w| {
                w.put_string(name).put_string(self.inner().name());
            })
            .await?;
        Ok(TokenProxy::new(self.inner().clone(), self.number, name.to_string()))
    }

    pub async fn byte_array_exists(&self, name: &str) -> Result<bool, ProtocolError> {
        self.exists_query(Action::ByteArrayExists, name).await
    }

    pub async fn channel_exists(&self, name: &str) -> Result<bool, ProtocolError> {
        self.exists_query(Action::ChannelExists, name).await
    }

    pub async fn token_exists(&self, name: &str) -> Result<bool, ProtocolError> {
        self.exists_query(Action::TokenExists, name).await
    }

    pub async fn byte_array_joined(&self, name: &str, client: &str) -> Result<bool, ProtocolError> {
        self.joined_query(Action::ByteArrayJoined, name, client).await
    }

    pub async fn channel_joined(&self, name: &str, client: &str) -> Result<bool, ProtocolError> {
        self.joined_query(Action::ChannelJoined, name, client).await
    }

    pub async fn token_joined(&self, name: &str, client: &str) -> Result<bool, ProtocolError> {
        self.joined_query(Action::TokenJoined, name, client).await
    }

    pub async fn byte_array_names(&self) -> Result<Vec<String>, ProtocolError> {
        self.names_query(Action::ListByteArrayNames).await
    }

    pub async fn channel_names(&self) -> Result<Vec<String>, ProtocolError> {
        self.names_query(Action::ListChannelNames).await
    }

    pub async fn token_names(&self) -> Result<Vec<String>, ProtocolError> {
        self.names_query(Action::ListTokenNames).await
    }

    /// Detach this client's connection from the session. Memberships,
    /// token holds, and consumer registrations are released; the session
    /// itself and its resources survive.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.inner()
            .call(self.number, ResourceKind::Session, Action::Close, |w| {
                w.put_string(&self.ops.name).put_string(self.inner().name());
            })
            .await?;
        Ok(())
    }

    /// Destroy the session and everything in it.
    pub async fn destroy(&self) -> Result<(), ProtocolError> {
        self.ops.destroy().await
    }

    async fn exists_query(&self, action: Action, name: &str) -> Result<bool, ProtocolError> {
        let mut r = self
            .inner()
            .call(self.number, ResourceKind::Session, action, |w| {
                w.put_string(name);
            })
            .await?;
        Ok(r.get_bool()?)
    }

    async fn joined_query(
        &self,
        action: Action,
        name: &str,
        client: &str,
    ) -> Result<bool, ProtocolError> {
        let mut r = self
            .inner()
            .call(self.number, ResourceKind::Session, action, |w| {
                w.put_string(name).put_string(client);
            })
            .await?;
        Ok(r.get_bool()?)
    }

    async fn names_query(&self, action: Action) -> Result<Vec<String>, ProtocolError> {
        let mut r = self
            .inner()
            .call(self.number, ResourceKind::Session, action, |_| {})
            .await?;
        Ok(r.get_string_list()?)
    }

    // ── session membership ───────────────────────────────────────────────

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
