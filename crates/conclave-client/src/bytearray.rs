//! Proxy for a shared byte array.

use std::sync::Arc;

use bytes::Bytes;

use conclave_core::wire::{Action, EventMask, ResourceKind};
use conclave_core::{ProtocolError, Status};

use crate::client::ClientInner;
use crate::events::{ByteArrayEvents, ResourceManager};
use crate::membership::MembershipOps;

pub struct ByteArrayProxy {
    ops: MembershipOps,
}

impl ByteArrayProxy {
    pub(crate) fn new(inner: Arc<ClientInner>, session: u16, name: String) -> Self {
        Self {
            ops: MembershipOps::new(inner, session, ResourceKind::ByteArray, name),
        }
    }

    pub fn name(&self) -> &str {
        &self.ops.name
    }

    fn inner(&self) -> &Arc<ClientInner> {
        &self.ops.inner
    }

    /// Replace the whole value. Every listener with the VALUE_CHANGED bit
    /// hears about it, this client included.
    pub async fn set_value(&self, value: &[u8]) -> Result<(), ProtocolError> {
        self.inner()
            .call(self.ops.session, ResourceKind::ByteArray, Action::SetValue, |w| {
                w.put_string(&self.ops.name)
                    .put_string(self.inner().name())
                    .put_bytes(value);
            })
            .await?;
        Ok(())
    }

    /// Read the current value. Re-creation is idempotent and the reply
    /// carries the live contents, so this is a create with no initial
    /// value.
    pub async fn fetch_value(&self) -> Result<Bytes, ProtocolError> {
        let mut r = self
            .inner()
            .call(
                self.ops.session,
                ResourceKind::Session,
                Action::CreateByteArray,
                |w| {
                    w.put_string(&self.ops.name)
                        .put_string(self.inner().name())
                        .put_bytes(&[]);
                },
            )
            .await?;
        Ok(r.get_bytes()?)
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
        callback: Arc<dyn ByteArrayEvents>,
    ) -> Result<u32, ProtocolError> {
        let id = self.ops.add_listener_raw(mask).await?;
        self.inner()
            .handler
            .add_byte_array_listener(self.ops.key(), id, mask, callback);
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
