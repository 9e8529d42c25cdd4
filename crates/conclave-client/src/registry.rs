//! Proxy for the server's registry.

use std::sync::Arc;

use conclave_core::url::SessionUrl;
use conclave_core::wire::{Action, EventMask, ResourceKind, REGISTRY_SESSION};
use conclave_core::{ProtocolError, Status};

use crate::client::ClientInner;
use crate::events::{ResourceManager, SessionEvents};
use crate::membership::MembershipOps;

/// The registry's well-known resource name.
const REGISTRY_NAME: &str = "registry";

pub struct RegistryProxy {
    ops: MembershipOps,
}

impl RegistryProxy {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self {
            ops: MembershipOps::new(
                inner,
                REGISTRY_SESSION,
                ResourceKind::Registry,
                REGISTRY_NAME.to_string(),
            ),
        }
    }

    fn inner(&self) -> &Arc<ClientInner> {
        &self.ops.inner
    }

    /// Bind `url` to an existing session number.
    pub async fn bind(&self, url: &SessionUrl, session: u16) -> Result<(), ProtocolError> {
        self.inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::Bind, |w| {
                w.put_string(&url.to_string()).put_u16(session);
            })
            .await?;
        Ok(())
    }

    /// Remove a binding this connection owns.
    pub async fn unbind(&self, url: &SessionUrl) -> Result<(), ProtocolError> {
        self.inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::Unbind, |w| {
                w.put_string(&url.to_string());
            })
            .await?;
        Ok(())
    }

    /// The session number bound to `url`.
    pub async fn lookup(&self, url: &SessionUrl) -> Result<u16, ProtocolError> {
        let mut r = self
            .inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::Lookup, |w| {
                w.put_string(&url.to_string());
            })
            .await?;
        Ok(r.get_u16()?)
    }

    /// Every bound URL, sorted.
    pub async fn list(&self) -> Result<Vec<String>, ProtocolError> {
        let mut r = self
            .inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::List, |_| {})
            .await?;
        Ok(r.get_string_list()?)
    }

    pub async fn exists(&self, url: &SessionUrl) -> Result<bool, ProtocolError> {
        let mut r = self
            .inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::Exists, |w| {
                w.put_string(&url.to_string());
            })
            .await?;
        Ok(r.get_bool()?)
    }

    /// A round trip that proves the server answers.
    pub async fn is_alive(&self) -> Result<(), ProtocolError> {
        self.inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::IsAlive, |_| {})
            .await?;
        Ok(())
    }

    /// Ask the server to shut down.
    pub async fn stop(&self) -> Result<(), ProtocolError> {
        self.inner()
            .call(REGISTRY_SESSION, ResourceKind::Registry, Action::Stop, |_| {})
            .await?;
        Ok(())
    }

    // ── membership on the registry itself ────────────────────────────────

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
